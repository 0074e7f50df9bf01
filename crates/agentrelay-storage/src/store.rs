//! Session store trait shared by every snapshot backend.

use async_trait::async_trait;

use crate::error::Result;
use crate::records::ContextRecord;

/// In-place edit applied to a record while the store holds its lock.
pub type RecordMutation = Box<dyn FnOnce(&mut ContextRecord) + Send>;

/// Persistence boundary for conversation contexts.
///
/// Implementations must apply [`SessionStore::update`] atomically with
/// respect to other calls on the same store, so a read-modify-write never
/// loses a concurrent edit.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a context record.
    async fn get(&self, key: &str) -> Result<Option<ContextRecord>>;

    /// Fetch a context record, creating and persisting a fresh one if absent.
    async fn get_or_create(&self, key: &str) -> Result<ContextRecord>;

    /// Apply a mutation to a record (created if absent) and persist it.
    async fn update(&self, key: &str, mutation: RecordMutation) -> Result<ContextRecord>;

    /// Remove a record. Returns the removed record, if any.
    async fn remove(&self, key: &str) -> Result<Option<ContextRecord>>;

    /// All persisted records, ordered by key.
    async fn list(&self) -> Result<Vec<(String, ContextRecord)>>;

    /// Process-wide model override.
    async fn global_model(&self) -> Result<Option<String>>;

    async fn set_global_model(&self, model: Option<String>) -> Result<()>;
}
