//! AgentRelay Storage - Persisted conversation context snapshot.
//!
//! The snapshot is a flat mapping from context key to a [`ContextRecord`]
//! plus one process-wide model override. It is read at the start of every
//! run and rewritten after every cost/count update and every heartbeat or
//! model mutation.
//!
//! # Stores
//!
//! - [`JsonSessionStore`] - a single JSON file, rewritten atomically
//! - [`MemorySessionStore`] - process-local, used by tests and dry runs

pub mod error;
pub mod json_store;
pub mod memory_store;
pub mod records;
pub mod store;

pub use error::{Result, StorageError};
pub use json_store::JsonSessionStore;
pub use memory_store::MemorySessionStore;
pub use records::{ContextRecord, HeartbeatSettings, Snapshot};
pub use store::{RecordMutation, SessionStore};
