//! Process-local session store.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::records::{ContextRecord, Snapshot};
use crate::store::{RecordMutation, SessionStore};

/// Session store that keeps the snapshot in memory only.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    snapshot: Mutex<Snapshot>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing snapshot.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Copy of the current snapshot.
    pub async fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().await.clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<ContextRecord>> {
        Ok(self.snapshot.lock().await.contexts.get(key).cloned())
    }

    async fn get_or_create(&self, key: &str) -> Result<ContextRecord> {
        let mut snapshot = self.snapshot.lock().await;
        Ok(snapshot
            .contexts
            .entry(key.to_string())
            .or_insert_with(ContextRecord::new)
            .clone())
    }

    async fn update(&self, key: &str, mutation: RecordMutation) -> Result<ContextRecord> {
        let mut snapshot = self.snapshot.lock().await;
        let record = snapshot
            .contexts
            .entry(key.to_string())
            .or_insert_with(ContextRecord::new);
        mutation(record);
        record.touch();
        Ok(record.clone())
    }

    async fn remove(&self, key: &str) -> Result<Option<ContextRecord>> {
        Ok(self.snapshot.lock().await.contexts.remove(key))
    }

    async fn list(&self) -> Result<Vec<(String, ContextRecord)>> {
        let snapshot = self.snapshot.lock().await;
        Ok(snapshot
            .contexts
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }

    async fn global_model(&self) -> Result<Option<String>> {
        Ok(self.snapshot.lock().await.global_model.clone())
    }

    async fn set_global_model(&self, model: Option<String>) -> Result<()> {
        self.snapshot.lock().await.global_model = model;
        Ok(())
    }
}
