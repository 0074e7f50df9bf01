//! JSON file session store.
//!
//! The whole snapshot is held in memory and rewritten on every mutation.
//! Writes go to a sibling temp file first and are renamed into place, so a
//! crash mid-write leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::records::{ContextRecord, Snapshot};
use crate::store::{RecordMutation, SessionStore};

/// Session store backed by a single JSON file.
pub struct JsonSessionStore {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl JsonSessionStore {
    /// Open the store, loading the snapshot if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = Self::read_snapshot(&path).await?;

        info!(
            path = %path.display(),
            contexts = snapshot.contexts.len(),
            "Opened session snapshot"
        );

        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_snapshot(path: &Path) -> Result<Snapshot> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::default()),
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(Snapshot::default());
        }

        serde_json::from_str(&content).map_err(|e| StorageError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec_pretty(snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        debug!(
            path = %self.path.display(),
            bytes = data.len(),
            "Persisted session snapshot"
        );
        Ok(())
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn get(&self, key: &str) -> Result<Option<ContextRecord>> {
        Ok(self.snapshot.lock().await.contexts.get(key).cloned())
    }

    async fn get_or_create(&self, key: &str) -> Result<ContextRecord> {
        let mut snapshot = self.snapshot.lock().await;
        if let Some(record) = snapshot.contexts.get(key) {
            return Ok(record.clone());
        }

        let record = ContextRecord::new();
        snapshot.contexts.insert(key.to_string(), record.clone());
        self.persist(&snapshot).await?;
        info!(context = %key, session_id = %record.session_id, "Created context");
        Ok(record)
    }

    async fn update(&self, key: &str, mutation: RecordMutation) -> Result<ContextRecord> {
        let mut snapshot = self.snapshot.lock().await;
        let record = snapshot
            .contexts
            .entry(key.to_string())
            .or_insert_with(ContextRecord::new);
        mutation(record);
        record.touch();
        let updated = record.clone();
        self.persist(&snapshot).await?;
        Ok(updated)
    }

    async fn remove(&self, key: &str) -> Result<Option<ContextRecord>> {
        let mut snapshot = self.snapshot.lock().await;
        let removed = snapshot.contexts.remove(key);
        if removed.is_some() {
            self.persist(&snapshot).await?;
        }
        Ok(removed)
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
        let mut snapshot = self.snapshot.lock().await;
        snapshot.global_model = model;
        self.persist(&snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::HeartbeatSettings;

    #[tokio::test]
    async fn test_missing_file_opens_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::open(temp_dir.path().join("state.json"))
            .await
            .unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.global_model().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("state.json");

        let session_id = {
            let store = JsonSessionStore::open(&path).await.unwrap();
            let record = store.get_or_create("chan:thread").await.unwrap();
            store
                .update(
                    "chan:thread",
                    Box::new(|r| {
                        r.message_count = 3;
                        r.total_cost_usd = 0.25;
                        r.heartbeat = Some(HeartbeatSettings::new(30_000, "status?"));
                    }),
                )
                .await
                .unwrap();
            store
                .set_global_model(Some("gpt-5-codex".to_string()))
                .await
                .unwrap();
            record.session_id
        };

        let reopened = JsonSessionStore::open(&path).await.unwrap();
        let record = reopened.get("chan:thread").await.unwrap().unwrap();
        assert_eq!(record.session_id, session_id);
        assert_eq!(record.message_count, 3);
        assert_eq!(record.total_cost_usd, 0.25);
        assert!(record.heartbeat_enabled());
        assert_eq!(
            reopened.global_model().await.unwrap(),
            Some("gpt-5-codex".to_string())
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = JsonSessionStore::open(&path).await.err().unwrap();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_remove_persists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("state.json");

        let store = JsonSessionStore::open(&path).await.unwrap();
        store.get_or_create("gone").await.unwrap();
        store.remove("gone").await.unwrap();

        let reopened = JsonSessionStore::open(&path).await.unwrap();
        assert!(reopened.get("gone").await.unwrap().is_none());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
