//! Error types for the storage layer

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Snapshot at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
