//! Error types for the run engine

use thiserror::Error;

use crate::rate_limit;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// Subprocess exited nonzero without producing any text
    #[error("Agent process exited with code {exit_code}: {stderr}")]
    Infrastructure { exit_code: i32, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] agentrelay_storage::StorageError),

    #[error("Run queue for {0} is closed")]
    QueueClosed(String),

    #[error("Run was cancelled before completion")]
    Cancelled,

    /// The task driving a run aborted unexpectedly
    #[error("Run task failed: {0}")]
    Internal(String),
}

impl RunError {
    /// Whether the error text matches a provider rate-limit/quota signature.
    pub fn is_rate_limited(&self) -> bool {
        rate_limit::is_rate_limited(&self.to_string())
    }
}

/// Result type alias for run operations
pub type Result<T> = std::result::Result<T, RunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_error_detects_rate_limit_text() {
        let err = RunError::Infrastructure {
            exit_code: 1,
            stderr: "Error: 429 Too Many Requests".to_string(),
        };
        assert!(err.is_rate_limited());

        let err = RunError::Infrastructure {
            exit_code: 1,
            stderr: "segfault".to_string(),
        };
        assert!(!err.is_rate_limited());
    }
}
