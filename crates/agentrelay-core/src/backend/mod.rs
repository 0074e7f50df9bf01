//! Agent CLI backends.
//!
//! A backend owns exactly one subprocess invocation. Both wire protocols sit
//! behind [`AgentBackend`], so callers never branch on which one they hold:
//!
//! - [`claude`] - Claude Code, `stream-json` events
//! - [`codex`] - Codex, `exec --json` JSONL events

pub mod accumulator;
pub mod claude;
pub mod codex;
pub mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::models::{BackendKind, RunResult};

pub use accumulator::{AccumulatedRun, LineBuffer, StreamAccumulator, accumulator_for};
pub use process::BackendProcess;

/// Extensions classified as images for downstream auto-attachment.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "bmp"];

/// Option set shared by both backends.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Session to start (Claude) or resume (both, when `continuation`)
    pub session_id: String,
    pub working_dir: PathBuf,
    pub prompt: String,
    pub continuation: bool,
    /// Appended system instructions
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    /// Review-before-apply instead of autonomous apply
    pub plan_mode: bool,
    /// Native vision inputs. Only Codex consumes these.
    pub image_paths: Vec<PathBuf>,
}

/// One agent invocation.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Spawn the subprocess and drive it to completion.
    ///
    /// Resolves to an error result when the agent itself reports failure;
    /// rejects only on infrastructure failure.
    async fn run(&self) -> Result<RunResult>;

    /// Latest accumulated text.
    fn current_text(&self) -> String;

    /// Ask the running subprocess to terminate.
    fn kill(&self);

    /// Text updates, one per incremental decode that changed the text.
    fn subscribe(&self) -> watch::Receiver<String>;
}

/// Builds a backend for a single run.
pub trait BackendFactory: Send + Sync {
    fn create(&self, kind: BackendKind, options: BackendOptions) -> Arc<dyn AgentBackend>;
}

/// Binaries used to launch each backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub claude_binary: String,
    pub codex_binary: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            claude_binary: "claude".to_string(),
            codex_binary: "codex".to_string(),
        }
    }
}

impl BackendConfig {
    pub fn binary_for(&self, kind: BackendKind) -> &str {
        match kind {
            BackendKind::Claude => &self.claude_binary,
            BackendKind::Codex => &self.codex_binary,
        }
    }
}

/// Factory that launches the real CLIs.
#[derive(Debug, Clone, Default)]
pub struct CliBackendFactory {
    config: BackendConfig,
}

impl CliBackendFactory {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

impl BackendFactory for CliBackendFactory {
    fn create(&self, kind: BackendKind, options: BackendOptions) -> Arc<dyn AgentBackend> {
        Arc::new(BackendProcess::new(
            kind,
            self.config.binary_for(kind),
            options,
        ))
    }
}

/// Whether a path has one of the [`IMAGE_EXTENSIONS`].
pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Split tracked files into `(other files, images)`.
pub fn partition_images(files: Vec<PathBuf>) -> (Vec<PathBuf>, Vec<PathBuf>) {
    files.into_iter().partition(|path| !is_image_path(path))
}
