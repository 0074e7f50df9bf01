//! Core data types shared across the run queue, backends and schedulers.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifies a conversation scope: a surface (channel) and an optional
/// sub-scope (thread) inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId {
    pub surface_id: String,
    pub sub_scope_id: Option<String>,
}

impl ContextId {
    pub fn new(surface_id: impl Into<String>) -> Self {
        Self {
            surface_id: surface_id.into(),
            sub_scope_id: None,
        }
    }

    pub fn with_sub_scope(surface_id: impl Into<String>, sub_scope_id: impl Into<String>) -> Self {
        Self {
            surface_id: surface_id.into(),
            sub_scope_id: Some(sub_scope_id.into()),
        }
    }

    /// Parse a snapshot key (`surface` or `surface:sub`).
    pub fn parse(key: &str) -> Self {
        match key.split_once(':') {
            Some((surface, sub)) if !sub.is_empty() => Self::with_sub_scope(surface, sub),
            Some((surface, _)) => Self::new(surface),
            None => Self::new(key),
        }
    }

    /// Key used in the persisted snapshot and in every per-context table.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub_scope_id {
            Some(sub) => write!(f, "{}:{}", self.surface_id, sub),
            None => write!(f, "{}", self.surface_id),
        }
    }
}

/// Which subprocess wire protocol a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Claude Code CLI, `stream-json` output (protocol A)
    Claude,
    /// Codex CLI, `exec --json` JSONL output (protocol B)
    Codex,
}

impl BackendKind {
    /// Select the backend for a model id.
    pub fn for_model(model: &str) -> Self {
        let lower = model.trim().to_lowercase();
        let mut chars = lower.chars();
        let o_series = chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit());
        if lower.starts_with("gpt") || lower.contains("codex") || o_series {
            Self::Codex
        } else {
            Self::Claude
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to run the agent once for a context.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub prompt: String,
    /// Caller explicitly asks to continue the stored session
    pub continuation: bool,
    /// Heartbeat tick or callback fire rather than a human message
    pub autonomous: bool,
    pub model_override: Option<String>,
    pub image_paths: Vec<PathBuf>,
}

impl RunRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn autonomous(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            autonomous: true,
            ..Default::default()
        }
    }

    pub fn with_continuation(mut self, continuation: bool) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    pub fn with_images(mut self, paths: Vec<PathBuf>) -> Self {
        self.image_paths = paths;
        self
    }
}

/// A one-shot future run requested by the agent itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledCallback {
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    pub prompt: String,
}

impl ScheduledCallback {
    pub fn new(delay: Duration, prompt: impl Into<String>) -> Self {
        Self {
            delay,
            prompt: prompt.into(),
        }
    }
}

/// Token counts reported by backends that do not report currency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Outcome of exactly one run request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub display_text: String,
    pub duration_ms: u64,
    /// Zero for backends that only report token usage
    pub cost_usd: f64,
    pub is_error: bool,
    pub session_id: Option<String>,
    pub created_files: Vec<PathBuf>,
    pub image_files: Vec<PathBuf>,
    pub upload_files: Vec<PathBuf>,
    pub callbacks: Vec<ScheduledCallback>,
    pub usage: Option<TokenUsage>,
}

impl RunResult {
    /// Create an agent-level error result.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            display_text: message.into(),
            is_error: true,
            ..Default::default()
        }
    }
}

/// What triggered an autonomous run, for presentation and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomousSource {
    Heartbeat,
    Callback,
}

impl AutonomousSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Callback => "callback",
        }
    }
}

impl fmt::Display for AutonomousSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
