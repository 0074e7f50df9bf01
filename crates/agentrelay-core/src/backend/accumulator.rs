//! Stream accumulation shared by both wire protocols.

use std::path::PathBuf;

use crate::models::{BackendKind, TokenUsage};

use super::{claude::ClaudeAccumulator, codex::CodexAccumulator};

/// Everything folded out of one run's event stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedRun {
    /// Latest agent text
    pub text: String,
    /// Provider session or thread id, once observed
    pub session_id: Option<String>,
    /// Files written or edited by the agent, first-seen order, no duplicates
    pub created_files: Vec<PathBuf>,
    /// Terminal error signalled by the protocol
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub cost_usd: f64,
    pub usage: Option<TokenUsage>,
}

impl AccumulatedRun {
    pub fn record_file(&mut self, path: &str) {
        let path = path.trim();
        if path.is_empty() {
            return;
        }
        let path = PathBuf::from(path);
        if !self.created_files.contains(&path) {
            self.created_files.push(path);
        }
    }

    pub fn add_usage(&mut self, usage: TokenUsage) {
        self.usage.get_or_insert_with(TokenUsage::default).add(&usage);
    }
}

/// Folds decoded protocol events into an [`AccumulatedRun`].
pub trait StreamAccumulator: Send {
    /// Decode one JSON line and fold it in. A decode error leaves the
    /// state untouched.
    fn apply_line(&mut self, line: &str) -> serde_json::Result<()>;

    fn state(&self) -> &AccumulatedRun;

    fn into_state(self: Box<Self>) -> AccumulatedRun;
}

/// Accumulator for a backend's wire protocol.
pub fn accumulator_for(kind: BackendKind) -> Box<dyn StreamAccumulator> {
    match kind {
        BackendKind::Claude => Box::new(ClaudeAccumulator::default()),
        BackendKind::Codex => Box::new(CodexAccumulator::default()),
    }
}

/// Splits a byte stream into whole lines, holding back a partial trailing
/// line until the next chunk (or [`LineBuffer::flush`]) completes it.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);

        lines.retain(|line| !line.is_empty());
        lines
    }

    /// Take whatever partial line is left at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        (!line.is_empty()).then_some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
