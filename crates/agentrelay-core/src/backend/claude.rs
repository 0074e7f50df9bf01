//! Claude Code CLI backend (`--output-format stream-json`).
//!
//! Every assistant turn carries the full text of that turn, so the latest
//! text is replaced wholesale rather than appended. The closing `result`
//! event carries duration, cost, the session id and an error flag.

use serde::Deserialize;
use serde_json::Value;

use crate::models::TokenUsage;

use super::BackendOptions;
use super::accumulator::{AccumulatedRun, StreamAccumulator};

/// Tools whose invocation writes a file the user may want attached.
const FILE_WRITING_TOOLS: &[&str] = &["Write", "Edit", "MultiEdit", "NotebookEdit"];

/// Build the argument list for one `claude` invocation.
pub fn build_args(options: &BackendOptions) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];

    if let Some(model) = &options.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    if options.continuation {
        args.push("--resume".to_string());
    } else {
        args.push("--session-id".to_string());
    }
    args.push(options.session_id.clone());

    if let Some(system_prompt) = options.system_prompt.as_deref()
        && !system_prompt.trim().is_empty()
    {
        args.push("--append-system-prompt".to_string());
        args.push(system_prompt.to_string());
    }

    if options.plan_mode {
        args.push("--permission-mode".to_string());
        args.push("plan".to_string());
    } else {
        args.push("--dangerously-skip-permissions".to_string());
    }

    args.push(options.prompt.clone());
    args
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeEvent {
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },
    Result(ResultEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultEvent {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Accumulator for the stream-json protocol.
#[derive(Debug, Default)]
pub struct ClaudeAccumulator {
    state: AccumulatedRun,
}

impl ClaudeAccumulator {
    fn observe_session(&mut self, session_id: Option<String>) {
        if let Some(id) = session_id
            && !id.is_empty()
        {
            self.state.session_id = Some(id);
        }
    }

    fn apply_assistant(&mut self, message: AssistantMessage) {
        let mut turn_text = String::new();
        for block in message.content {
            match block {
                ContentBlock::Text { text } => turn_text.push_str(&text),
                ContentBlock::ToolUse { name, input } => {
                    if !FILE_WRITING_TOOLS.contains(&name.as_str()) {
                        continue;
                    }
                    let path = input
                        .get("file_path")
                        .or_else(|| input.get("notebook_path"))
                        .and_then(|v| v.as_str());
                    if let Some(path) = path {
                        self.state.record_file(path);
                    }
                }
                ContentBlock::Other => {}
            }
        }

        if !turn_text.trim().is_empty() {
            self.state.text = turn_text;
        }
    }

    fn apply_result(&mut self, result: ResultEvent) {
        self.observe_session(result.session_id);
        self.state.duration_ms = result.duration_ms.or(self.state.duration_ms);
        if let Some(cost) = result.total_cost_usd {
            self.state.cost_usd = cost;
        }
        if let Some(usage) = result.usage {
            self.state.add_usage(TokenUsage {
                input_tokens: usage.input_tokens,
                cached_input_tokens: usage.cache_read_input_tokens,
                output_tokens: usage.output_tokens,
            });
        }

        let text = result.result.filter(|t| !t.trim().is_empty());
        if result.is_error {
            self.state.error = Some(text.unwrap_or_else(|| {
                format!(
                    "Agent run failed ({})",
                    result.subtype.as_deref().unwrap_or("error")
                )
            }));
        } else if let Some(text) = text {
            self.state.text = text;
        }
    }
}

impl StreamAccumulator for ClaudeAccumulator {
    fn apply_line(&mut self, line: &str) -> serde_json::Result<()> {
        match serde_json::from_str::<ClaudeEvent>(line)? {
            ClaudeEvent::System { session_id } => self.observe_session(session_id),
            ClaudeEvent::Assistant {
                message,
                session_id,
            } => {
                self.observe_session(session_id);
                self.apply_assistant(message);
            }
            ClaudeEvent::Result(result) => self.apply_result(result),
            ClaudeEvent::Other => {}
        }
        Ok(())
    }

    fn state(&self) -> &AccumulatedRun {
        &self.state
    }

    fn into_state(self: Box<Self>) -> AccumulatedRun {
        self.state
    }
}
