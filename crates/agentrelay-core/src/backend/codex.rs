//! Codex CLI backend (`codex exec --json`).
//!
//! Codex has no flag for inline system instructions, so they are written to
//! a temporary file and passed by reference. The provider reports token
//! usage but no currency figure, so runs on this backend cost `0`.

use std::io::Write;
use std::path::Path;

use serde::Deserialize;
use tempfile::NamedTempFile;

use crate::models::TokenUsage;

use super::BackendOptions;
use super::accumulator::{AccumulatedRun, StreamAccumulator};

/// Build the argument list for one `codex` invocation.
///
/// `instructions_file` is the side-channel file holding the system prompt,
/// if one was written.
pub fn build_args(options: &BackendOptions, instructions_file: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "--json".to_string(),
        "--color".to_string(),
        "never".to_string(),
        "--skip-git-repo-check".to_string(),
    ];

    if let Some(model) = &options.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    if options.plan_mode {
        args.push("--sandbox".to_string());
        args.push("read-only".to_string());
    } else {
        args.push("--full-auto".to_string());
    }

    if let Some(path) = instructions_file {
        args.push("-c".to_string());
        args.push(format!("experimental_instructions_file=\"{}\"", path.display()));
    }

    for image in &options.image_paths {
        args.push("--image".to_string());
        args.push(image.display().to_string());
    }

    if options.continuation {
        args.push("resume".to_string());
        args.push(options.session_id.clone());
    }

    args.push(options.prompt.clone());
    args
}

/// Write the system prompt to a temporary instructions file.
///
/// The file is deleted when the returned handle is dropped.
pub fn write_instructions(system_prompt: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("agentrelay-instructions-")
        .suffix(".md")
        .tempfile()?;
    file.write_all(system_prompt.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CodexEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "item.updated")]
    ItemUpdated { item: CodexItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: Option<CodexUsage>,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed {
        #[serde(default)]
        error: Option<ErrorPayload>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CodexItem {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", alias = "item_type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    changes: Vec<FileChange>,
}

#[derive(Debug, Deserialize)]
struct FileChange {
    path: String,
}

#[derive(Debug, Deserialize)]
struct CodexUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    cached_input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: Option<String>,
}

/// Accumulator for the exec JSONL protocol.
#[derive(Debug, Default)]
pub struct CodexAccumulator {
    state: AccumulatedRun,
    /// Agent messages in arrival order; an update to a known item id
    /// replaces that entry instead of appending
    messages: Vec<(Option<String>, String)>,
}

impl CodexAccumulator {
    fn apply_item(&mut self, item: CodexItem) {
        match item.kind.as_str() {
            "agent_message" | "assistant_message" => {
                let Some(text) = item.text.filter(|t| !t.trim().is_empty()) else {
                    return;
                };
                let existing = item.id.as_ref().and_then(|id| {
                    self.messages
                        .iter_mut()
                        .find(|(known, _)| known.as_ref() == Some(id))
                });
                match existing {
                    Some((_, slot)) => *slot = text,
                    None => self.messages.push((item.id, text)),
                }
                self.state.text = self
                    .messages
                    .iter()
                    .map(|(_, text)| text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
            }
            "file_change" => {
                for change in item.changes {
                    self.state.record_file(&change.path);
                }
            }
            _ => {}
        }
    }
}

impl StreamAccumulator for CodexAccumulator {
    fn apply_line(&mut self, line: &str) -> serde_json::Result<()> {
        match serde_json::from_str::<CodexEvent>(line)? {
            CodexEvent::ThreadStarted { thread_id } => {
                self.state.session_id = Some(thread_id);
            }
            CodexEvent::ItemUpdated { item } | CodexEvent::ItemCompleted { item } => {
                self.apply_item(item);
            }
            CodexEvent::TurnCompleted { usage } => {
                if let Some(usage) = usage {
                    self.state.add_usage(TokenUsage {
                        input_tokens: usage.input_tokens,
                        cached_input_tokens: usage.cached_input_tokens,
                        output_tokens: usage.output_tokens,
                    });
                }
            }
            CodexEvent::TurnFailed { error } => {
                self.state.error = Some(
                    error
                        .and_then(|e| e.message)
                        .unwrap_or_else(|| "Codex turn failed".to_string()),
                );
            }
            CodexEvent::Error { message } => {
                self.state.error = Some(message.unwrap_or_else(|| "Codex reported an error".to_string()));
            }
            CodexEvent::Other => {}
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn options() -> BackendOptions {
        BackendOptions {
            session_id: "thread_42".to_string(),
            working_dir: PathBuf::from("/tmp"),
            prompt: "describe the screenshot".to_string(),
            continuation: false,
            system_prompt: Some("Be brief.".to_string()),
            model: Some("gpt-5-codex".to_string()),
            plan_mode: false,
            image_paths: vec![PathBuf::from("/tmp/a.png"), PathBuf::from("/tmp/b.jpg")],
        }
    }

    #[test]
    fn test_build_args_new_thread_with_images() {
        let args = build_args(&options(), Some(Path::new("/tmp/instr.md")));
        assert_eq!(
            args,
            vec![
                "exec",
                "--json",
                "--color",
                "never",
                "--skip-git-repo-check",
                "--model",
                "gpt-5-codex",
                "--full-auto",
                "-c",
                "experimental_instructions_file=\"/tmp/instr.md\"",
                "--image",
                "/tmp/a.png",
                "--image",
                "/tmp/b.jpg",
                "describe the screenshot",
            ]
        );
    }

    #[test]
    fn test_build_args_resume_read_only() {
        let mut opts = options();
        opts.continuation = true;
        opts.plan_mode = true;
        opts.image_paths.clear();

        let args = build_args(&opts, None);
        assert!(args.windows(2).any(|w| w == ["--sandbox", "read-only"]));
        assert!(!args.iter().any(|a| a == "--full-auto"));
        assert!(!args.iter().any(|a| a == "-c"));
        let tail = &args[args.len() - 3..];
        assert_eq!(tail, ["resume", "thread_42", "describe the screenshot"]);
    }

    #[test]
    fn test_instructions_file_is_removed_on_drop() {
        let file = write_instructions("system rules").unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "system rules");
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_accumulator_full_stream() {
        let lines = [
            r#"{"type":"thread.started","thread_id":"0199-thread"}"#,
            r#"{"type":"turn.started"}"#,
            r#"{"type":"item.started","item":{"id":"item_0","type":"command_execution","command":"ls"}}"#,
            r#"{"type":"item.completed","item":{"id":"item_1","type":"agent_message","text":"Looking at the repo."}}"#,
            r#"{"type":"item.completed","item":{"id":"item_2","type":"file_change","changes":[{"path":"src/a.rs","kind":"update"},{"path":"docs/plot.svg","kind":"add"}]}}"#,
            r#"{"type":"item.completed","item":{"id":"item_3","type":"file_change","changes":[{"path":"src/a.rs","kind":"update"}]}}"#,
            r#"{"type":"item.completed","item":{"id":"item_4","type":"agent_message","text":"Updated a.rs."}}"#,
            r#"{"type":"turn.completed","usage":{"input_tokens":1200,"cached_input_tokens":800,"output_tokens":95}}"#,
        ];

        let mut acc = CodexAccumulator::default();
        for line in lines {
            acc.apply_line(line).unwrap();
        }

        let state = Box::new(acc).into_state();
        assert_eq!(state.session_id.as_deref(), Some("0199-thread"));
        assert_eq!(state.text, "Looking at the repo.\n\nUpdated a.rs.");
        assert_eq!(
            state.created_files,
            vec![PathBuf::from("src/a.rs"), PathBuf::from("docs/plot.svg")]
        );
        assert_eq!(state.cost_usd, 0.0);
        assert_eq!(
            state.usage,
            Some(TokenUsage {
                input_tokens: 1200,
                cached_input_tokens: 800,
                output_tokens: 95,
            })
        );
        assert!(state.error.is_none());
    }

    #[test]
    fn test_item_updates_replace_by_id() {
        let mut acc = CodexAccumulator::default();
        acc.apply_line(r#"{"type":"item.updated","item":{"id":"m1","type":"agent_message","text":"Hel"}}"#)
            .unwrap();
        acc.apply_line(r#"{"type":"item.completed","item":{"id":"m1","type":"agent_message","text":"Hello"}}"#)
            .unwrap();
        assert_eq!(acc.state().text, "Hello");
    }

    #[test]
    fn test_failures_are_captured() {
        let mut acc = CodexAccumulator::default();
        acc.apply_line(r#"{"type":"turn.failed","error":{"message":"You've hit your usage limit."}}"#)
            .unwrap();
        assert_eq!(acc.state().error.as_deref(), Some("You've hit your usage limit."));

        let mut acc = CodexAccumulator::default();
        acc.apply_line(r#"{"type":"error","message":"stream disconnected"}"#)
            .unwrap();
        assert_eq!(acc.state().error.as_deref(), Some("stream disconnected"));
    }
}
