//! Terminal surface for autonomous run outcomes.

use agentrelay_core::presenter::{GENERIC_FAILURE_NOTICE, rate_limit_notice};
use agentrelay_core::{ContextId, PresentEvent, Presenter, RunResult};
use async_trait::async_trait;
use colored::Colorize;
use tracing::error;

use crate::output::OutputFormat;
use crate::output::json::print_json;

pub struct TerminalPresenter {
    format: OutputFormat,
}

impl TerminalPresenter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }
}

#[async_trait]
impl Presenter for TerminalPresenter {
    async fn present(&self, context: &ContextId, event: PresentEvent) {
        if self.format.is_json() {
            let line = serde_json::json!({
                "context": context.key(),
                "event": event_json(&event),
            });
            if let Err(e) = print_json(&line) {
                error!(context = %context, error = %e, "Failed to print event");
            }
            return;
        }

        let label = format!("[{} {}]", event.source(), context).cyan().bold();
        match event {
            PresentEvent::Result { result, .. } if result.is_error => {
                println!("{label} {}", result.display_text.red());
            }
            PresentEvent::Result { result, .. } => {
                println!("{label}");
                print_result(&result);
            }
            PresentEvent::RateLimited { resume_in, .. } => {
                println!("{label} {}", rate_limit_notice(resume_in).yellow());
            }
            PresentEvent::Failed { error, .. } => {
                error!(context = %context, error = %error, "Autonomous run failed");
                println!("{label} {}", GENERIC_FAILURE_NOTICE.red());
            }
        }
    }
}

fn event_json(event: &PresentEvent) -> serde_json::Value {
    match event {
        PresentEvent::Result { source, result } => serde_json::json!({
            "type": "result",
            "source": source,
            "result": result,
        }),
        PresentEvent::RateLimited {
            source,
            message,
            resume_in,
        } => serde_json::json!({
            "type": "rate_limited",
            "source": source,
            "message": message,
            "resumeInSecs": resume_in.map(|d| d.as_secs()),
        }),
        PresentEvent::Failed { source, error } => serde_json::json!({
            "type": "failed",
            "source": source,
            "error": error,
        }),
    }
}

/// Print a finished run's text and attachments.
pub fn print_result(result: &RunResult) {
    if !result.display_text.is_empty() {
        println!("{}", result.display_text);
    }
    for path in &result.upload_files {
        println!("{} {}", "upload:".dimmed(), path.display());
    }
    for path in &result.image_files {
        println!("{} {}", "image:".dimmed(), path.display());
    }
    for path in &result.created_files {
        println!("{} {}", "file:".dimmed(), path.display());
    }
    for callback in &result.callbacks {
        println!(
            "{} in {}s: {}",
            "callback".dimmed(),
            callback.delay.as_secs(),
            callback.prompt
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrelay_core::AutonomousSource;
    use std::time::Duration;

    #[test]
    fn test_rate_limited_event_json() {
        let value = event_json(&PresentEvent::RateLimited {
            source: AutonomousSource::Heartbeat,
            message: "429".to_string(),
            resume_in: Some(Duration::from_secs(7320)),
        });
        assert_eq!(value["type"], "rate_limited");
        assert_eq!(value["source"], "heartbeat");
        assert_eq!(value["resumeInSecs"], 7320);
    }

    #[test]
    fn test_result_event_json_carries_text() {
        let value = event_json(&PresentEvent::Result {
            source: AutonomousSource::Callback,
            result: RunResult {
                display_text: "done".to_string(),
                ..Default::default()
            },
        });
        assert_eq!(value["source"], "callback");
        assert_eq!(value["result"]["display_text"], "done");
    }
}
