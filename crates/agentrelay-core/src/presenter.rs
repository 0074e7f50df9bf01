//! Presentation boundary for autonomous run outcomes.
//!
//! Heartbeat ticks and callback fires have no caller waiting on them, so
//! their outcomes are handed to a [`Presenter`] owned by the chat surface.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::models::{AutonomousSource, ContextId, RunResult};

/// Notice shown in place of infrastructure failure details.
pub const GENERIC_FAILURE_NOTICE: &str = "Something went wrong while running the agent. Please try again.";

/// Outcome of one autonomous run.
#[derive(Debug, Clone, PartialEq)]
pub enum PresentEvent {
    /// Completed run; agent-level errors arrive here with `is_error` set
    Result {
        source: AutonomousSource,
        result: RunResult,
    },
    /// Provider throttling; `resume_in` is set when the run was rescheduled
    RateLimited {
        source: AutonomousSource,
        message: String,
        resume_in: Option<Duration>,
    },
    /// Infrastructure or scheduler failure
    Failed {
        source: AutonomousSource,
        error: String,
    },
}

impl PresentEvent {
    pub fn source(&self) -> AutonomousSource {
        match self {
            Self::Result { source, .. }
            | Self::RateLimited { source, .. }
            | Self::Failed { source, .. } => *source,
        }
    }
}

/// Receives autonomous run outcomes.
#[async_trait::async_trait]
pub trait Presenter: Send + Sync {
    async fn present(&self, context: &ContextId, event: PresentEvent);
}

/// Presenter that forwards events through a channel.
pub struct ChannelPresenter {
    sender: mpsc::UnboundedSender<(ContextId, PresentEvent)>,
}

impl ChannelPresenter {
    pub fn new(sender: mpsc::UnboundedSender<(ContextId, PresentEvent)>) -> Self {
        Self { sender }
    }
}

#[async_trait::async_trait]
impl Presenter for ChannelPresenter {
    async fn present(&self, context: &ContextId, event: PresentEvent) {
        let _ = self.sender.send((context.clone(), event));
    }
}

/// Presenter that drops everything.
pub struct NoopPresenter;

#[async_trait::async_trait]
impl Presenter for NoopPresenter {
    async fn present(&self, _context: &ContextId, _event: PresentEvent) {}
}

/// User-facing rate-limit notice.
pub fn rate_limit_notice(resume_in: Option<Duration>) -> String {
    match resume_in {
        Some(delay) => {
            let minutes = delay.as_secs().div_ceil(60).max(1);
            format!("Rate limited by the provider: delayed, resuming in ~{minutes} minutes.")
        }
        None => "Rate limited by the provider: this run was skipped.".to_string(),
    }
}
