//! AgentRelay Core - drives agent CLIs on behalf of conversations.
//!
//! A conversation surface (a chat channel or thread) triggers agent runs in
//! three ways: a human message, a recurring heartbeat, or a callback the
//! agent scheduled for itself. All three become a [`RunRequest`] that is
//! queued per context, so a context never has two runs in flight.
//!
//! # Components
//!
//! - [`orchestrator`] - per-context FIFO, session continuation, active runs
//! - [`backend`] - Claude and Codex subprocess drivers and stream accumulators
//! - [`directives`] - upload, image and callback tags in agent output
//! - [`heartbeat`] - recurring ticks with rate-limit backoff
//! - [`callbacks`] - one-shot, chainable callbacks
//! - [`rate_limit`] - throttling detection and reset-time parsing
//! - [`presenter`] - where autonomous outcomes are delivered
//!
//! # Example
//!
//! ```ignore
//! let orchestrator = Arc::new(Orchestrator::new(
//!     store.clone(),
//!     Arc::new(CliBackendFactory::default()),
//!     Arc::new(FixedWorkdir(workdir)),
//!     OrchestratorConfig::default(),
//! ));
//! let callbacks = CallbackScheduler::new(orchestrator.clone(), presenter.clone(), CallbackConfig::default());
//! let heartbeat = HeartbeatScheduler::builder(store, orchestrator.clone())
//!     .presenter(presenter)
//!     .callbacks(callbacks.clone())
//!     .build();
//! heartbeat.restore_from_store().await?;
//! ```

pub mod backend;
pub mod callbacks;
pub mod clock;
pub mod directives;
pub mod error;
pub mod heartbeat;
pub mod models;
pub mod orchestrator;
pub mod presenter;
pub mod rate_limit;
#[cfg(any(test, feature = "test-utils"))]
pub mod testkit;

pub use backend::{
    AgentBackend, BackendConfig, BackendFactory, BackendOptions, BackendProcess, CliBackendFactory,
};
pub use callbacks::{CallbackConfig, CallbackScheduler, PendingCallback};
pub use clock::{Clock, SystemClock};
pub use directives::{Extracted, extract, parse_delay};
pub use error::{Result, RunError};
pub use heartbeat::{HeartbeatConfig, HeartbeatScheduler, TickOutcome};
pub use models::{
    AutonomousSource, BackendKind, ContextId, RunRequest, RunResult, ScheduledCallback, TokenUsage,
};
pub use orchestrator::{
    FixedWorkdir, Orchestrator, OrchestratorConfig, PendingRun, ResetListener, RunSubmitter,
    TextSink, WorkdirResolver,
};
pub use presenter::{ChannelPresenter, NoopPresenter, PresentEvent, Presenter};
