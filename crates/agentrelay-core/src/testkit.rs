//! Test utilities: scripted backends, submitters, presenters and clocks.
//!
//! Compiled into the library so integration tests and downstream hosts can
//! drive the engine deterministically without spawning agent CLIs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::backend::{AgentBackend, BackendFactory, BackendOptions};
use crate::clock::Clock;
use crate::error::{Result, RunError};
use crate::models::{BackendKind, ContextId, RunRequest, RunResult};
use crate::orchestrator::RunSubmitter;
use crate::presenter::{PresentEvent, Presenter};

/// Clock pinned to a settable instant.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Clock at an RFC 3339 timestamp.
    pub fn at(timestamp: &str) -> Self {
        let now = DateTime::parse_from_rfc3339(timestamp)
            .expect("invalid RFC 3339 timestamp")
            .with_timezone(&Utc);
        Self::new(now)
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::TimeDelta::from_std(by).expect("duration out of range");
        *self.now.lock() += delta;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Presenter that records every event.
#[derive(Default)]
pub struct RecordingPresenter {
    events: Mutex<Vec<(ContextId, PresentEvent)>>,
    notify: Notify,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(ContextId, PresentEvent)> {
        self.events.lock().clone()
    }

    /// Wait until at least `count` events were recorded.
    pub async fn wait_for(&self, count: usize) -> Vec<(ContextId, PresentEvent)> {
        loop {
            let notified = self.notify.notified();
            if self.events.lock().len() >= count {
                return self.events();
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Presenter for RecordingPresenter {
    async fn present(&self, context: &ContextId, event: PresentEvent) {
        self.events.lock().push((context.clone(), event));
        self.notify.notify_waiters();
    }
}

/// Submitter that replays queued outcomes and records requests.
///
/// Once the queue is empty every submit succeeds with an empty result.
#[derive(Default)]
pub struct ScriptedSubmitter {
    responses: Mutex<VecDeque<Result<RunResult>>>,
    requests: Mutex<Vec<(ContextId, RunRequest)>>,
    delay: Duration,
}

impl ScriptedSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each submit sleeps this long before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn push_ok(&self, result: RunResult) {
        self.responses.lock().push_back(Ok(result));
    }

    pub fn push_err(&self, error: RunError) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<(ContextId, RunRequest)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RunSubmitter for ScriptedSubmitter {
    async fn submit(&self, context: &ContextId, request: RunRequest) -> Result<RunResult> {
        self.requests.lock().push((context.clone(), request));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.responses.lock().pop_front();
        next.unwrap_or_else(|| Ok(RunResult::default()))
    }
}

/// How a [`FakeBackend`] finishes.
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    Result(RunResult),
    /// Nonzero exit with no output
    Infrastructure { exit_code: i32, stderr: String },
    /// Runs until killed
    Hang,
}

/// Script for one fake run.
#[derive(Debug, Clone)]
pub struct FakeRun {
    pub delay: Duration,
    /// Text updates emitted before finishing
    pub updates: Vec<String>,
    pub outcome: FakeOutcome,
}

impl FakeRun {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            updates: Vec::new(),
            outcome: FakeOutcome::Result(RunResult {
                display_text: text.into(),
                ..Default::default()
            }),
        }
    }

    pub fn result(result: RunResult) -> Self {
        Self {
            delay: Duration::ZERO,
            updates: Vec::new(),
            outcome: FakeOutcome::Result(result),
        }
    }

    pub fn infrastructure(stderr: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            updates: Vec::new(),
            outcome: FakeOutcome::Infrastructure {
                exit_code: 1,
                stderr: stderr.into(),
            },
        }
    }

    pub fn hang() -> Self {
        Self {
            delay: Duration::ZERO,
            updates: Vec::new(),
            outcome: FakeOutcome::Hang,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_updates(mut self, updates: Vec<String>) -> Self {
        self.updates = updates;
        self
    }
}

/// In-process stand-in for a backend subprocess.
pub struct FakeBackend {
    kind: BackendKind,
    options: BackendOptions,
    script: FakeRun,
    log: Arc<Mutex<Vec<String>>>,
    text_tx: watch::Sender<String>,
    cancel: CancellationToken,
}

#[async_trait]
impl AgentBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn run(&self) -> Result<RunResult> {
        let prompt = self.options.prompt.clone();
        self.log.lock().push(format!("start:{prompt}"));

        for update in &self.script.updates {
            self.text_tx.send_replace(update.clone());
        }

        let finished = tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = async {
                match self.script.outcome {
                    FakeOutcome::Hang => std::future::pending::<()>().await,
                    _ => tokio::time::sleep(self.script.delay).await,
                }
            } => true,
        };

        self.log.lock().push(format!("end:{prompt}"));
        if !finished {
            return Err(RunError::Cancelled);
        }

        match &self.script.outcome {
            FakeOutcome::Result(result) => {
                let mut result = result.clone();
                if result.session_id.is_none() && self.kind == BackendKind::Claude {
                    result.session_id = Some(self.options.session_id.clone());
                }
                Ok(result)
            }
            FakeOutcome::Infrastructure { exit_code, stderr } => Err(RunError::Infrastructure {
                exit_code: *exit_code,
                stderr: stderr.clone(),
            }),
            FakeOutcome::Hang => Err(RunError::Cancelled),
        }
    }

    fn current_text(&self) -> String {
        self.text_tx.borrow().clone()
    }

    fn kill(&self) {
        self.cancel.cancel();
    }

    fn subscribe(&self) -> watch::Receiver<String> {
        self.text_tx.subscribe()
    }
}

type Script = dyn Fn(BackendKind, &BackendOptions) -> FakeRun + Send + Sync;

/// Factory producing [`FakeBackend`]s from a script function.
///
/// Records the options of every backend it creates and a shared
/// `start:<prompt>` / `end:<prompt>` log.
pub struct FakeBackendFactory {
    script: Box<Script>,
    created: Mutex<Vec<(BackendKind, BackendOptions)>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeBackendFactory {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(BackendKind, &BackendOptions) -> FakeRun + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            created: Mutex::new(Vec::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every run answers `done: <prompt>`.
    pub fn echo() -> Self {
        Self::new(|_, options| FakeRun::ok(format!("done: {}", options.prompt)))
    }

    pub fn created(&self) -> Vec<(BackendKind, BackendOptions)> {
        self.created.lock().clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl BackendFactory for FakeBackendFactory {
    fn create(&self, kind: BackendKind, options: BackendOptions) -> Arc<dyn AgentBackend> {
        let script = (self.script)(kind, &options);
        self.created.lock().push((kind, options.clone()));
        let (text_tx, _) = watch::channel(String::new());
        Arc::new(FakeBackend {
            kind,
            options,
            script,
            log: self.log.clone(),
            text_tx,
            cancel: CancellationToken::new(),
        })
    }
}
