//! Per-context run queue.
//!
//! Every context gets one FIFO channel drained by a single worker task, so
//! runs for the same context execute strictly in submission order while
//! different contexts proceed concurrently. Each run is dispatched in its
//! own task; a failure or panic is reported to that run's caller and the
//! worker moves on to the next request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use agentrelay_storage::{ContextRecord, RecordMutation, SessionStore};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{AgentBackend, BackendFactory, BackendOptions};
use crate::error::{Result, RunError};
use crate::models::{BackendKind, ContextId, RunRequest, RunResult};

/// Default model when neither request, context nor global override names one.
pub const DEFAULT_MODEL: &str = "sonnet";

/// Receives incremental text while a run streams.
pub type TextSink = mpsc::UnboundedSender<String>;

/// Anything that can run a request for a context.
///
/// Schedulers depend on this rather than on [`Orchestrator`] directly.
#[async_trait]
pub trait RunSubmitter: Send + Sync {
    async fn submit(&self, context: &ContextId, request: RunRequest) -> Result<RunResult>;
}

/// Maps a context to the directory its agent runs in.
pub trait WorkdirResolver: Send + Sync {
    fn resolve(&self, context: &ContextId) -> PathBuf;
}

/// Every context runs in the same directory.
#[derive(Debug, Clone)]
pub struct FixedWorkdir(pub PathBuf);

impl WorkdirResolver for FixedWorkdir {
    fn resolve(&self, _context: &ContextId) -> PathBuf {
        self.0.clone()
    }
}

/// Notified when a context is reset so per-context timers can be dropped.
pub trait ResetListener: Send + Sync {
    fn context_reset(&self, context: &ContextId);
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub default_model: String,
    /// Appended to the agent's system prompt on every run
    pub system_prompt: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
        }
    }
}

struct QueuedRun {
    context: ContextId,
    request: RunRequest,
    sink: Option<TextSink>,
    reply: oneshot::Sender<Result<RunResult>>,
}

/// A run accepted into a context's queue.
pub struct PendingRun {
    context_key: String,
    reply: oneshot::Receiver<Result<RunResult>>,
}

impl PendingRun {
    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunResult> {
        self.reply
            .await
            .map_err(|_| RunError::QueueClosed(self.context_key))?
    }
}

/// State shared with queue workers.
struct Dispatcher {
    store: Arc<dyn SessionStore>,
    backends: Arc<dyn BackendFactory>,
    workdir: Arc<dyn WorkdirResolver>,
    config: OrchestratorConfig,
    active: DashMap<String, Arc<dyn AgentBackend>>,
}

/// Session id and continuation flag for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionPlan {
    session_id: String,
    continuation: bool,
}

/// Decide which session a run uses.
///
/// Autonomous runs always get a throw-away session. A stored session is
/// only resumed by the backend that issued it; switching backends starts
/// over with a fresh one.
fn plan_session(record: &ContextRecord, request: &RunRequest, kind: BackendKind) -> SessionPlan {
    if request.autonomous {
        return SessionPlan {
            session_id: Uuid::new_v4().to_string(),
            continuation: false,
        };
    }

    let same_backend = match record.session_backend.as_deref() {
        Some(backend) => backend == kind.as_str(),
        // Claude accepts a caller-chosen id; Codex assigns its own thread.
        None => kind == BackendKind::Claude,
    };

    if !same_backend {
        return SessionPlan {
            session_id: Uuid::new_v4().to_string(),
            continuation: false,
        };
    }

    SessionPlan {
        session_id: record.session_id.clone(),
        continuation: request.continuation || record.message_count > 0,
    }
}

impl Dispatcher {
    async fn dispatch(
        &self,
        context: &ContextId,
        request: RunRequest,
        sink: Option<TextSink>,
    ) -> Result<RunResult> {
        let key = context.key();
        let record = self.store.get_or_create(&key).await?;
        let global_model = self.store.global_model().await?;

        let model = request
            .model_override
            .clone()
            .or_else(|| record.model.clone())
            .or(global_model)
            .unwrap_or_else(|| self.config.default_model.clone());
        let kind = BackendKind::for_model(&model);
        let plan = plan_session(&record, &request, kind);

        info!(
            context = %context,
            backend = %kind,
            model = %model,
            autonomous = request.autonomous,
            continuation = plan.continuation,
            "Dispatching run"
        );

        let options = BackendOptions {
            session_id: plan.session_id.clone(),
            working_dir: self.workdir.resolve(context),
            prompt: request.prompt.clone(),
            continuation: plan.continuation,
            system_prompt: self.config.system_prompt.clone(),
            model: Some(model),
            plan_mode: record.plan_mode,
            image_paths: request.image_paths.clone(),
        };

        let backend = self.backends.create(kind, options);
        self.active.insert(key.clone(), backend.clone());
        if let Some(sink) = sink {
            forward_text(backend.subscribe(), sink);
        }

        let outcome = backend.run().await;
        self.active.remove(&key);
        let result = outcome?;

        self.record_run(&key, &request, kind, plan, &result).await;
        Ok(result)
    }

    /// Fold a finished run into the persisted context.
    async fn record_run(
        &self,
        key: &str,
        request: &RunRequest,
        kind: BackendKind,
        plan: SessionPlan,
        result: &RunResult,
    ) {
        let autonomous = request.autonomous;
        let cost = result.cost_usd;
        let usage = result.usage;
        let reported_session = result.session_id.clone();

        let mutation: RecordMutation = Box::new(move |record| {
            record.total_cost_usd += cost;
            if let Some(usage) = usage {
                record.total_input_tokens += usage.input_tokens;
                record.total_output_tokens += usage.output_tokens;
            }
            if autonomous {
                return;
            }

            record.message_count += 1;
            match (reported_session, kind) {
                (Some(id), _) => {
                    record.session_id = id;
                    record.session_backend = Some(kind.as_str().to_string());
                }
                (None, BackendKind::Claude) => {
                    record.session_id = plan.session_id;
                    record.session_backend = Some(kind.as_str().to_string());
                }
                (None, BackendKind::Codex) => {}
            }
        });

        if let Err(e) = self.store.update(key, mutation).await {
            warn!(context = %key, error = %e, "Failed to persist run accounting");
        }
    }
}

fn forward_text(mut updates: watch::Receiver<String>, sink: TextSink) {
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let text = updates.borrow_and_update().clone();
            if sink.send(text).is_err() {
                break;
            }
        }
    });
}

async fn run_queue(dispatcher: Arc<Dispatcher>, key: String, mut queue: mpsc::UnboundedReceiver<QueuedRun>) {
    debug!(context = %key, "Run queue worker started");
    while let Some(job) = queue.recv().await {
        let task_dispatcher = dispatcher.clone();
        let QueuedRun {
            context,
            request,
            sink,
            reply,
        } = job;

        let handle = tokio::spawn(async move { task_dispatcher.dispatch(&context, request, sink).await });
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                dispatcher.active.remove(&key);
                warn!(context = %key, error = %e, "Run task aborted");
                Err(RunError::Internal(e.to_string()))
            }
        };

        if let Err(e) = &outcome {
            warn!(context = %key, error = %e, "Run failed");
        }
        let _ = reply.send(outcome);
    }
    debug!(context = %key, "Run queue worker stopped");
}

/// Serializes runs per context and dispatches them to agent backends.
pub struct Orchestrator {
    dispatcher: Arc<Dispatcher>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<QueuedRun>>>,
    reset_listeners: RwLock<Vec<Weak<dyn ResetListener>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        backends: Arc<dyn BackendFactory>,
        workdir: Arc<dyn WorkdirResolver>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher {
                store,
                backends,
                workdir,
                config,
                active: DashMap::new(),
            }),
            queues: Mutex::new(HashMap::new()),
            reset_listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.dispatcher.store
    }

    /// Append a run to the context's queue without waiting for it.
    ///
    /// Queue position is fixed when this returns.
    pub fn enqueue(
        &self,
        context: &ContextId,
        request: RunRequest,
        sink: Option<TextSink>,
    ) -> Result<PendingRun> {
        let key = context.key();
        let (reply, receiver) = oneshot::channel();
        let mut job = QueuedRun {
            context: context.clone(),
            request,
            sink,
            reply,
        };

        let mut queues = self.queues.lock();
        if let Some(sender) = queues.get(&key) {
            match sender.send(job) {
                Ok(()) => {
                    return Ok(PendingRun {
                        context_key: key,
                        reply: receiver,
                    });
                }
                // Worker gone; start a fresh one with the same job.
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let (sender, queue) = mpsc::unbounded_channel();
        sender
            .send(job)
            .map_err(|_| RunError::QueueClosed(key.clone()))?;
        tokio::spawn(run_queue(self.dispatcher.clone(), key.clone(), queue));
        queues.insert(key.clone(), sender);

        Ok(PendingRun {
            context_key: key,
            reply: receiver,
        })
    }

    /// Queue a run and wait for its result, streaming text to `sink`.
    pub async fn submit_with_sink(
        &self,
        context: &ContextId,
        request: RunRequest,
        sink: Option<TextSink>,
    ) -> Result<RunResult> {
        self.enqueue(context, request, sink)?.wait().await
    }

    /// Whether a subprocess is currently running for the context.
    pub fn is_busy(&self, context: &ContextId) -> bool {
        self.dispatcher.active.contains_key(&context.key())
    }

    /// Number of contexts with a running subprocess.
    pub fn active_count(&self) -> usize {
        self.dispatcher.active.len()
    }

    /// Terminate the context's running subprocess, if any.
    ///
    /// Queued runs are untouched and still execute afterwards.
    pub fn kill(&self, context: &ContextId) -> bool {
        match self.dispatcher.active.remove(&context.key()) {
            Some((_, backend)) => {
                info!(context = %context, "Killing active run");
                backend.kill();
                true
            }
            None => false,
        }
    }

    pub fn add_reset_listener<L: ResetListener + 'static>(&self, listener: &Arc<L>) {
        let weak: Weak<dyn ResetListener> = Arc::downgrade(listener) as Weak<dyn ResetListener>;
        self.reset_listeners.write().push(weak);
    }

    /// Destroy a context: kill its run, drop its timers and forget its
    /// persisted state so the next interaction starts a new session.
    pub async fn reset_context(&self, context: &ContextId) -> Result<bool> {
        self.kill(context);

        let listeners: Vec<Arc<dyn ResetListener>> = {
            let mut guard = self.reset_listeners.write();
            guard.retain(|weak| weak.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.context_reset(context);
        }

        let removed = self.dispatcher.store.remove(&context.key()).await?;
        info!(context = %context, existed = removed.is_some(), "Context reset");
        Ok(removed.is_some())
    }

    pub async fn context(&self, context: &ContextId) -> Result<Option<ContextRecord>> {
        Ok(self.dispatcher.store.get(&context.key()).await?)
    }

    /// Set or clear the per-context model override.
    pub async fn set_model(&self, context: &ContextId, model: Option<String>) -> Result<()> {
        self.dispatcher
            .store
            .update(&context.key(), Box::new(move |record| record.model = model))
            .await?;
        Ok(())
    }

    /// Set or clear the process-wide model override.
    pub async fn set_global_model(&self, model: Option<String>) -> Result<()> {
        self.dispatcher.store.set_global_model(model).await?;
        Ok(())
    }

    pub async fn set_plan_mode(&self, context: &ContextId, plan_mode: bool) -> Result<()> {
        self.dispatcher
            .store
            .update(
                &context.key(),
                Box::new(move |record| record.plan_mode = plan_mode),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RunSubmitter for Orchestrator {
    async fn submit(&self, context: &ContextId, request: RunRequest) -> Result<RunResult> {
        self.submit_with_sink(context, request, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(message_count: u64, backend: Option<&str>) -> ContextRecord {
        let mut record = ContextRecord::new();
        record.session_id = "stored".to_string();
        record.message_count = message_count;
        record.session_backend = backend.map(str::to_string);
        record
    }

    #[test]
    fn test_plan_session_continues_when_history_exists() {
        let plan = plan_session(
            &record(3, Some("claude")),
            &RunRequest::new("hi"),
            BackendKind::Claude,
        );
        assert_eq!(
            plan,
            SessionPlan {
                session_id: "stored".to_string(),
                continuation: true,
            }
        );
    }

    #[test]
    fn test_plan_session_first_message_starts_stored_session() {
        let plan = plan_session(&record(0, None), &RunRequest::new("hi"), BackendKind::Claude);
        assert_eq!(plan.session_id, "stored");
        assert!(!plan.continuation);

        let plan = plan_session(
            &record(0, None),
            &RunRequest::new("hi").with_continuation(true),
            BackendKind::Claude,
        );
        assert!(plan.continuation);
    }

    #[test]
    fn test_plan_session_autonomous_is_always_fresh() {
        let stored = record(5, Some("claude"));
        let a = plan_session(&stored, &RunRequest::autonomous("tick"), BackendKind::Claude);
        let b = plan_session(&stored, &RunRequest::autonomous("tick"), BackendKind::Claude);
        assert!(!a.continuation);
        assert_ne!(a.session_id, "stored");
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn test_plan_session_backend_switch_starts_over() {
        let plan = plan_session(
            &record(4, Some("claude")),
            &RunRequest::new("hi"),
            BackendKind::Codex,
        );
        assert!(!plan.continuation);
        assert_ne!(plan.session_id, "stored");

        let plan = plan_session(
            &record(2, Some("codex")),
            &RunRequest::new("hi"),
            BackendKind::Codex,
        );
        assert!(plan.continuation);
        assert_eq!(plan.session_id, "stored");
    }

    #[test]
    fn test_fixed_workdir() {
        let resolver = FixedWorkdir(PathBuf::from("/srv/agent"));
        assert_eq!(
            resolver.resolve(&ContextId::new("C1")),
            PathBuf::from("/srv/agent")
        );
    }
}
