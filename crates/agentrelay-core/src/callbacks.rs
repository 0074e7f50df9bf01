//! One-shot callbacks requested by the agent.
//!
//! Each [`ScheduledCallback`] gets its own timer. When a timer fires it
//! leaves the pending list and pushes a fire onto a work queue; a single
//! worker hands every fire to its own task, which runs the prompt
//! autonomously and presents the outcome. Callback directives in that
//! output are scheduled again one hop further down the chain, so long
//! chains never grow the stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::models::{AutonomousSource, ContextId, RunRequest, ScheduledCallback};
use crate::orchestrator::{ResetListener, RunSubmitter};
use crate::presenter::{NoopPresenter, PresentEvent, Presenter};
use crate::rate_limit;

const SOURCE: AutonomousSource = AutonomousSource::Callback;

#[derive(Debug, Clone, Default)]
pub struct CallbackConfig {
    /// Highest hop number allowed; `None` means unlimited chaining
    pub max_chain_depth: Option<u32>,
}

/// A callback waiting for its timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCallback {
    pub id: u64,
    pub prompt: String,
    pub delay: Duration,
    pub fires_at: DateTime<Utc>,
    /// 0 for callbacks from a direct run, parent + 1 when chained
    pub hop: u32,
}

struct Entry {
    info: PendingCallback,
    timer: JoinHandle<()>,
}

struct Fire {
    context: ContextId,
    prompt: String,
    hop: u32,
}

pub struct CallbackScheduler {
    runner: Arc<dyn RunSubmitter>,
    presenter: Arc<dyn Presenter>,
    config: CallbackConfig,
    clock: Arc<dyn Clock>,
    pending: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
    fires: mpsc::UnboundedSender<Fire>,
    /// Pending timers plus fires still executing
    outstanding: watch::Sender<usize>,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<Self>,
}

impl CallbackScheduler {
    pub fn new(
        runner: Arc<dyn RunSubmitter>,
        presenter: Arc<dyn Presenter>,
        config: CallbackConfig,
    ) -> Arc<Self> {
        Self::with_clock(runner, presenter, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        runner: Arc<dyn RunSubmitter>,
        presenter: Arc<dyn Presenter>,
        config: CallbackConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (fires, queue) = mpsc::unbounded_channel();
        let (outstanding, _) = watch::channel(0);

        let scheduler = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            runner,
            presenter,
            config,
            clock,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            fires,
            outstanding,
            closed: AtomicBool::new(false),
            worker: Mutex::new(None),
            self_ref: weak.clone(),
        });

        let worker = tokio::spawn(process_fires(Arc::downgrade(&scheduler), queue));
        *scheduler.worker.lock() = Some(worker);
        scheduler
    }

    /// Scheduler without a presentation surface.
    pub fn headless(runner: Arc<dyn RunSubmitter>) -> Arc<Self> {
        Self::new(runner, Arc::new(NoopPresenter), CallbackConfig::default())
    }

    /// Arm one timer per callback produced by a direct run.
    pub fn schedule(&self, context: &ContextId, callbacks: Vec<ScheduledCallback>) -> Vec<u64> {
        self.schedule_hop(context, callbacks, 0)
    }

    fn schedule_hop(&self, context: &ContextId, callbacks: Vec<ScheduledCallback>, hop: u32) -> Vec<u64> {
        if self.closed.load(Ordering::SeqCst) {
            if !callbacks.is_empty() {
                warn!(context = %context, count = callbacks.len(), "Callback scheduler is shut down, dropping callbacks");
            }
            return Vec::new();
        }
        if let Some(max) = self.config.max_chain_depth
            && hop > max
        {
            warn!(
                context = %context,
                hop,
                max_chain_depth = max,
                count = callbacks.len(),
                "Callback chain too deep, dropping"
            );
            return Vec::new();
        }

        let key = context.key();
        let mut ids = Vec::with_capacity(callbacks.len());
        let mut pending = self.pending.lock();
        for callback in callbacks {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let fires_at = fire_time(self.clock.now(), callback.delay);
            let info = PendingCallback {
                id,
                prompt: callback.prompt,
                delay: callback.delay,
                fires_at,
                hop,
            };

            info!(
                context = %context,
                callback_id = id,
                hop,
                delay_ms = callback.delay.as_millis() as u64,
                "Scheduled callback"
            );

            let timer = self.arm(context.clone(), id, callback.delay);
            pending.entry(key.clone()).or_default().push(Entry { info, timer });
            self.outstanding.send_modify(|count| *count += 1);
            ids.push(id);
        }
        ids
    }

    fn arm(&self, context: ContextId, id: u64, delay: Duration) -> JoinHandle<()> {
        let scheduler = self.self_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.timer_fired(context, id);
            }
        })
    }

    fn timer_fired(&self, context: ContextId, id: u64) {
        let key = context.key();
        let entry = {
            let mut pending = self.pending.lock();
            let Some(entries) = pending.get_mut(&key) else {
                return;
            };
            let Some(index) = entries.iter().position(|entry| entry.info.id == id) else {
                return;
            };
            let entry = entries.remove(index);
            if entries.is_empty() {
                pending.remove(&key);
            }
            entry
        };

        debug!(context = %context, callback_id = id, hop = entry.info.hop, "Callback fired");
        let fire = Fire {
            context,
            prompt: entry.info.prompt,
            hop: entry.info.hop,
        };
        if self.fires.send(fire).is_err() {
            self.finish_one();
        }
    }

    async fn execute(&self, fire: Fire) {
        let Fire {
            context,
            prompt,
            hop,
        } = fire;

        match self.runner.submit(&context, RunRequest::autonomous(prompt)).await {
            Ok(result) if rate_limit::is_rate_limited(&result.display_text) => {
                warn!(context = %context, hop, "Callback hit a rate limit, not rescheduling");
                self.presenter
                    .present(
                        &context,
                        PresentEvent::RateLimited {
                            source: SOURCE,
                            message: result.display_text,
                            resume_in: None,
                        },
                    )
                    .await;
            }
            Ok(result) => {
                let chained = result.callbacks.clone();
                self.presenter
                    .present(
                        &context,
                        PresentEvent::Result {
                            source: SOURCE,
                            result,
                        },
                    )
                    .await;
                if !chained.is_empty() {
                    self.schedule_hop(&context, chained, hop + 1);
                }
            }
            Err(e) if e.is_rate_limited() => {
                warn!(context = %context, hop, error = %e, "Callback hit a rate limit, not rescheduling");
                self.presenter
                    .present(
                        &context,
                        PresentEvent::RateLimited {
                            source: SOURCE,
                            message: e.to_string(),
                            resume_in: None,
                        },
                    )
                    .await;
            }
            Err(e) => {
                error!(context = %context, hop, error = %e, "Callback run failed");
                self.presenter
                    .present(
                        &context,
                        PresentEvent::Failed {
                            source: SOURCE,
                            error: e.to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    fn finish_one(&self) {
        self.outstanding
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Callbacks still waiting for their timer, in scheduling order.
    pub fn pending(&self, context: &ContextId) -> Vec<PendingCallback> {
        self.pending
            .lock()
            .get(&context.key())
            .map(|entries| entries.iter().map(|entry| entry.info.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of pending timers across all contexts.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }

    /// Abort every pending callback for a context.
    pub fn cancel_all(&self, context: &ContextId) -> usize {
        let entries = self.pending.lock().remove(&context.key()).unwrap_or_default();
        let count = entries.len();
        for entry in entries {
            entry.timer.abort();
            self.finish_one();
        }
        if count > 0 {
            info!(context = %context, count, "Cancelled pending callbacks");
        }
        count
    }

    /// Abort every timer and refuse new callbacks.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Entry> = self
            .pending
            .lock()
            .drain()
            .flat_map(|(_, entries)| entries)
            .collect();
        let count = drained.len();
        for entry in drained {
            entry.timer.abort();
            self.finish_one();
        }
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        info!(cancelled = count, "Callback scheduler shut down");
    }

    /// Wait until no callback is pending or executing.
    pub async fn wait_idle(&self) {
        let mut outstanding = self.outstanding.subscribe();
        let _ = outstanding.wait_for(|count| *count == 0).await;
    }
}

fn fire_time(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl ResetListener for CallbackScheduler {
    fn context_reset(&self, context: &ContextId) {
        self.cancel_all(context);
    }
}

async fn process_fires(scheduler: Weak<CallbackScheduler>, mut queue: mpsc::UnboundedReceiver<Fire>) {
    while let Some(fire) = queue.recv().await {
        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            let runner = scheduler.clone();
            let outcome = tokio::spawn(async move { runner.execute(fire).await }).await;
            if let Err(e) = outcome {
                error!(error = %e, "Callback task aborted");
            }
            scheduler.finish_one();
        });
    }
}
