//! Heartbeat Scheduler - recurring autonomous runs per context.
//!
//! Each enabled context owns one timer slot. A slot is either waiting on a
//! one-shot timer (`Scheduled`) or executing a tick (`Running`); after a
//! tick the slot is re-armed with whatever delay the tick decided:
//!
//! - the configured interval after a normal or idle tick,
//! - the parsed provider reset time plus a buffer after a rate limit,
//!   or twice the interval when no reset time can be parsed,
//! - the configured interval after any other failure, so the loop never
//!   silently stops.
//!
//! Only the enablement flag, interval and prompt are persisted.
//! [`HeartbeatScheduler::restore`] rebuilds timers from them at start-up.
//!
//! Every arm carries a fresh token. A timer task or finished tick only
//! touches its slot while the slot still holds that token, so `start`,
//! `stop` and `reset_timer` never race a tick into double-arming.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use agentrelay_storage::{ContextRecord, HeartbeatSettings, SessionStore};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::callbacks::CallbackScheduler;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::models::{AutonomousSource, ContextId, RunRequest, RunResult};
use crate::orchestrator::{ResetListener, RunSubmitter};
use crate::presenter::{NoopPresenter, PresentEvent, Presenter};
use crate::rate_limit::{self, DEFAULT_RESET_BUFFER};

/// Reply an agent gives when a tick found nothing to do.
pub const DEFAULT_IDLE_SENTINEL: &str = "HEARTBEAT_OK";

pub const DEFAULT_HEARTBEAT_PROMPT: &str = "Heartbeat check. Review outstanding work in this \
directory and continue it if anything needs attention. If nothing does, reply with exactly \
HEARTBEAT_OK.";

const SOURCE: AutonomousSource = AutonomousSource::Heartbeat;

/// Configuration for the HeartbeatScheduler
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub idle_sentinel: String,
    /// Prompt used when a context's persisted prompt is blank
    pub default_prompt: String,
    /// Added on top of a parsed provider reset time
    pub rate_limit_buffer: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            idle_sentinel: DEFAULT_IDLE_SENTINEL.to_string(),
            default_prompt: DEFAULT_HEARTBEAT_PROMPT.to_string(),
            rate_limit_buffer: DEFAULT_RESET_BUFFER,
        }
    }
}

/// What a finished tick asks the scheduler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Rearm(Duration),
    /// Heartbeat no longer enabled; the slot is dropped
    Stop,
}

enum SlotState {
    Scheduled {
        deadline: Instant,
        timer: JoinHandle<()>,
    },
    Running,
}

struct Slot {
    token: u64,
    interval: Duration,
    state: SlotState,
}

impl Slot {
    fn cancel(self) {
        if let SlotState::Scheduled { timer, .. } = self.state {
            timer.abort();
        }
    }
}

pub struct HeartbeatScheduler {
    store: Arc<dyn SessionStore>,
    runner: Arc<dyn RunSubmitter>,
    presenter: Arc<dyn Presenter>,
    callbacks: Option<Arc<CallbackScheduler>>,
    config: HeartbeatConfig,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<String, Slot>>,
    next_token: AtomicU64,
    self_ref: Weak<Self>,
}

/// Builder for [`HeartbeatScheduler`].
pub struct HeartbeatSchedulerBuilder {
    store: Arc<dyn SessionStore>,
    runner: Arc<dyn RunSubmitter>,
    presenter: Arc<dyn Presenter>,
    callbacks: Option<Arc<CallbackScheduler>>,
    config: HeartbeatConfig,
    clock: Arc<dyn Clock>,
}

impl HeartbeatSchedulerBuilder {
    pub fn presenter(mut self, presenter: Arc<dyn Presenter>) -> Self {
        self.presenter = presenter;
        self
    }

    /// Register callback directives found in tick output here.
    pub fn callbacks(mut self, callbacks: Arc<CallbackScheduler>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn config(mut self, config: HeartbeatConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Arc<HeartbeatScheduler> {
        Arc::new_cyclic(|weak| HeartbeatScheduler {
            store: self.store,
            runner: self.runner,
            presenter: self.presenter,
            callbacks: self.callbacks,
            config: self.config,
            clock: self.clock,
            slots: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            self_ref: weak.clone(),
        })
    }
}

impl HeartbeatScheduler {
    pub fn builder(
        store: Arc<dyn SessionStore>,
        runner: Arc<dyn RunSubmitter>,
    ) -> HeartbeatSchedulerBuilder {
        HeartbeatSchedulerBuilder {
            store,
            runner,
            presenter: Arc::new(NoopPresenter),
            callbacks: None,
            config: HeartbeatConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Arm a fresh timer for the context, replacing any existing one.
    ///
    /// A tick already running for the context finishes but does not
    /// re-arm.
    pub fn start(&self, context: &ContextId, interval: Duration) {
        let key = context.key();
        let mut slots = self.slots.lock();
        if let Some(old) = slots.remove(&key) {
            old.cancel();
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let state = self.arm(context.clone(), token, interval);
        slots.insert(
            key,
            Slot {
                token,
                interval,
                state,
            },
        );
        info!(
            context = %context,
            interval_ms = interval.as_millis() as u64,
            "Heartbeat started"
        );
    }

    /// Drop the context's timer. Persisted settings are untouched.
    pub fn stop(&self, context: &ContextId) -> bool {
        match self.slots.lock().remove(&context.key()) {
            Some(slot) => {
                slot.cancel();
                info!(context = %context, "Heartbeat stopped");
                true
            }
            None => false,
        }
    }

    /// Restart the countdown from now.
    ///
    /// Used on human activity so ticks only land in idle periods. A slot
    /// that is mid-tick is left alone; it re-arms when the tick ends.
    pub fn reset_timer(&self, context: &ContextId) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&context.key()) else {
            return false;
        };
        if matches!(slot.state, SlotState::Running) {
            return false;
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let state = self.arm(context.clone(), token, slot.interval);
        let previous = std::mem::replace(&mut slot.state, state);
        slot.token = token;
        if let SlotState::Scheduled { timer, .. } = previous {
            timer.abort();
        }
        debug!(context = %context, "Heartbeat timer reset");
        true
    }

    pub fn is_active(&self, context: &ContextId) -> bool {
        self.slots.lock().contains_key(&context.key())
    }

    /// Time until the next tick; zero while a tick is running.
    pub fn time_remaining(&self, context: &ContextId) -> Option<Duration> {
        let slots = self.slots.lock();
        let slot = slots.get(&context.key())?;
        Some(match &slot.state {
            SlotState::Scheduled { deadline, .. } => {
                deadline.saturating_duration_since(Instant::now())
            }
            SlotState::Running => Duration::ZERO,
        })
    }

    /// Number of contexts with a live heartbeat.
    pub fn active_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Arm a timer for every persisted context whose heartbeat is enabled.
    pub fn restore(&self, contexts: &[(String, ContextRecord)]) -> usize {
        let mut restored = 0;
        for (key, record) in contexts {
            let Some(settings) = record.heartbeat.as_ref().filter(|hb| hb.enabled) else {
                continue;
            };
            self.start(
                &ContextId::parse(key),
                Duration::from_millis(settings.interval_ms),
            );
            restored += 1;
        }
        info!(restored, "Heartbeats restored");
        restored
    }

    /// [`restore`](Self::restore) from the scheduler's own store.
    pub async fn restore_from_store(&self) -> Result<usize> {
        let contexts = self.store.list().await?;
        Ok(self.restore(&contexts))
    }

    /// Persist an enabled heartbeat and start its timer.
    pub async fn enable(
        &self,
        context: &ContextId,
        interval: Duration,
        prompt: impl Into<String>,
    ) -> Result<()> {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        let settings = HeartbeatSettings::new(interval_ms, prompt);
        self.store
            .update(&context.key(), Box::new(move |record| record.heartbeat = Some(settings)))
            .await?;
        self.start(context, interval);
        Ok(())
    }

    /// Persist `enabled = false` and stop the timer.
    pub async fn disable(&self, context: &ContextId) -> Result<()> {
        let key = context.key();
        if self.store.get(&key).await?.is_some() {
            self.store
                .update(
                    &key,
                    Box::new(|record| {
                        if let Some(heartbeat) = record.heartbeat.as_mut() {
                            heartbeat.enabled = false;
                        }
                    }),
                )
                .await?;
        }
        self.stop(context);
        Ok(())
    }

    fn arm(&self, context: ContextId, token: u64, delay: Duration) -> SlotState {
        let deadline = deadline_after(delay);
        let scheduler = self.self_ref.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.fire(context, token).await;
            }
        });
        SlotState::Scheduled { deadline, timer }
    }

    async fn fire(self: Arc<Self>, context: ContextId, token: u64) {
        let key = context.key();
        let interval = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&key) {
                Some(slot) if slot.token == token => {
                    slot.state = SlotState::Running;
                    slot.interval
                }
                _ => return,
            }
        };

        let ticker = self.clone();
        let tick_context = context.clone();
        let tick = tokio::spawn(async move { ticker.handle_tick(&tick_context, interval).await });
        let outcome = match tick.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(context = %context, error = %e, "Heartbeat tick aborted");
                TickOutcome::Rearm(interval)
            }
        };

        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&key) else {
            return;
        };
        if slot.token != token {
            return;
        }
        match outcome {
            TickOutcome::Rearm(delay) => {
                let token = self.next_token.fetch_add(1, Ordering::SeqCst);
                slot.state = self.arm(context, token, delay);
                slot.token = token;
            }
            TickOutcome::Stop => {
                slots.remove(&key);
            }
        }
    }

    /// Run one tick and decide the next delay.
    pub async fn handle_tick(&self, context: &ContextId, interval: Duration) -> TickOutcome {
        let settings = match self.store.get(&context.key()).await {
            Ok(record) => record.and_then(|r| r.heartbeat).filter(|hb| hb.enabled),
            Err(e) => {
                warn!(context = %context, error = %e, "Failed to read heartbeat settings");
                return TickOutcome::Rearm(interval);
            }
        };
        let Some(settings) = settings else {
            info!(context = %context, "Heartbeat disabled, stopping");
            return TickOutcome::Stop;
        };

        let prompt = if settings.prompt.trim().is_empty() {
            self.config.default_prompt.clone()
        } else {
            settings.prompt
        };

        debug!(context = %context, "Heartbeat tick");
        match self.runner.submit(context, RunRequest::autonomous(prompt)).await {
            Ok(result) => self.handle_result(context, interval, result).await,
            Err(e) if e.is_rate_limited() => {
                self.back_off(context, interval, e.to_string()).await
            }
            Err(e) => {
                error!(context = %context, error = %e, "Heartbeat tick failed");
                self.presenter
                    .present(
                        context,
                        PresentEvent::Failed {
                            source: SOURCE,
                            error: e.to_string(),
                        },
                    )
                    .await;
                TickOutcome::Rearm(interval)
            }
        }
    }

    async fn handle_result(
        &self,
        context: &ContextId,
        interval: Duration,
        result: RunResult,
    ) -> TickOutcome {
        if rate_limit::is_rate_limited(&result.display_text) {
            return self.back_off(context, interval, result.display_text).await;
        }

        if !result.is_error && result.display_text.trim() == self.config.idle_sentinel {
            debug!(context = %context, "Heartbeat idle");
            return TickOutcome::Rearm(interval);
        }

        let callbacks = result.callbacks.clone();
        self.presenter
            .present(
                context,
                PresentEvent::Result {
                    source: SOURCE,
                    result,
                },
            )
            .await;
        if !callbacks.is_empty() {
            match &self.callbacks {
                Some(scheduler) => {
                    scheduler.schedule(context, callbacks);
                }
                None => warn!(
                    context = %context,
                    count = callbacks.len(),
                    "No callback scheduler attached, dropping callbacks"
                ),
            }
        }
        TickOutcome::Rearm(interval)
    }

    async fn back_off(&self, context: &ContextId, interval: Duration, message: String) -> TickOutcome {
        let delay = rate_limit::resume_delay(&message, self.clock.now(), self.config.rate_limit_buffer)
            .unwrap_or(interval.saturating_mul(2));

        warn!(
            context = %context,
            delay_ms = delay.as_millis() as u64,
            "Heartbeat rate limited, backing off"
        );
        self.presenter
            .present(
                context,
                PresentEvent::RateLimited {
                    source: SOURCE,
                    message,
                    resume_in: Some(delay),
                },
            )
            .await;
        TickOutcome::Rearm(delay)
    }
}

impl ResetListener for HeartbeatScheduler {
    fn context_reset(&self, context: &ContextId) {
        self.stop(context);
    }
}

/// `now + delay`, clamped to roughly thirty years out like tokio's own sleep.
fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;
    use crate::models::ScheduledCallback;
    use crate::testkit::{FixedClock, RecordingPresenter, ScriptedSubmitter};
    use agentrelay_storage::MemorySessionStore;

    const INTERVAL: Duration = Duration::from_secs(600);

    async fn enabled_store(context: &ContextId) -> Arc<MemorySessionStore> {
        let store = Arc::new(MemorySessionStore::new());
        store
            .update(
                &context.key(),
                Box::new(|r| r.heartbeat = Some(HeartbeatSettings::new(600_000, "check the build"))),
            )
            .await
            .unwrap();
        store
    }

    fn scheduler(
        store: Arc<MemorySessionStore>,
        runner: Arc<ScriptedSubmitter>,
        presenter: Arc<RecordingPresenter>,
    ) -> Arc<HeartbeatScheduler> {
        HeartbeatScheduler::builder(store, runner)
            .presenter(presenter)
            // 11:00 PDT
            .clock(Arc::new(FixedClock::at("2025-06-10T18:00:00Z")))
            .build()
    }

    #[tokio::test]
    async fn test_idle_tick_rearms_at_interval() {
        let context = ContextId::new("C1");
        let store = enabled_store(&context).await;
        let runner = Arc::new(ScriptedSubmitter::new());
        runner.push_ok(RunResult {
            display_text: "  HEARTBEAT_OK\n".to_string(),
            ..Default::default()
        });
        let presenter = Arc::new(RecordingPresenter::new());
        let hb = scheduler(store, runner.clone(), presenter.clone());

        let outcome = hb.handle_tick(&context, INTERVAL).await;

        assert_eq!(outcome, TickOutcome::Rearm(INTERVAL));
        assert!(presenter.events().is_empty());
        let requests = runner.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].1.autonomous);
        assert_eq!(requests[0].1.prompt, "check the build");
    }

    #[tokio::test]
    async fn test_rate_limit_with_reset_hint_waits_until_reset() {
        let context = ContextId::new("C1");
        let store = enabled_store(&context).await;
        let runner = Arc::new(ScriptedSubmitter::new());
        runner.push_ok(RunResult::error(
            "Claude usage limit reached. Your limit resets 1pm (America/Los_Angeles)",
        ));
        let presenter = Arc::new(RecordingPresenter::new());
        let hb = scheduler(store, runner, presenter.clone());

        let outcome = hb.handle_tick(&context, INTERVAL).await;

        let expected = Duration::from_secs(2 * 3600) + DEFAULT_RESET_BUFFER;
        assert_eq!(outcome, TickOutcome::Rearm(expected));
        let events = presenter.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].1,
            PresentEvent::RateLimited { resume_in: Some(d), .. } if *d == expected
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_reported_as_normal_result_still_backs_off() {
        let context = ContextId::new("C1");
        let store = enabled_store(&context).await;
        let runner = Arc::new(ScriptedSubmitter::new());
        runner.push_ok(RunResult {
            display_text: "You've hit your usage limit. resets 1pm (America/Los_Angeles)".to_string(),
            is_error: false,
            ..Default::default()
        });
        let presenter = Arc::new(RecordingPresenter::new());
        let hb = scheduler(store, runner, presenter.clone());

        let outcome = hb.handle_tick(&context, INTERVAL).await;

        let expected = Duration::from_secs(2 * 3600) + DEFAULT_RESET_BUFFER;
        assert_eq!(outcome, TickOutcome::Rearm(expected));
        assert!(matches!(
            &presenter.events()[0].1,
            PresentEvent::RateLimited { resume_in: Some(d), .. } if *d == expected
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_without_hint_doubles_interval() {
        let context = ContextId::new("C1");
        let store = enabled_store(&context).await;
        let runner = Arc::new(ScriptedSubmitter::new());
        runner.push_err(RunError::Infrastructure {
            exit_code: 1,
            stderr: "429 Too Many Requests".to_string(),
        });
        let hb = scheduler(store, runner, Arc::new(RecordingPresenter::new()));

        let outcome = hb.handle_tick(&context, INTERVAL).await;

        assert_eq!(outcome, TickOutcome::Rearm(INTERVAL * 2));
    }

    #[tokio::test]
    async fn test_unknown_zone_falls_back_to_double_interval() {
        let context = ContextId::new("C1");
        let store = enabled_store(&context).await;
        let runner = Arc::new(ScriptedSubmitter::new());
        runner.push_ok(RunResult::error("rate limit hit, resets 1pm (Atlantis/Capital)"));
        let hb = scheduler(store, runner, Arc::new(RecordingPresenter::new()));

        assert_eq!(
            hb.handle_tick(&context, INTERVAL).await,
            TickOutcome::Rearm(INTERVAL * 2)
        );
    }

    #[tokio::test]
    async fn test_failure_self_heals_and_keeps_heartbeat_enabled() {
        let context = ContextId::new("C1");
        let store = enabled_store(&context).await;
        let runner = Arc::new(ScriptedSubmitter::new());
        runner.push_err(RunError::Infrastructure {
            exit_code: 139,
            stderr: "segmentation fault".to_string(),
        });
        let presenter = Arc::new(RecordingPresenter::new());
        let hb = scheduler(store.clone(), runner, presenter.clone());

        let outcome = hb.handle_tick(&context, INTERVAL).await;

        assert_eq!(outcome, TickOutcome::Rearm(INTERVAL));
        assert!(matches!(presenter.events()[0].1, PresentEvent::Failed { .. }));
        let record = store.get(&context.key()).await.unwrap().unwrap();
        assert!(record.heartbeat_enabled());
    }

    #[tokio::test]
    async fn test_disabled_heartbeat_stops_without_running() {
        let context = ContextId::new("C1");
        let store = Arc::new(MemorySessionStore::new());
        let runner = Arc::new(ScriptedSubmitter::new());
        let hb = scheduler(store.clone(), runner.clone(), Arc::new(RecordingPresenter::new()));

        assert_eq!(hb.handle_tick(&context, INTERVAL).await, TickOutcome::Stop);

        let mut settings = HeartbeatSettings::new(1_000, "x");
        settings.enabled = false;
        store
            .update(&context.key(), Box::new(move |r| r.heartbeat = Some(settings)))
            .await
            .unwrap();
        assert_eq!(hb.handle_tick(&context, INTERVAL).await, TickOutcome::Stop);
        assert!(runner.requests().is_empty());
    }

    #[tokio::test]
    async fn test_result_is_presented_and_callbacks_scheduled() {
        let context = ContextId::new("C1");
        let store = enabled_store(&context).await;
        let runner = Arc::new(ScriptedSubmitter::new());
        runner.push_ok(RunResult {
            display_text: "Fixed the flaky test.".to_string(),
            callbacks: vec![ScheduledCallback::new(Duration::from_secs(3600), "verify CI")],
            ..Default::default()
        });
        let presenter = Arc::new(RecordingPresenter::new());
        let callbacks = CallbackScheduler::headless(runner.clone());
        let hb = HeartbeatScheduler::builder(store, runner)
            .presenter(presenter.clone())
            .callbacks(callbacks.clone())
            .build();

        let outcome = hb.handle_tick(&context, INTERVAL).await;

        assert_eq!(outcome, TickOutcome::Rearm(INTERVAL));
        assert!(matches!(presenter.events()[0].1, PresentEvent::Result { .. }));
        let pending = callbacks.pending(&context);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].prompt, "verify CI");
        assert_eq!(pending[0].hop, 0);
        callbacks.shutdown();
    }
}
