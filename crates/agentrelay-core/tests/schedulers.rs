#![cfg(feature = "test-utils")]

use std::sync::Arc;
use std::time::Duration;

use agentrelay_core::testkit::{FixedClock, RecordingPresenter, ScriptedSubmitter};
use agentrelay_core::{
    AutonomousSource, CallbackConfig, CallbackScheduler, ContextId, HeartbeatScheduler,
    PresentEvent, ResetListener, RunError, RunResult, ScheduledCallback,
};
use agentrelay_storage::{HeartbeatSettings, MemorySessionStore, SessionStore};
use tokio::time::sleep;

const INTERVAL: Duration = Duration::from_secs(60);
const SLACK: Duration = Duration::from_millis(500);

struct Heartbeat {
    store: Arc<MemorySessionStore>,
    runner: Arc<ScriptedSubmitter>,
    presenter: Arc<RecordingPresenter>,
    scheduler: Arc<HeartbeatScheduler>,
}

fn heartbeat_with(runner: ScriptedSubmitter) -> Heartbeat {
    let store = Arc::new(MemorySessionStore::new());
    let runner = Arc::new(runner);
    let presenter = Arc::new(RecordingPresenter::new());
    let scheduler = HeartbeatScheduler::builder(store.clone(), runner.clone())
        .presenter(presenter.clone())
        .clock(Arc::new(FixedClock::at("2025-06-10T18:00:00Z")))
        .build();
    Heartbeat {
        store,
        runner,
        presenter,
        scheduler,
    }
}

fn heartbeat() -> Heartbeat {
    heartbeat_with(ScriptedSubmitter::new())
}

fn idle() -> RunResult {
    RunResult {
        display_text: "HEARTBEAT_OK".to_string(),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn heartbeat_ticks_every_interval() {
    let hb = heartbeat();
    let context = ContextId::with_sub_scope("C1", "T1");
    hb.runner.push_ok(idle());
    hb.runner.push_ok(idle());

    hb.scheduler
        .enable(&context, INTERVAL, "check the deploy")
        .await
        .unwrap();
    assert_eq!(hb.scheduler.time_remaining(&context), Some(INTERVAL));

    sleep(INTERVAL - SLACK).await;
    assert!(hb.runner.requests().is_empty());

    sleep(SLACK * 2).await;
    let requests = hb.runner.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, context);
    assert!(requests[0].1.autonomous);
    assert_eq!(requests[0].1.prompt, "check the deploy");

    sleep(INTERVAL).await;
    assert_eq!(hb.runner.requests().len(), 2);
    // idle ticks stay silent
    assert!(hb.presenter.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_tick_rearms_exactly_once() {
    let hb = heartbeat();
    let context = ContextId::new("C1");
    hb.runner.push_err(RunError::Infrastructure {
        exit_code: 1,
        stderr: "segfault".to_string(),
    });

    hb.scheduler.enable(&context, INTERVAL, "check").await.unwrap();
    sleep(INTERVAL + SLACK).await;

    let events = hb.presenter.wait_for(1).await;
    assert!(matches!(
        &events[0].1,
        PresentEvent::Failed {
            source: AutonomousSource::Heartbeat,
            ..
        }
    ));
    assert!(hb.scheduler.is_active(&context));
    assert_eq!(hb.scheduler.active_count(), 1);

    sleep(INTERVAL).await;
    assert_eq!(hb.runner.requests().len(), 2);
    sleep(INTERVAL).await;
    assert_eq!(hb.runner.requests().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_tick_backs_off_to_twice_the_interval() {
    let hb = heartbeat();
    let context = ContextId::new("C1");
    hb.runner
        .push_ok(RunResult::error("You've hit your usage limit for today."));

    hb.scheduler.enable(&context, INTERVAL, "check").await.unwrap();
    sleep(INTERVAL + SLACK).await;
    assert_eq!(hb.runner.requests().len(), 1);

    let events = hb.presenter.wait_for(1).await;
    match &events[0].1 {
        PresentEvent::RateLimited { resume_in, .. } => {
            assert_eq!(*resume_in, Some(INTERVAL * 2));
        }
        other => panic!("expected a rate limit event, got {other:?}"),
    }

    // the normal interval passes without a tick
    sleep(INTERVAL).await;
    assert_eq!(hb.runner.requests().len(), 1);
    sleep(INTERVAL).await;
    assert_eq!(hb.runner.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn reset_timer_postpones_the_next_tick() {
    let hb = heartbeat();
    let context = ContextId::new("C1");
    hb.scheduler.enable(&context, INTERVAL, "check").await.unwrap();

    sleep(INTERVAL / 2).await;
    assert!(hb.scheduler.reset_timer(&context));
    assert_eq!(hb.scheduler.time_remaining(&context), Some(INTERVAL));

    sleep(INTERVAL / 2 + SLACK).await;
    assert!(hb.runner.requests().is_empty());

    sleep(INTERVAL / 2).await;
    assert_eq!(hb.runner.requests().len(), 1);

    assert!(!hb.scheduler.reset_timer(&ContextId::new("unknown")));
}

#[tokio::test(start_paused = true)]
async fn running_tick_reports_zero_remaining_and_ignores_reset() {
    let hb = heartbeat_with(ScriptedSubmitter::with_delay(Duration::from_secs(30)));
    let context = ContextId::new("C1");
    hb.runner.push_ok(idle());
    hb.scheduler.enable(&context, INTERVAL, "check").await.unwrap();

    sleep(INTERVAL + SLACK).await;
    assert_eq!(hb.runner.requests().len(), 1);
    assert_eq!(hb.scheduler.time_remaining(&context), Some(Duration::ZERO));
    assert!(!hb.scheduler.reset_timer(&context));

    sleep(Duration::from_secs(30)).await;
    let remaining = hb.scheduler.time_remaining(&context).unwrap();
    assert!(remaining > Duration::ZERO && remaining <= INTERVAL);
    assert_eq!(hb.runner.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_keeps_settings_and_disable_clears_them() {
    let hb = heartbeat();
    let context = ContextId::new("C1");
    hb.scheduler.enable(&context, INTERVAL, "check").await.unwrap();

    assert!(hb.scheduler.stop(&context));
    assert!(!hb.scheduler.stop(&context));
    sleep(INTERVAL * 3).await;
    assert!(hb.runner.requests().is_empty());

    let record = hb.store.get("C1").await.unwrap().unwrap();
    assert!(record.heartbeat_enabled());

    hb.scheduler.enable(&context, INTERVAL, "check").await.unwrap();
    hb.scheduler.disable(&context).await.unwrap();
    assert!(!hb.scheduler.is_active(&context));
    let record = hb.store.get("C1").await.unwrap().unwrap();
    assert!(!record.heartbeat_enabled());
    assert_eq!(record.heartbeat.unwrap().prompt, "check");
}

#[tokio::test(start_paused = true)]
async fn disabled_in_store_stops_at_next_tick() {
    let hb = heartbeat();
    let context = ContextId::new("C1");
    hb.scheduler.enable(&context, INTERVAL, "check").await.unwrap();

    // another process turned it off without touching our timer
    hb.store
        .update(
            "C1",
            Box::new(|record| {
                if let Some(heartbeat) = record.heartbeat.as_mut() {
                    heartbeat.enabled = false;
                }
            }),
        )
        .await
        .unwrap();

    sleep(INTERVAL + SLACK).await;
    assert!(hb.runner.requests().is_empty());
    assert!(!hb.scheduler.is_active(&context));
}

#[tokio::test(start_paused = true)]
async fn restore_arms_only_enabled_contexts() {
    let hb = heartbeat();
    hb.store
        .update(
            "C1:T1",
            Box::new(|r| r.heartbeat = Some(HeartbeatSettings::new(60_000, "one"))),
        )
        .await
        .unwrap();
    hb.store
        .update(
            "C2",
            Box::new(|r| {
                let mut settings = HeartbeatSettings::new(60_000, "two");
                settings.enabled = false;
                r.heartbeat = Some(settings);
            }),
        )
        .await
        .unwrap();
    hb.store.get_or_create("C3").await.unwrap();

    assert_eq!(hb.scheduler.restore_from_store().await.unwrap(), 1);
    assert!(hb.scheduler.is_active(&ContextId::with_sub_scope("C1", "T1")));
    assert!(!hb.scheduler.is_active(&ContextId::new("C2")));

    sleep(INTERVAL + SLACK).await;
    let requests = hb.runner.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.prompt, "one");
}

#[tokio::test(start_paused = true)]
async fn restore_tolerates_an_absurd_persisted_interval() {
    let hb = heartbeat();
    hb.store
        .update(
            "C1",
            Box::new(|r| r.heartbeat = Some(HeartbeatSettings::new(u64::MAX, "never"))),
        )
        .await
        .unwrap();

    assert_eq!(hb.scheduler.restore_from_store().await.unwrap(), 1);
    let context = ContextId::new("C1");
    assert!(hb.scheduler.is_active(&context));
    let remaining = hb.scheduler.time_remaining(&context).unwrap();
    assert!(remaining > Duration::from_secs(86_400 * 365));

    sleep(INTERVAL).await;
    assert!(hb.runner.requests().is_empty());
}

fn callbacks_with(
    runner: Arc<ScriptedSubmitter>,
    presenter: Arc<RecordingPresenter>,
    config: CallbackConfig,
) -> Arc<CallbackScheduler> {
    CallbackScheduler::with_clock(
        runner,
        presenter,
        config,
        Arc::new(FixedClock::at("2025-06-10T18:00:00Z")),
    )
}

#[tokio::test(start_paused = true)]
async fn callback_chain_arms_one_timer_per_hop() {
    let runner = Arc::new(ScriptedSubmitter::new());
    let presenter = Arc::new(RecordingPresenter::new());
    let callbacks = callbacks_with(runner.clone(), presenter.clone(), CallbackConfig::default());
    let context = ContextId::new("C1");

    runner.push_ok(RunResult {
        display_text: "checked once".to_string(),
        callbacks: vec![ScheduledCallback::new(Duration::from_secs(10), "check again")],
        ..Default::default()
    });
    runner.push_ok(RunResult {
        display_text: "checked twice".to_string(),
        ..Default::default()
    });

    let ids = callbacks.schedule(
        &context,
        vec![ScheduledCallback::new(Duration::from_secs(5), "check")],
    );
    assert_eq!(ids.len(), 1);
    let pending = callbacks.pending(&context);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].hop, 0);
    assert_eq!(pending[0].fires_at.to_rfc3339(), "2025-06-10T18:00:05+00:00");

    sleep(Duration::from_secs(5) + SLACK).await;
    let pending = callbacks.pending(&context);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].hop, 1);
    assert_eq!(pending[0].prompt, "check again");
    assert_eq!(callbacks.pending_count(), 1);

    callbacks.wait_idle().await;
    let requests = runner.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|(_, request)| request.autonomous));
    assert_eq!(requests[1].1.prompt, "check again");

    let events = presenter.events();
    assert_eq!(events.len(), 2);
    match &events[1].1 {
        PresentEvent::Result { source, result } => {
            assert_eq!(*source, AutonomousSource::Callback);
            assert_eq!(result.display_text, "checked twice");
        }
        other => panic!("expected a result, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn chain_deeper_than_limit_is_dropped() {
    let runner = Arc::new(ScriptedSubmitter::new());
    let presenter = Arc::new(RecordingPresenter::new());
    let callbacks = callbacks_with(
        runner.clone(),
        presenter.clone(),
        CallbackConfig {
            max_chain_depth: Some(1),
        },
    );
    let context = ContextId::new("C1");
    for _ in 0..3 {
        runner.push_ok(RunResult {
            display_text: "again".to_string(),
            callbacks: vec![ScheduledCallback::new(Duration::from_secs(1), "loop")],
            ..Default::default()
        });
    }

    callbacks.schedule(
        &context,
        vec![ScheduledCallback::new(Duration::from_secs(1), "loop")],
    );
    callbacks.wait_idle().await;

    // hop 0 and hop 1 run, hop 2 is refused
    assert_eq!(runner.requests().len(), 2);
    assert_eq!(callbacks.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_all_and_reset_drop_pending_callbacks() {
    let runner = Arc::new(ScriptedSubmitter::new());
    let callbacks = CallbackScheduler::headless(runner.clone());
    let first = ContextId::new("C1");
    let second = ContextId::new("C2");

    callbacks.schedule(
        &first,
        vec![
            ScheduledCallback::new(Duration::from_secs(30), "a"),
            ScheduledCallback::new(Duration::from_secs(60), "b"),
        ],
    );
    callbacks.schedule(
        &second,
        vec![ScheduledCallback::new(Duration::from_secs(30), "c")],
    );

    assert_eq!(callbacks.cancel_all(&first), 2);
    assert_eq!(callbacks.cancel_all(&first), 0);
    callbacks.context_reset(&second);

    callbacks.wait_idle().await;
    sleep(Duration::from_secs(120)).await;
    assert!(runner.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rate_limited_callback_is_reported_not_rescheduled() {
    let runner = Arc::new(ScriptedSubmitter::new());
    let presenter = Arc::new(RecordingPresenter::new());
    let callbacks = callbacks_with(runner.clone(), presenter.clone(), CallbackConfig::default());
    let context = ContextId::new("C1");
    runner.push_err(RunError::Infrastructure {
        exit_code: 1,
        stderr: "429 Too Many Requests".to_string(),
    });

    callbacks.schedule(
        &context,
        vec![ScheduledCallback::new(Duration::from_secs(1), "ping")],
    );
    callbacks.wait_idle().await;

    let events = presenter.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0].1,
        PresentEvent::RateLimited {
            source: AutonomousSource::Callback,
            resume_in: None,
            ..
        }
    ));
    assert_eq!(runner.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn callback_result_mentioning_a_usage_limit_is_not_chained() {
    let runner = Arc::new(ScriptedSubmitter::new());
    let presenter = Arc::new(RecordingPresenter::new());
    let callbacks = callbacks_with(runner.clone(), presenter.clone(), CallbackConfig::default());
    let context = ContextId::new("C1");
    runner.push_ok(RunResult {
        display_text: "Claude usage limit reached.".to_string(),
        callbacks: vec![ScheduledCallback::new(Duration::from_secs(60), "retry")],
        ..Default::default()
    });

    callbacks.schedule(
        &context,
        vec![ScheduledCallback::new(Duration::from_secs(1), "ping")],
    );
    callbacks.wait_idle().await;

    let events = presenter.events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0].1,
        PresentEvent::RateLimited { resume_in: None, .. }
    ));
    assert_eq!(callbacks.pending_count(), 0);
    assert_eq!(runner.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_refuses_new_callbacks() {
    let runner = Arc::new(ScriptedSubmitter::new());
    let callbacks = CallbackScheduler::headless(runner.clone());
    let context = ContextId::new("C1");

    callbacks.schedule(
        &context,
        vec![ScheduledCallback::new(Duration::from_secs(30), "a")],
    );
    callbacks.shutdown();
    assert_eq!(callbacks.pending_count(), 0);

    let ids = callbacks.schedule(
        &context,
        vec![ScheduledCallback::new(Duration::from_secs(1), "b")],
    );
    assert!(ids.is_empty());
    callbacks.wait_idle().await;
    assert!(runner.requests().is_empty());
}
