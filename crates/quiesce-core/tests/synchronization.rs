//! End-to-end synchronization scenarios through the `SyncManager` facade.
//!
//! Each scenario runs under both strategies unless it is about a behavior
//! only one of them has.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{fast_config, manager_with, release_after, test_manager, RecordingSelector, SLACK, STRATEGIES};

use quiesce_core::backend::SyncStrategy;
use quiesce_core::config::SyncConfig;
use quiesce_core::crash::{ChannelTransport, CrashDetails, CrashRecord, CrashTransport, TransportError};
use quiesce_core::events::SyncEvent;
use quiesce_core::executor::SyncError;
use quiesce_core::manager::{SyncManager, MAIN_QUEUE_NAME};
use quiesce_core::tracker::TokenKind;

// ---------------------------------------------------------------------------
// Settling
// ---------------------------------------------------------------------------

#[test]
fn test_action_waits_for_network_token() {
    for strategy in STRATEGIES {
        let manager = test_manager(strategy);
        let request = manager.register(TokenKind::Network, Some("https://api.test/feed".into()));
        assert!(!manager.is_idle());

        let releaser = release_after(&manager, request, Duration::from_millis(150));
        let started = Instant::now();
        let outcome = manager
            .run_synchronized_blocking(|| 42, Duration::from_secs(2))
            .unwrap();
        releaser.join().unwrap();

        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.strategy, strategy);
        assert!(outcome.synchronized);
        assert!(!outcome.reentrant);
        assert!(started.elapsed() >= Duration::from_millis(140), "{strategy}: ran too early");
        assert!(manager.is_idle());
    }
}

#[test]
fn test_idle_app_runs_immediately() {
    for strategy in STRATEGIES {
        let manager = test_manager(strategy);
        let outcome = manager
            .run_synchronized_blocking(|| "tapped", Duration::from_secs(1))
            .unwrap();
        assert_eq!(outcome.value, "tapped");
        assert!(outcome.settle_wait < SLACK);
    }
}

#[test]
fn test_timeout_reports_only_outstanding_kind() {
    for strategy in STRATEGIES {
        let manager = test_manager(strategy);
        manager.register(TokenKind::Animation, None);

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let started = Instant::now();
        let err = manager
            .run_synchronized_blocking(move || ran_clone.store(true, Ordering::SeqCst), Duration::from_millis(100))
            .unwrap_err();
        let elapsed = started.elapsed();

        let report = err.busy_report().expect("timeout carries a busy report");
        assert_eq!(report.kinds(), BTreeSet::from([TokenKind::Animation]));
        assert!(report.predicates.is_empty());
        assert!(elapsed >= Duration::from_millis(100), "{strategy}: gave up early");
        assert!(elapsed < Duration::from_millis(100) + SLACK, "{strategy}: gave up late");
        assert!(!ran.load(Ordering::SeqCst), "action must not run against a busy app");
    }
}

#[test]
fn test_timeout_is_broadcast() {
    let manager = test_manager(SyncStrategy::Current);
    let mut events = manager.subscribe();
    manager.register(TokenKind::Timer, Some("retry-timer".into()));

    let err = manager
        .run_synchronized_blocking(|| (), Duration::from_millis(30))
        .unwrap_err();
    assert!(matches!(err, SyncError::NotIdle(_)));

    let mut saw_timeout = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::SettleTimedOut(report) = event {
            assert_eq!(report.tokens[0].handle.as_deref(), Some("retry-timer"));
            saw_timeout = true;
        }
    }
    assert!(saw_timeout);
}

#[test]
fn test_unbounded_timeout_runs_when_idle() {
    for strategy in STRATEGIES {
        let manager = test_manager(strategy);
        let outcome = manager
            .run_synchronized_blocking(|| 1, Duration::MAX)
            .unwrap();
        assert_eq!(outcome.value, 1);
    }
}

#[tokio::test]
async fn test_wait_until_idle_accepts_unbounded_timeout() {
    for strategy in STRATEGIES {
        let manager = test_manager(strategy);
        manager.wait_until_idle(Duration::MAX).await.unwrap();
    }
}

#[test]
fn test_handles_do_not_cross_managers() {
    let first = test_manager(SyncStrategy::Current);
    let second = test_manager(SyncStrategy::Current);
    let foreign = first.register(TokenKind::Network, Some("https://a.test".into()));
    second.register(TokenKind::Network, Some("https://b.test".into()));

    assert!(!second.deregister(foreign));
    assert!(!second.is_idle());
    assert!(first.deregister(foreign));
    assert!(first.is_idle());
}

#[test]
fn test_strategies_agree_on_verdicts() {
    let legacy = test_manager(SyncStrategy::Legacy);
    let current = test_manager(SyncStrategy::Current);

    let mut handles = Vec::new();
    for (i, kind) in TokenKind::ALL.into_iter().enumerate() {
        let handle = Some(format!("resource-{i}"));
        handles.push((legacy.register(kind, handle.clone()), current.register(kind, handle)));

        let l = legacy.settle_check();
        let c = current.settle_check();
        assert_eq!(l.is_idle(), c.is_idle());
        assert_eq!(l.report().map(|r| r.kinds()), c.report().map(|r| r.kinds()));
    }

    for (l, c) in handles {
        legacy.deregister(l);
        current.deregister(c);
        assert_eq!(legacy.is_idle(), current.is_idle());
    }
    assert!(legacy.is_idle() && current.is_idle());
}

#[test]
fn test_disabled_synchronization_skips_settle() {
    for strategy in STRATEGIES {
        let manager = test_manager(strategy);
        manager.register(TokenKind::Network, None);
        manager.set_synchronization_enabled(false);
        assert!(!manager.synchronization_enabled());

        let outcome = manager
            .run_synchronized_blocking(|| 7, Duration::from_millis(50))
            .unwrap();
        assert_eq!(outcome.value, 7);
        assert!(!outcome.synchronized);

        manager.set_synchronization_enabled(true);
        assert!(manager.run_synchronized_blocking(|| 7, Duration::from_millis(50)).is_err());
    }
}

// ---------------------------------------------------------------------------
// Main context
// ---------------------------------------------------------------------------

#[test]
fn test_actions_run_on_main_queue() {
    for strategy in STRATEGIES {
        let manager = test_manager(strategy);
        let outcome = manager
            .run_synchronized_blocking(|| std::thread::current().name().map(str::to_string), Duration::from_secs(1))
            .unwrap();
        assert_eq!(outcome.value.as_deref(), Some(MAIN_QUEUE_NAME));
    }
}

#[test]
fn test_reentrant_call_does_not_deadlock() {
    for strategy in STRATEGIES {
        let manager = test_manager(strategy);
        let inner_manager = manager.clone();

        let outcome = manager
            .run_synchronized_blocking(
                move || {
                    // The app is busy now, but a nested call must still run directly.
                    inner_manager.register(TokenKind::DispatchedBlock, None);
                    inner_manager
                        .run_synchronized_blocking(|| "inner", Duration::from_millis(10))
                        .unwrap()
                },
                Duration::from_secs(1),
            )
            .unwrap();

        assert_eq!(outcome.value.value, "inner");
        assert!(outcome.value.reentrant);
        assert!(!outcome.reentrant);
    }
}

#[test]
fn test_safe_execute_sync_nested() {
    let manager = test_manager(SyncStrategy::Legacy);
    let inner_manager = manager.clone();
    let (tx, rx) = std::sync::mpsc::channel();

    manager
        .safe_execute_sync(move || {
            let tx = tx.clone();
            inner_manager.safe_execute_sync(move || tx.send("nested").unwrap()).unwrap();
        })
        .unwrap();

    assert_eq!(rx.try_recv().unwrap(), "nested");
}

#[test]
fn test_panicking_action_is_reported_and_queue_survives() {
    for strategy in STRATEGIES {
        let manager = test_manager(strategy);
        let err = manager
            .run_synchronized_blocking(|| -> i32 { panic!("boom") }, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SyncError::ActionPanicked));

        let outcome = manager
            .run_synchronized_blocking(|| 1 + 1, Duration::from_secs(1))
            .unwrap();
        assert_eq!(outcome.value, 2);
    }
}

#[tokio::test]
async fn test_blocking_entry_point_rejected_in_async_context() {
    let manager = test_manager(SyncStrategy::Current);
    let result = manager.safe_execute_sync(|| ());
    assert!(matches!(result, Err(SyncError::BlockingInAsyncContext)));
}

#[tokio::test]
async fn test_async_run_synchronized_waits_for_release() {
    for strategy in STRATEGIES {
        let manager = test_manager(strategy);
        let timer = manager.register(TokenKind::Timer, None);

        let releaser = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            releaser.deregister(timer);
        });

        let outcome = manager
            .run_synchronized(|| "done", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome.value, "done");
        assert!(outcome.settle_wait >= Duration::from_millis(70));
    }
}

#[tokio::test]
async fn test_wait_until_idle_times_out() {
    let manager = test_manager(SyncStrategy::Current);
    manager.register(TokenKind::Network, Some("https://slow.test".into()));

    let timeout = manager
        .wait_until_idle(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(timeout.waited >= Duration::from_millis(50));
    assert_eq!(timeout.report.tokens.len(), 1);
    assert!(timeout.to_string().contains("https://slow.test"));
}

// ---------------------------------------------------------------------------
// Element selection
// ---------------------------------------------------------------------------

#[test]
fn test_legacy_selection_runs_on_main_queue() {
    let manager = test_manager(SyncStrategy::Legacy);
    let selector = Arc::new(RecordingSelector::default());

    let (matcher, thread) = manager
        .select_element_with_matcher(selector.clone(), "login-button".to_string())
        .unwrap();
    assert_eq!(matcher, "login-button");
    assert_eq!(thread.as_deref(), Some(MAIN_QUEUE_NAME));
    assert_eq!(selector.lookups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_legacy_selection_fails_when_busy() {
    let config = SyncConfig {
        settle_timeout_ms: 50,
        ..fast_config()
    };
    let manager = manager_with(SyncStrategy::Legacy, config);
    manager.register(TokenKind::Animation, None);
    let selector = Arc::new(RecordingSelector::default());

    let err = manager
        .select_element_with_matcher(selector.clone(), "login-button".to_string())
        .unwrap_err();
    assert!(matches!(err, SyncError::NotIdle(_)));
    assert_eq!(selector.lookups.load(Ordering::SeqCst), 0);
}

#[test]
fn test_current_selection_is_immediate() {
    let manager = test_manager(SyncStrategy::Current);
    manager.register(TokenKind::Animation, None);
    let selector = Arc::new(RecordingSelector::default());

    let (_, thread) = manager
        .select_element_with_matcher(selector.clone(), "login-button".to_string())
        .unwrap();
    assert_ne!(thread.as_deref(), Some(MAIN_QUEUE_NAME));
    assert_eq!(selector.lookups.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Crash reporting
// ---------------------------------------------------------------------------

fn crash_details(reason: &str) -> CrashDetails {
    let mut details = CrashDetails::new();
    details.insert("reason".into(), reason.into());
    details.insert("signal".into(), 6i64.into());
    details
}

#[test]
fn test_crash_forwarded_to_transport() {
    let (transport, mut rx) = ChannelTransport::new();
    let manager = SyncManager::builder()
        .config(fast_config())
        .crash_transport(Arc::new(transport))
        .without_sweeper()
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    let id = manager.report_crash(crash_details("EXC_BAD_ACCESS"));

    let forwarded = rx.try_recv().unwrap();
    assert_eq!(forwarded.id, id);
    assert_eq!(forwarded.summary(), Some("EXC_BAD_ACCESS"));
    assert!(matches!(events.try_recv(), Ok(SyncEvent::CrashReported { id: event_id }) if event_id == id));

    let pending = manager.take_pending_crash().unwrap();
    assert_eq!(pending.id, id);
    assert!(manager.take_pending_crash().is_none());
}

struct PanickingTransport;

impl CrashTransport for PanickingTransport {
    fn forward(&self, _record: &CrashRecord) -> Result<(), TransportError> {
        panic!("transport exploded");
    }
}

struct FailingTransport;

impl CrashTransport for FailingTransport {
    fn forward(&self, _record: &CrashRecord) -> Result<(), TransportError> {
        Err(TransportError::Closed)
    }
}

#[test]
fn test_crash_reporting_survives_broken_transports() {
    let transports: [Arc<dyn CrashTransport>; 2] = [Arc::new(PanickingTransport), Arc::new(FailingTransport)];
    for transport in transports {
        let manager = SyncManager::builder()
            .config(fast_config())
            .crash_transport(transport)
            .without_sweeper()
            .build()
            .unwrap();

        let id = manager.report_crash(crash_details("SIGSEGV"));
        assert_eq!(manager.take_pending_crash().map(|c| c.id), Some(id));
    }
}

#[test]
fn test_crash_without_transport_is_kept() {
    let manager = test_manager(SyncStrategy::Current);
    let first = manager.report_crash(crash_details("first"));
    let second = manager.report_crash(crash_details("second"));
    assert_ne!(first, second);
    assert_eq!(manager.take_pending_crash().unwrap().summary(), Some("second"));
}

// ---------------------------------------------------------------------------
// Stuck tokens and filtering
// ---------------------------------------------------------------------------

#[test]
fn test_sweeper_evicts_stuck_token() {
    let config = SyncConfig {
        eviction_timeout_ms: 50,
        sweep_interval_ms: 10,
        ..fast_config()
    };
    let manager = SyncManager::builder().config(config).build().unwrap();
    let mut events = manager.subscribe();
    manager.register(TokenKind::Network, Some("https://leak.test/socket".into()));

    std::thread::sleep(Duration::from_millis(300));

    // The sweeper has already evicted it, so nothing is left to evaluate.
    assert!(manager.tracker().is_empty());
    let stuck = manager.stuck_resources();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].handle.as_deref(), Some("https://leak.test/socket"));
    assert!(stuck[0].age_ms >= 50);

    let mut saw_registered = false;
    let mut saw_stuck = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::TokenRegistered { .. } => saw_registered = true,
            SyncEvent::StuckResource(resource) => saw_stuck = resource.kind == TokenKind::Network,
            _ => {}
        }
    }
    assert!(saw_registered && saw_stuck);
}

#[test]
fn test_stuck_token_does_not_block_forever() {
    for strategy in STRATEGIES {
        let config = SyncConfig {
            eviction_timeout_ms: 100,
            ..fast_config()
        };
        let manager = manager_with(strategy, config);
        manager.register(TokenKind::Animation, Some("spinner".into()));

        let outcome = manager
            .run_synchronized_blocking(|| (), Duration::from_secs(2))
            .unwrap();
        assert!(outcome.settle_wait >= Duration::from_millis(90));
        assert_eq!(manager.stuck_resources().len(), 1);
    }
}

#[test]
fn test_ignored_handles_never_block() {
    for strategy in STRATEGIES {
        let manager = test_manager(strategy);
        manager.set_ignored_handles(["*analytics*", "https://cdn.test/?"]);

        manager.register(TokenKind::Network, Some("https://analytics.test/beacon".into()));
        manager.register(TokenKind::Network, Some("https://cdn.test/a".into()));
        assert!(manager.is_idle());

        let api = manager.register(TokenKind::Network, Some("https://api.test/login".into()));
        let verdict = manager.dump_busy_resources(Some("test_ignored_handles_never_block"));
        assert_eq!(verdict.report().unwrap().tokens.len(), 1);

        manager.deregister(api);
        assert!(manager.is_idle());
    }
}
