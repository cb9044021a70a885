//! Shared test helpers for quiesce-core integration tests.
//!
//! Managers built here use short poll intervals and no background sweeper so
//! timing assertions stay tight.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quiesce_core::backend::SyncStrategy;
use quiesce_core::config::SyncConfig;
use quiesce_core::interaction::ElementSelector;
use quiesce_core::manager::SyncManager;
use quiesce_core::predicate::PredicateConfig;
use quiesce_core::tracker::TokenHandle;

/// Both strategies, for tests that must hold regardless of the flag.
pub const STRATEGIES: [SyncStrategy; 2] = [SyncStrategy::Legacy, SyncStrategy::Current];

/// Upper bound on how late a settle verdict may arrive past its deadline.
pub const SLACK: Duration = Duration::from_millis(500);

/// A config tuned for tests: fast polling, no eviction, no sweeper.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        settle_timeout_ms: 2000,
        poll_interval_ms: 10,
        legacy_poll_interval_ms: 20,
        eviction_timeout_ms: 0,
        sweep_interval_ms: 0,
        predicates: vec![PredicateConfig::MainQueue],
        ..SyncConfig::default()
    }
}

pub fn test_manager(strategy: SyncStrategy) -> Arc<SyncManager> {
    manager_with(strategy, fast_config())
}

pub fn manager_with(strategy: SyncStrategy, config: SyncConfig) -> Arc<SyncManager> {
    Arc::new(
        SyncManager::builder()
            .config(config)
            .strategy(strategy)
            .without_sweeper()
            .build()
            .unwrap(),
    )
}

/// Releases `handle` from another thread after `delay`.
pub fn release_after(manager: &Arc<SyncManager>, handle: TokenHandle, delay: Duration) -> thread::JoinHandle<()> {
    let manager = manager.clone();
    thread::spawn(move || {
        thread::sleep(delay);
        manager.deregister(handle);
    })
}

/// Element selector that records which thread performed each lookup.
#[derive(Default)]
pub struct RecordingSelector {
    pub lookups: AtomicUsize,
}

impl ElementSelector for RecordingSelector {
    type Matcher = String;
    type Interaction = (String, Option<String>);

    fn select_element(&self, matcher: String) -> (String, Option<String>) {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        (matcher, thread::current().name().map(str::to_string))
    }
}
