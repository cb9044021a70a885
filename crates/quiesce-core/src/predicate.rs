//! Busy predicates contributing to the settle decision.
//!
//! A predicate is a named rule that reports whether some part of the
//! application is still busy in a way the token registry cannot see, such as
//! "the main queue has pending jobs". Predicates are evaluated conjunctively
//! with the registry: the application is idle only if every predicate is idle.
//!
//! The predicate set is injected from configuration via [`PredicateConfig`];
//! embedders may add their own [`BusyPredicate`] implementations on top.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::main_queue::MainContext;
use crate::tracker::ActivityTracker;

/// A named rule that reports whether the application is busy.
pub trait BusyPredicate: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &str;

    /// Returns `true` while the condition this predicate watches is busy.
    fn is_busy(&self) -> bool;
}

/// Declarative predicate selection, as stored in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PredicateConfig {
    /// Busy while the main context has queued or running jobs.
    MainQueue,
    /// Busy until the registry has been unchanged for `window_ms`.
    QuietPeriod { window_ms: u64 },
}

/// An ordered collection of predicates.
#[derive(Clone, Default)]
pub struct PredicateSet {
    predicates: Vec<Arc<dyn BusyPredicate>>,
}

impl PredicateSet {
    /// Creates an empty set. An empty set never reports busy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the set described by configuration.
    pub fn from_config(
        configs: &[PredicateConfig],
        tracker: &Arc<ActivityTracker>,
        main: &Arc<dyn MainContext>,
    ) -> Self {
        let mut set = Self::new();
        for config in configs {
            match config {
                PredicateConfig::MainQueue => set.push(Arc::new(MainQueuePending::new(main.clone()))),
                PredicateConfig::QuietPeriod { window_ms } => set.push(Arc::new(QuietPeriod::new(
                    tracker.clone(),
                    Duration::from_millis(*window_ms),
                ))),
            }
        }
        set
    }

    /// Adds a predicate, builder style.
    pub fn with(mut self, predicate: Arc<dyn BusyPredicate>) -> Self {
        self.push(predicate);
        self
    }

    /// Adds a predicate.
    pub fn push(&mut self, predicate: Arc<dyn BusyPredicate>) {
        self.predicates.push(predicate);
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Names of all predicates, in evaluation order.
    pub fn names(&self) -> Vec<String> {
        self.predicates.iter().map(|p| p.name().to_string()).collect()
    }

    /// Names of the predicates currently reporting busy.
    ///
    /// Every predicate is evaluated so the diagnostic is complete.
    pub fn busy_predicates(&self) -> Vec<String> {
        self.predicates
            .iter()
            .filter(|p| p.is_busy())
            .map(|p| p.name().to_string())
            .collect()
    }
}

impl fmt::Debug for PredicateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Busy while the main context has work queued or running.
pub struct MainQueuePending {
    main: Arc<dyn MainContext>,
}

impl MainQueuePending {
    pub fn new(main: Arc<dyn MainContext>) -> Self {
        Self { main }
    }
}

impl BusyPredicate for MainQueuePending {
    fn name(&self) -> &str {
        "main-queue"
    }

    fn is_busy(&self) -> bool {
        self.main.pending_jobs() > 0
    }
}

/// Busy until the activity registry has been unchanged for a window.
///
/// Catches work that chains itself, where one token is released and the next
/// registered a moment later.
pub struct QuietPeriod {
    tracker: Arc<ActivityTracker>,
    window: Duration,
}

impl QuietPeriod {
    pub fn new(tracker: Arc<ActivityTracker>, window: Duration) -> Self {
        Self { tracker, window }
    }
}

impl BusyPredicate for QuietPeriod {
    fn name(&self) -> &str {
        "quiet-period"
    }

    fn is_busy(&self) -> bool {
        Instant::now().saturating_duration_since(self.tracker.last_change()) < self.window
    }
}

/// A predicate backed by a closure.
pub struct FnPredicate<F> {
    name: String,
    check: F,
}

impl<F> FnPredicate<F>
where
    F: Fn() -> bool + Send + Sync,
{
    /// Wraps `check`, which returns `true` while busy.
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> BusyPredicate for FnPredicate<F>
where
    F: Fn() -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_busy(&self) -> bool {
        (self.check)()
    }
}
