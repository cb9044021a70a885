//! Idle evaluation and settle waiting.
//!
//! The [`IdleEvaluator`] combines the activity registry with the predicate set
//! into a single verdict: idle iff no active token is registered and every
//! predicate reports idle. When busy, the verdict carries a [`BusyReport`]
//! naming exactly what is outstanding. That report is the primary debugging
//! aid for a flaky test, so it lists tokens individually.
//!
//! Two waiting loops are provided:
//!
//! - [`IdleEvaluator::wait_until_idle`] re-evaluates on every registry
//!   generation change, with a low-frequency fallback timer for predicates
//!   whose signal is not pushed.
//! - [`IdleEvaluator::poll_until_idle`] re-evaluates on a fixed cadence only.
//!
//! Both return [`SettleTimeout`] no earlier than the deadline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::predicate::{BusyPredicate, PredicateSet};
use crate::tracker::{ActivityTracker, BusyToken, TokenId, TokenKind};

/// Stand-in horizon for deadlines too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Returns `start + timeout`, or a far-future instant when the sum overflows
/// (`Duration::MAX` is a valid way to wait without bound).
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start.checked_add(timeout).unwrap_or_else(|| start + FAR_FUTURE)
}

/// One outstanding token, as listed in a [`BusyReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyTokenSummary {
    pub id: TokenId,
    pub kind: TokenKind,
    pub handle: Option<String>,
    pub age_ms: u64,
}

impl From<&BusyToken> for BusyTokenSummary {
    fn from(token: &BusyToken) -> Self {
        Self {
            id: token.id,
            kind: token.kind,
            handle: token.handle.clone(),
            age_ms: token.age().as_millis() as u64,
        }
    }
}

/// Diagnostic describing why the application is not idle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyReport {
    /// Registry generation the report was taken at.
    pub generation: u64,
    /// Active tokens, ordered by id.
    pub tokens: Vec<BusyTokenSummary>,
    /// Names of predicates reporting busy.
    pub predicates: Vec<String>,
}

impl BusyReport {
    /// Returns `true` if nothing is busy.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.predicates.is_empty()
    }

    /// The distinct kinds of outstanding tokens.
    pub fn kinds(&self) -> BTreeSet<TokenKind> {
        self.tokens.iter().map(|t| t.kind).collect()
    }

    /// Number of outstanding tokens per kind.
    pub fn kind_counts(&self) -> BTreeMap<TokenKind, usize> {
        let mut counts = BTreeMap::new();
        for token in &self.tokens {
            *counts.entry(token.kind).or_insert(0) += 1;
        }
        counts
    }
}

impl fmt::Display for BusyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("nothing busy");
        }

        if !self.tokens.is_empty() {
            let counts: Vec<String> = self
                .kind_counts()
                .iter()
                .map(|(kind, count)| format!("{} x{}", kind, count))
                .collect();
            write!(f, "busy tokens [{}]:", counts.join(", "))?;
            for token in &self.tokens {
                write!(f, " {} {}", token.id, token.kind)?;
                if let Some(handle) = &token.handle {
                    write!(f, " {}", handle)?;
                }
                write!(f, " ({}ms);", token.age_ms)?;
            }
        }

        if !self.predicates.is_empty() {
            if !self.tokens.is_empty() {
                f.write_str(" ")?;
            }
            write!(f, "busy predicates: {}", self.predicates.join(", "))?;
        }
        Ok(())
    }
}

/// Result of a single evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleVerdict {
    Idle,
    Busy(BusyReport),
}

impl IdleVerdict {
    pub fn is_idle(&self) -> bool {
        matches!(self, IdleVerdict::Idle)
    }

    /// The busy report, if busy.
    pub fn report(&self) -> Option<&BusyReport> {
        match self {
            IdleVerdict::Idle => None,
            IdleVerdict::Busy(report) => Some(report),
        }
    }
}

/// The application was still busy when the settle deadline elapsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("still busy after {}ms: {report}", .waited.as_millis())]
pub struct SettleTimeout {
    /// How long the caller waited.
    pub waited: Duration,
    /// What was busy at the final evaluation.
    pub report: BusyReport,
}

#[derive(Debug, Clone, Copy)]
enum Wake {
    /// Wake on generation change or after the fallback interval.
    Notified { fallback: Duration },
    /// Wake only after the interval.
    Polling { interval: Duration },
}

impl Wake {
    fn interval(&self) -> Duration {
        match *self {
            Wake::Notified { fallback } => fallback,
            Wake::Polling { interval } => interval,
        }
    }
}

/// Derives the settled state from the tracker and the predicate set.
pub struct IdleEvaluator {
    tracker: Arc<ActivityTracker>,
    predicates: RwLock<PredicateSet>,
    poll_interval: Duration,
}

impl IdleEvaluator {
    /// Creates an evaluator.
    ///
    /// # Arguments
    ///
    /// * `tracker` - The activity registry to inspect
    /// * `predicates` - Additional busy rules
    /// * `poll_interval` - Fallback re-evaluation interval for [`wait_until_idle`](Self::wait_until_idle)
    pub fn new(tracker: Arc<ActivityTracker>, predicates: PredicateSet, poll_interval: Duration) -> Self {
        Self {
            tracker,
            predicates: RwLock::new(predicates),
            poll_interval,
        }
    }

    pub fn tracker(&self) -> &Arc<ActivityTracker> {
        &self.tracker
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Replaces the predicate set.
    pub fn set_predicates(&self, predicates: PredicateSet) {
        *self.predicates.write() = predicates;
    }

    /// Appends a predicate.
    pub fn add_predicate(&self, predicate: Arc<dyn BusyPredicate>) {
        self.predicates.write().push(predicate);
    }

    /// Names of the configured predicates.
    pub fn predicate_names(&self) -> Vec<String> {
        self.predicates.read().names()
    }

    /// Evaluates the current state once.
    ///
    /// Expired tokens are evicted first so a leaked request cannot keep the
    /// verdict busy past the eviction timeout.
    pub fn evaluate(&self) -> IdleVerdict {
        self.tracker.evict_expired();

        let generation = self.tracker.generation();
        let tokens: Vec<BusyTokenSummary> = self
            .tracker
            .active_tokens()
            .iter()
            .map(BusyTokenSummary::from)
            .collect();
        let predicates = self.predicates.read().busy_predicates();

        if tokens.is_empty() && predicates.is_empty() {
            IdleVerdict::Idle
        } else {
            IdleVerdict::Busy(BusyReport {
                generation,
                tokens,
                predicates,
            })
        }
    }

    /// Returns `true` if the application is idle right now.
    pub fn is_idle(&self) -> bool {
        self.evaluate().is_idle()
    }

    /// Waits until idle, re-evaluating on registry changes and on the
    /// fallback poll interval.
    pub async fn wait_until_idle(&self, deadline: Instant) -> Result<(), SettleTimeout> {
        self.settle_loop(deadline, Wake::Notified { fallback: self.poll_interval })
            .await
    }

    /// Waits until idle, re-evaluating every `interval` and ignoring change
    /// notifications.
    pub async fn poll_until_idle(&self, deadline: Instant, interval: Duration) -> Result<(), SettleTimeout> {
        self.settle_loop(deadline, Wake::Polling { interval }).await
    }

    async fn settle_loop(&self, deadline: Instant, wake: Wake) -> Result<(), SettleTimeout> {
        let started = Instant::now();
        let mut generation_rx = self.tracker.subscribe_generation();
        let mut cycles: u32 = 0;

        loop {
            // Mark the current generation as seen before evaluating so that a
            // change racing with the evaluation still wakes the next wait.
            generation_rx.borrow_and_update();
            cycles = cycles.saturating_add(1);

            let report = match self.evaluate() {
                IdleVerdict::Idle => {
                    debug!(cycles, waited_ms = started.elapsed().as_millis() as u64, "settled");
                    return Ok(());
                }
                IdleVerdict::Busy(report) => report,
            };

            let now = Instant::now();
            if now >= deadline {
                debug!(cycles, %report, "settle deadline elapsed");
                return Err(SettleTimeout {
                    waited: now - started,
                    report,
                });
            }

            trace!(cycles, generation = report.generation, "still busy");
            let next_check = std::cmp::min(now + wake.interval(), deadline);
            match wake {
                Wake::Notified { .. } => {
                    tokio::select! {
                        _ = generation_rx.changed() => {}
                        _ = tokio::time::sleep_until(next_check) => {}
                    }
                }
                Wake::Polling { .. } => tokio::time::sleep_until(next_check).await,
            }
        }
    }
}

impl fmt::Debug for IdleEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleEvaluator")
            .field("tracker", &self.tracker)
            .field("predicates", &*self.predicates.read())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}
