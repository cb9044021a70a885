//! Synchronized execution of test actions.
//!
//! [`SyncExecutor::run_synchronized`] is the single gate test actions pass
//! through. It waits for the application to settle, then marshals the action
//! onto the main context and waits for it to finish:
//!
//! 1. consult the backend selected by the strategy;
//! 2. settle within the timeout, or fail with [`SyncError::NotIdle`] carrying
//!    the busy diagnostic (the action is dropped, never run against an
//!    unsettled app);
//! 3. run the action on the main context and hand its value back.
//!
//! A call made from the main context itself (an action that synchronizes
//! again) runs the nested action directly. Waiting for the main context from
//! the main context would deadlock.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use quiesce_core::config::SyncConfig;
//! use quiesce_core::manager::SyncManager;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = SyncManager::new(SyncConfig::default()).unwrap();
//!
//!     let outcome = manager
//!         .run_synchronized(|| "tapped", Duration::from_secs(5))
//!         .await
//!         .unwrap();
//!     println!("{} after waiting {:?}", outcome.value, outcome.settle_wait);
//! }
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::{SyncBackend, SyncStrategy};
use crate::evaluator::{deadline_after, BusyReport, SettleTimeout};
use crate::events::SyncEvent;
use crate::main_queue::{Job, MainContext, MainContextClosed};

/// Errors returned by synchronized execution.
///
/// Nothing is thrown across the test/main boundary; every failure arrives
/// here as a value.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The application did not settle before the timeout.
    #[error("application is not idle: {0}")]
    NotIdle(#[from] SettleTimeout),

    /// The main context no longer accepts work.
    #[error("main context is not accepting work")]
    MainContextClosed,

    /// The action panicked while running on the main context.
    #[error("synchronized action panicked on the main context")]
    ActionPanicked,

    /// A blocking entry point was called from inside an async runtime.
    #[error("blocking synchronization called from within an async runtime")]
    BlockingInAsyncContext,
}

impl SyncError {
    /// The busy diagnostic, for [`SyncError::NotIdle`].
    pub fn busy_report(&self) -> Option<&BusyReport> {
        match self {
            SyncError::NotIdle(timeout) => Some(&timeout.report),
            _ => None,
        }
    }
}

impl From<MainContextClosed> for SyncError {
    fn from(_: MainContextClosed) -> Self {
        SyncError::MainContextClosed
    }
}

/// What a completed synchronized call produced.
#[derive(Debug, Clone)]
pub struct ActionOutcome<T> {
    /// The action's return value.
    pub value: T,
    /// Strategy in effect for the call.
    pub strategy: SyncStrategy,
    /// Time spent waiting for the application to settle.
    pub settle_wait: Duration,
    /// Time spent running the action, main-context queueing included.
    pub run_time: Duration,
    /// Whether the call was made from the main context and ran directly.
    pub reentrant: bool,
    /// Whether a settle check gated the action.
    pub synchronized: bool,
}

/// A queued action awaiting execution.
///
/// Owned by the executor from enqueue until it runs or its settle times out.
pub struct PendingAction<T> {
    id: Uuid,
    action: Box<dyn FnOnce() -> T + Send + 'static>,
    enqueued_at: Instant,
    timeout: Duration,
}

impl<T: Send + 'static> PendingAction<T> {
    pub fn new<F>(action: F, timeout: Duration) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            action: Box::new(action),
            enqueued_at: Instant::now(),
            timeout,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The instant by which the application must have settled, measured from
    /// enqueue. Timeouts too large to represent map to a far-future deadline.
    pub fn deadline(&self) -> tokio::time::Instant {
        deadline_after(tokio::time::Instant::from_std(self.enqueued_at), self.timeout)
    }

    /// Runs the action on the current thread.
    fn run(self) -> T {
        (self.action)()
    }

    /// Wraps the action in a main-context job that reports its value on `tx`.
    ///
    /// A panic drops `tx`, which the receiver observes as a closed channel.
    fn into_job(self, tx: oneshot::Sender<T>) -> Job {
        let id = self.id;
        Box::new(move || match panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
            Ok(value) => {
                let _ = tx.send(value);
            }
            Err(_) => error!(action = %id, "synchronized action panicked"),
        })
    }
}

impl<T> std::fmt::Debug for PendingAction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAction")
            .field("id", &self.id)
            .field("enqueued_at", &self.enqueued_at)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Decrements the in-flight counter when a call finishes, however it ends.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Gates actions on the idle verdict and runs them on the main context.
pub struct SyncExecutor {
    backend: Arc<dyn SyncBackend>,
    main: Arc<dyn MainContext>,
    enabled: AtomicBool,
    in_flight: AtomicUsize,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncExecutor {
    pub fn new(
        backend: Arc<dyn SyncBackend>,
        main: Arc<dyn MainContext>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            backend,
            main,
            enabled: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            events,
        }
    }

    pub fn backend(&self) -> &Arc<dyn SyncBackend> {
        &self.backend
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.backend.strategy()
    }

    /// Turns settle gating on or off. While off, actions run as soon as the
    /// main context picks them up.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        debug!(enabled, "synchronization toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Number of synchronized calls currently waiting or running.
    pub fn pending_actions(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Returns `true` if the calling thread is the main context.
    pub fn on_main_context(&self) -> bool {
        self.main.is_current()
    }

    /// Runs `action` on the main context once the application is idle.
    ///
    /// # Arguments
    ///
    /// * `action` - The work to perform, typically a UI interaction
    /// * `timeout` - How long to wait for the application to settle
    ///
    /// # Errors
    ///
    /// [`SyncError::NotIdle`] if the application is still busy at the
    /// deadline; the error lists the outstanding tokens and predicates.
    pub async fn run_synchronized<F, T>(&self, action: F, timeout: Duration) -> Result<ActionOutcome<T>, SyncError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.main.is_current() {
            return Ok(self.run_reentrant(action));
        }

        let pending = PendingAction::new(action, timeout);
        let span = info_span!(
            "run_synchronized",
            action = %pending.id(),
            strategy = %self.strategy(),
            timeout_ms = pending.timeout().as_millis() as u64
        );
        self.run_pending(pending).instrument(span).await
    }

    async fn run_pending<T>(&self, pending: PendingAction<T>) -> Result<ActionOutcome<T>, SyncError>
    where
        T: Send + 'static,
    {
        let _in_flight = InFlight::enter(&self.in_flight);
        let strategy = self.strategy();
        let synchronized = self.is_enabled();

        let settle_started = Instant::now();
        if synchronized {
            if let Err(timeout) = self.backend.settle(pending.deadline()).await {
                warn!(
                    waited_ms = timeout.waited.as_millis() as u64,
                    report = %timeout.report,
                    "refusing to run action against a busy application"
                );
                let _ = self.events.send(SyncEvent::SettleTimedOut(timeout.report.clone()));
                return Err(SyncError::NotIdle(timeout));
            }
        } else {
            debug!("synchronization disabled; skipping settle");
        }
        let settle_wait = settle_started.elapsed();

        let run_started = Instant::now();
        let (tx, rx) = oneshot::channel();
        self.main.dispatch(pending.into_job(tx))?;
        let value = rx.await.map_err(|_| SyncError::ActionPanicked)?;
        let run_time = run_started.elapsed();

        debug!(
            settle_ms = settle_wait.as_millis() as u64,
            run_ms = run_time.as_millis() as u64,
            "action complete"
        );

        Ok(ActionOutcome {
            value,
            strategy,
            settle_wait,
            run_time,
            reentrant: false,
            synchronized,
        })
    }

    /// Executes `action` directly on the calling (main) thread.
    pub(crate) fn run_reentrant<F, T>(&self, action: F) -> ActionOutcome<T>
    where
        F: FnOnce() -> T,
    {
        debug!("reentrant synchronized call; executing directly");
        let started = Instant::now();
        let value = action();
        ActionOutcome {
            value,
            strategy: self.strategy(),
            settle_wait: Duration::ZERO,
            run_time: started.elapsed(),
            reentrant: true,
            synchronized: false,
        }
    }
}

impl std::fmt::Debug for SyncExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncExecutor")
            .field("strategy", &self.strategy())
            .field("enabled", &self.is_enabled())
            .field("in_flight", &self.pending_actions())
            .finish()
    }
}
