//! The synchronization manager: one context object per test-harness process.
//!
//! [`SyncManager`] owns every moving part of the core (activity tracker,
//! idle evaluator, strategy backend, synchronized executor, main context,
//! crash reporter, sweeper) and is the only type the outer harness needs.
//! The harness constructs exactly one at startup and passes it (or an
//! `Arc` of it) to whatever needs it.
//!
//! # Lifecycle
//!
//! - [`SyncManager::new`] / [`SyncManager::builder`] resolve the strategy once;
//!   it never changes for the manager's lifetime.
//! - A small internal runtime drives the sweeper and the blocking entry
//!   points ([`SyncManager::safe_execute_sync`],
//!   [`SyncManager::run_synchronized_blocking`]).
//! - Dropping the manager stops the sweeper, shuts the runtime down in the
//!   background and drains the main queue.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use quiesce_core::config::SyncConfig;
//! use quiesce_core::manager::SyncManager;
//! use quiesce_core::tracker::TokenKind;
//!
//! let manager = SyncManager::new(SyncConfig::default()).unwrap();
//!
//! // Instrumented app code
//! let request = manager.register(TokenKind::Network, Some("https://api.test/feed".into()));
//! manager.deregister(request);
//!
//! // Test thread
//! manager.safe_execute_sync(|| println!("tapping login button")).unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{select_backend, SyncBackend, SyncStrategy};
use crate::config::SyncConfig;
use crate::crash::{CrashDetails, CrashRecord, CrashReporter, CrashTransport, JsonLinesTransport};
use crate::evaluator::{deadline_after, IdleEvaluator, IdleVerdict, SettleTimeout};
use crate::events::{SyncEvent, EVENT_CHANNEL_CAPACITY};
use crate::executor::{ActionOutcome, SyncError, SyncExecutor};
use crate::filter::HandleFilter;
use crate::interaction::ElementSelector;
use crate::main_queue::{MainContext, MainQueue};
use crate::predicate::{BusyPredicate, PredicateSet};
use crate::sweeper::{Sweeper, SweeperConfig, SweeperHandle};
use crate::tracker::{ActivityTracker, StuckResource, TokenHandle, TokenKind};

/// Name of the thread backing the default main context.
pub const MAIN_QUEUE_NAME: &str = "quiesce-main";

/// Errors constructing a [`SyncManager`].
#[derive(Error, Debug)]
pub enum ManagerError {
    /// The internal runtime or the main-queue thread could not be started.
    #[error("failed to start synchronization threads: {0}")]
    Spawn(std::io::Error),

    /// The configured crash log could not be opened.
    #[error("failed to open crash log: {0}")]
    CrashLog(std::io::Error),
}

/// Builder for [`SyncManager`].
#[derive(Default)]
pub struct SyncManagerBuilder {
    config: SyncConfig,
    strategy: Option<SyncStrategy>,
    main: Option<Arc<dyn MainContext>>,
    transport: Option<Arc<dyn CrashTransport>>,
    predicates: Vec<Arc<dyn BusyPredicate>>,
    sweeper: bool,
}

impl SyncManagerBuilder {
    fn new() -> Self {
        Self {
            sweeper: true,
            ..Self::default()
        }
    }

    /// Uses `config` instead of the defaults.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Forces a strategy, overriding the configuration and the environment flag.
    pub fn strategy(mut self, strategy: SyncStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Runs actions on an embedder-provided main context instead of a
    /// dedicated [`MainQueue`] thread.
    pub fn main_context(mut self, main: Arc<dyn MainContext>) -> Self {
        self.main = Some(main);
        self
    }

    /// Forwards crash reports to `transport` (takes precedence over `crash_log`).
    pub fn crash_transport(mut self, transport: Arc<dyn CrashTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Adds a busy predicate on top of the configured ones.
    pub fn predicate(mut self, predicate: Arc<dyn BusyPredicate>) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Disables the background sweeper.
    pub fn without_sweeper(mut self) -> Self {
        self.sweeper = false;
        self
    }

    pub fn build(self) -> Result<SyncManager, ManagerError> {
        let config = self.config;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let tracker = Arc::new(ActivityTracker::new(config.eviction_timeout(), events.clone()));
        if !config.ignored_handles.is_empty() {
            tracker.set_ignored_handles(HandleFilter::new(config.ignored_handles.iter().cloned()));
        }

        let main: Arc<dyn MainContext> = match self.main {
            Some(main) => main,
            None => MainQueue::spawn(MAIN_QUEUE_NAME).map_err(ManagerError::Spawn)?,
        };

        let mut predicates = PredicateSet::from_config(&config.predicates, &tracker, &main);
        for predicate in self.predicates {
            predicates.push(predicate);
        }

        let evaluator = Arc::new(IdleEvaluator::new(tracker.clone(), predicates, config.poll_interval()));
        let strategy = self.strategy.unwrap_or_else(|| config.strategy());
        let backend = select_backend(strategy, evaluator.clone(), config.legacy_poll_interval());
        let executor = SyncExecutor::new(backend, main.clone(), events.clone());

        let transport: Option<Arc<dyn CrashTransport>> = match (self.transport, &config.crash_log) {
            (Some(transport), _) => Some(transport),
            (None, Some(path)) => Some(Arc::new(JsonLinesTransport::open(path).map_err(ManagerError::CrashLog)?)),
            (None, None) => None,
        };
        let crash = CrashReporter::new(transport, events.clone());

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("quiesce-sync")
            .enable_time()
            .build()
            .map_err(ManagerError::Spawn)?;

        let sweeper = match (self.sweeper, config.sweep_interval(), config.eviction_timeout()) {
            (true, Some(interval), Some(_)) => Some(Sweeper::spawn_on(
                runtime.handle(),
                tracker.clone(),
                SweeperConfig {
                    interval_ms: interval.as_millis() as u64,
                },
            )),
            _ => None,
        };

        info!(
            %strategy,
            predicates = ?evaluator.predicate_names(),
            sweeper = sweeper.is_some(),
            "synchronization manager ready"
        );

        Ok(SyncManager {
            strategy,
            config,
            tracker,
            evaluator,
            executor,
            crash,
            main,
            events,
            sweeper,
            runtime: Some(runtime),
        })
    }
}

/// Process-wide synchronization context for the test harness.
pub struct SyncManager {
    strategy: SyncStrategy,
    config: SyncConfig,
    tracker: Arc<ActivityTracker>,
    evaluator: Arc<IdleEvaluator>,
    executor: SyncExecutor,
    crash: CrashReporter,
    main: Arc<dyn MainContext>,
    events: broadcast::Sender<SyncEvent>,
    sweeper: Option<SweeperHandle>,
    runtime: Option<Runtime>,
}

impl SyncManager {
    /// Creates a manager from `config` with a dedicated main queue.
    pub fn new(config: SyncConfig) -> Result<Self, ManagerError> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> SyncManagerBuilder {
        SyncManagerBuilder::new()
    }

    /// The strategy fixed at construction.
    pub fn strategy(&self) -> SyncStrategy {
        self.strategy
    }

    /// Whether the legacy polling backend is in use.
    pub fn uses_legacy_sync(&self) -> bool {
        self.strategy.is_legacy()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<ActivityTracker> {
        &self.tracker
    }

    pub fn evaluator(&self) -> &Arc<IdleEvaluator> {
        &self.evaluator
    }

    pub fn executor(&self) -> &SyncExecutor {
        &self.executor
    }

    pub fn main_context(&self) -> &Arc<dyn MainContext> {
        &self.main
    }

    fn backend(&self) -> &Arc<dyn SyncBackend> {
        self.executor.backend()
    }

    /// Registers a busy token on behalf of instrumented app code.
    pub fn register(&self, kind: TokenKind, handle: Option<String>) -> TokenHandle {
        self.backend().register(kind, handle)
    }

    /// Releases a busy token. Unknown handles are ignored.
    pub fn deregister(&self, handle: TokenHandle) -> bool {
        self.backend().deregister(handle)
    }

    /// Returns `true` if the application is idle right now.
    pub fn is_idle(&self) -> bool {
        self.backend().settle_check().is_idle()
    }

    /// Evaluates idleness once, returning the diagnostic when busy.
    pub fn settle_check(&self) -> IdleVerdict {
        self.backend().settle_check()
    }

    /// Waits up to `timeout` for the application to settle.
    pub async fn wait_until_idle(&self, timeout: Duration) -> Result<(), SettleTimeout> {
        self.backend()
            .settle(deadline_after(tokio::time::Instant::now(), timeout))
            .await
    }

    /// Runs `action` on the main context once the application is idle.
    ///
    /// See [`SyncExecutor::run_synchronized`].
    pub async fn run_synchronized<F, T>(&self, action: F, timeout: Duration) -> Result<ActionOutcome<T>, SyncError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.executor.run_synchronized(action, timeout).await
    }

    /// Blocking form of [`run_synchronized`](Self::run_synchronized) for
    /// plain threads and for actions that synchronize again from the main
    /// context.
    ///
    /// # Errors
    ///
    /// [`SyncError::BlockingInAsyncContext`] when called from a thread that
    /// is driving an async runtime; use the async form there.
    pub fn run_synchronized_blocking<F, T>(&self, action: F, timeout: Duration) -> Result<ActionOutcome<T>, SyncError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.main.is_current() {
            return Ok(self.executor.run_reentrant(action));
        }
        if Handle::try_current().is_ok() {
            return Err(SyncError::BlockingInAsyncContext);
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(SyncError::MainContextClosed);
        };
        runtime.block_on(self.executor.run_synchronized(action, timeout))
    }

    /// Runs `block` on the main context once idle, waiting up to the
    /// configured settle timeout. Blocks the caller until the block has run.
    pub fn safe_execute_sync<F>(&self, block: F) -> Result<(), SyncError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_synchronized_blocking(block, self.config.settle_timeout())
            .map(|_| ())
    }

    /// Resolves `matcher` through the external element selector.
    ///
    /// On the legacy strategy the lookup runs on the main context after a
    /// successful settle; on the current strategy it runs immediately.
    pub fn select_element_with_matcher<S>(
        &self,
        selector: Arc<S>,
        matcher: S::Matcher,
    ) -> Result<S::Interaction, SyncError>
    where
        S: ElementSelector,
    {
        match self.strategy {
            SyncStrategy::Legacy => self
                .run_synchronized_blocking(
                    move || selector.select_element(matcher),
                    self.config.settle_timeout(),
                )
                .map(|outcome| outcome.value),
            SyncStrategy::Current => Ok(selector.select_element(matcher)),
        }
    }

    /// Reports an application crash. Never panics and never fails.
    pub fn report_crash(&self, details: CrashDetails) -> Uuid {
        self.crash.report(details)
    }

    /// Returns the last reported crash and clears it.
    pub fn take_pending_crash(&self) -> Option<CrashRecord> {
        self.crash.take_pending()
    }

    /// Logs what is currently keeping the application busy.
    ///
    /// Meant for a harness whose test just timed out; `label` is typically
    /// the test name.
    pub fn dump_busy_resources(&self, label: Option<&str>) -> IdleVerdict {
        let verdict = self.settle_check();
        match verdict.report() {
            Some(report) => warn!(test = label, %report, "application still busy"),
            None => debug!(test = label, "no busy resources"),
        }
        verdict
    }

    /// Subscribes to tracker, settle and crash events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Enables or disables settle gating for synchronized actions.
    pub fn set_synchronization_enabled(&self, enabled: bool) {
        self.executor.set_enabled(enabled);
    }

    pub fn synchronization_enabled(&self) -> bool {
        self.executor.is_enabled()
    }

    /// Replaces the glob patterns of handles that never count as busy.
    pub fn set_ignored_handles<I, S>(&self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tracker.set_ignored_handles(HandleFilter::new(patterns));
    }

    /// Recently evicted stuck tokens.
    pub fn stuck_resources(&self) -> Vec<StuckResource> {
        self.tracker.stuck_history()
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.cancel();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("strategy", &self.strategy)
            .field("tracker", &self.tracker)
            .field("executor", &self.executor)
            .field("crash", &self.crash)
            .field("sweeper", &self.sweeper.is_some())
            .finish()
    }
}
