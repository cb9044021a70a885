//! Synchronization strategies and the backends implementing them.
//!
//! A process picks one [`SyncStrategy`] at startup. The strategy selects a
//! [`SyncBackend`], which owns the wake policy used while waiting for the
//! application to settle:
//!
//! - [`SyncStrategy::Current`] uses [`EventDrivenBackend`]: instrumented call
//!   sites push registry changes, and the wait re-evaluates as soon as one
//!   arrives (plus a fallback poll).
//! - [`SyncStrategy::Legacy`] uses [`PollingBackend`]: the wait re-evaluates
//!   on a coarse fixed cadence, for applications instrumented against the
//!   older observation API.
//!
//! Both backends share the same [`IdleEvaluator`], so they always reach the
//! same verdict; only latency differs.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::evaluator::{IdleEvaluator, IdleVerdict, SettleTimeout};
use crate::tracker::{TokenHandle, TokenKind};

/// Environment variable consulted by [`use_legacy_sync_system`].
pub const LEGACY_SYNC_ENV: &str = "QUIESCE_USE_LEGACY_SYNC";

/// The idle-detection backend in use for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    /// Coarse polling.
    Legacy,
    /// Push notifications from instrumented call sites.
    Current,
}

impl SyncStrategy {
    /// Maps the boundary "use legacy sync" flag onto a strategy.
    pub fn from_legacy_flag(use_legacy: bool) -> Self {
        if use_legacy {
            SyncStrategy::Legacy
        } else {
            SyncStrategy::Current
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, SyncStrategy::Legacy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Legacy => "legacy",
            SyncStrategy::Current => "current",
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static LEGACY_FLAG: OnceLock<bool> = OnceLock::new();

/// The process-wide legacy sync flag.
///
/// Read from [`LEGACY_SYNC_ENV`] on first call and fixed thereafter.
pub fn use_legacy_sync_system() -> bool {
    *LEGACY_FLAG.get_or_init(|| parse_flag(std::env::var(LEGACY_SYNC_ENV).ok().as_deref()))
}

/// Resolves the strategy, letting an explicit configuration value win over
/// the environment flag.
pub fn resolve_strategy(config_override: Option<bool>) -> SyncStrategy {
    SyncStrategy::from_legacy_flag(config_override.unwrap_or_else(use_legacy_sync_system))
}

fn parse_flag(value: Option<&str>) -> bool {
    match value {
        Some(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => false,
    }
}

/// Shared capability interface of the synchronization backends.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// The strategy this backend implements.
    fn strategy(&self) -> SyncStrategy;

    /// The evaluator this backend waits on.
    fn evaluator(&self) -> &IdleEvaluator;

    /// Registers a busy token.
    fn register(&self, kind: TokenKind, handle: Option<String>) -> TokenHandle {
        self.evaluator().tracker().register(kind, handle)
    }

    /// Releases a busy token. Unknown handles are ignored.
    fn deregister(&self, handle: TokenHandle) -> bool {
        self.evaluator().tracker().deregister(handle)
    }

    /// Evaluates idleness once.
    fn settle_check(&self) -> IdleVerdict {
        self.evaluator().evaluate()
    }

    /// Waits until the application settles or `deadline` elapses.
    async fn settle(&self, deadline: Instant) -> Result<(), SettleTimeout>;
}

/// Backend for [`SyncStrategy::Current`].
#[derive(Debug)]
pub struct EventDrivenBackend {
    evaluator: Arc<IdleEvaluator>,
}

impl EventDrivenBackend {
    pub fn new(evaluator: Arc<IdleEvaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl SyncBackend for EventDrivenBackend {
    fn strategy(&self) -> SyncStrategy {
        SyncStrategy::Current
    }

    fn evaluator(&self) -> &IdleEvaluator {
        &self.evaluator
    }

    async fn settle(&self, deadline: Instant) -> Result<(), SettleTimeout> {
        self.evaluator.wait_until_idle(deadline).await
    }
}

/// Backend for [`SyncStrategy::Legacy`].
#[derive(Debug)]
pub struct PollingBackend {
    evaluator: Arc<IdleEvaluator>,
    interval: Duration,
}

impl PollingBackend {
    pub fn new(evaluator: Arc<IdleEvaluator>, interval: Duration) -> Self {
        Self { evaluator, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl SyncBackend for PollingBackend {
    fn strategy(&self) -> SyncStrategy {
        SyncStrategy::Legacy
    }

    fn evaluator(&self) -> &IdleEvaluator {
        &self.evaluator
    }

    async fn settle(&self, deadline: Instant) -> Result<(), SettleTimeout> {
        self.evaluator.poll_until_idle(deadline, self.interval).await
    }
}

/// Builds the backend for `strategy`.
pub fn select_backend(
    strategy: SyncStrategy,
    evaluator: Arc<IdleEvaluator>,
    legacy_poll_interval: Duration,
) -> Arc<dyn SyncBackend> {
    match strategy {
        SyncStrategy::Current => Arc::new(EventDrivenBackend::new(evaluator)),
        SyncStrategy::Legacy => Arc::new(PollingBackend::new(evaluator, legacy_poll_interval)),
    }
}
