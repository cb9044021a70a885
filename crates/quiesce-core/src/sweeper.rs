//! Background eviction of stuck tokens.
//!
//! The idle evaluator evicts expired tokens whenever it runs, but nobody may
//! be waiting when a request leaks. The sweeper runs the same eviction on a
//! fixed interval so stuck resources are reported close to when they expire.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::sync::broadcast;
//! use quiesce_core::sweeper::{Sweeper, SweeperConfig};
//! use quiesce_core::tracker::ActivityTracker;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (events, _) = broadcast::channel(16);
//!     let tracker = Arc::new(ActivityTracker::new(Some(Duration::from_secs(10)), events));
//!
//!     let handle = Sweeper::spawn(tracker, SweeperConfig::default());
//!
//!     // Later, stop the sweeper
//!     handle.stop().await;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument};

use crate::tracker::ActivityTracker;

/// Configuration for the sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Sweep interval in milliseconds (default: 1000).
    pub interval_ms: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Handle for controlling a running sweeper.
pub struct SweeperHandle {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the sweeper and waits for it to finish.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        let _ = self.join_handle.await;
    }

    /// Cancels the sweeper without waiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Returns whether the sweeper is still running.
    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }
}

/// Periodically evicts tokens that exceeded the eviction timeout.
pub struct Sweeper;

impl Sweeper {
    /// Spawns a sweeper on the current runtime.
    pub fn spawn(tracker: Arc<ActivityTracker>, config: SweeperConfig) -> SweeperHandle {
        Self::spawn_on(&Handle::current(), tracker, config)
    }

    /// Spawns a sweeper on the given runtime.
    pub fn spawn_on(runtime: &Handle, tracker: Arc<ActivityTracker>, config: SweeperConfig) -> SweeperHandle {
        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();

        let join_handle = runtime.spawn(async move {
            Self::run_loop(tracker, config, token_clone).await;
        });

        SweeperHandle {
            cancel_token,
            join_handle,
        }
    }

    async fn run_loop(tracker: Arc<ActivityTracker>, config: SweeperConfig, cancel_token: CancellationToken) {
        let interval = Duration::from_millis(config.interval_ms.max(1));

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    let span = debug_span!("sweep");
                    async {
                        let evicted = tracker.evict_expired();
                        if !evicted.is_empty() {
                            debug!(count = evicted.len(), "sweeper evicted stuck tokens");
                        }
                    }
                    .instrument(span)
                    .await;
                }
            }
        }
    }
}
