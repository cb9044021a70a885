//! Registry of outstanding asynchronous work.
//!
//! Instrumented application code calls [`ActivityTracker::register`] when it
//! starts a unit of asynchronous work (a network request, an animation, a
//! dispatched block, a timer) and [`ActivityTracker::deregister`] when that
//! work finishes. While any token is registered the application is busy.
//!
//! Every mutation bumps a generation counter and publishes it on a
//! [`tokio::sync::watch`] channel so that waiters can re-evaluate on change
//! instead of rescanning on a fixed cadence.
//!
//! Tokens that outlive the eviction timeout are force-removed and reported as
//! [`StuckResource`]s. A leaked request shows up in the logs and the event
//! stream rather than silently pinning the app busy.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tokio::sync::broadcast;
//! use quiesce_core::tracker::{ActivityTracker, TokenKind};
//!
//! let (events, _) = broadcast::channel(16);
//! let tracker = ActivityTracker::new(Some(Duration::from_secs(10)), events);
//!
//! let handle = tracker.register(TokenKind::Network, Some("https://api.test/login".into()));
//! assert_eq!(tracker.len(), 1);
//!
//! assert!(tracker.deregister(handle));
//! assert!(!tracker.deregister(handle)); // already released
//! assert!(tracker.is_empty());
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{trace, warn};

use crate::events::SyncEvent;
use crate::filter::HandleFilter;

/// Maximum number of evicted tokens retained for diagnostics.
const MAX_STUCK_HISTORY: usize = 100;

/// The category of asynchronous work a token stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenKind {
    /// An in-flight network request.
    Network,
    /// A running animation.
    Animation,
    /// A block dispatched to a queue that has not run yet.
    DispatchedBlock,
    /// A scheduled timer that has not fired yet.
    Timer,
}

impl TokenKind {
    /// All token kinds, in display order.
    pub const ALL: [TokenKind; 4] = [
        TokenKind::Network,
        TokenKind::Animation,
        TokenKind::DispatchedBlock,
        TokenKind::Timer,
    ];

    /// Returns the kebab-case name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Network => "network",
            TokenKind::Animation => "animation",
            TokenKind::DispatchedBlock => "dispatched-block",
            TokenKind::Timer => "timer",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier of a registered token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub(crate) u64);

impl TokenId {
    /// The raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receipt returned by [`ActivityTracker::register`].
///
/// Pass it back to [`ActivityTracker::deregister`] when the work completes.
/// Handles are `Copy`; releasing one twice is harmless. A handle is bound to
/// the tracker that issued it and is ignored by any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenHandle {
    tracker: u64,
    id: TokenId,
    kind: TokenKind,
}

impl TokenHandle {
    /// The token's identifier.
    pub fn id(&self) -> TokenId {
        self.id
    }

    /// The token's kind.
    pub fn kind(&self) -> TokenKind {
        self.kind
    }
}

/// One outstanding unit of asynchronous work.
#[derive(Debug, Clone)]
pub struct BusyToken {
    /// Registry key.
    pub id: TokenId,
    /// What kind of work this is.
    pub kind: TokenKind,
    /// Optional identifying handle, e.g. a request URL or timer name.
    pub handle: Option<String>,
    /// Monotonic registration time, used for eviction.
    pub created_at: Instant,
    /// Wall-clock registration time, used in diagnostics.
    pub registered_at: DateTime<Utc>,
}

impl BusyToken {
    /// How long the token has been registered.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// A token that was force-evicted after exceeding the eviction timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckResource {
    pub id: TokenId,
    pub kind: TokenKind,
    pub handle: Option<String>,
    /// How long the token had been registered when it was evicted.
    pub age_ms: u64,
    pub registered_at: DateTime<Utc>,
    pub evicted_at: DateTime<Utc>,
}

impl fmt::Display for StuckResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} token {}", self.kind, self.id)?;
        if let Some(handle) = &self.handle {
            write!(f, " ({})", handle)?;
        }
        write!(f, " held for {}ms", self.age_ms)
    }
}

struct Registry {
    tokens: HashMap<TokenId, BusyToken>,
    last_change: Instant,
}

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

/// Thread-safe registry of busy tokens.
///
/// Mutated from arbitrary application threads; read by the idle evaluator.
pub struct ActivityTracker {
    tracker_id: u64,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    generation: AtomicU64,
    generation_tx: watch::Sender<u64>,
    eviction_timeout: Option<Duration>,
    ignored: RwLock<HandleFilter>,
    stuck: Mutex<VecDeque<StuckResource>>,
    events: broadcast::Sender<SyncEvent>,
}

impl ActivityTracker {
    /// Creates an empty tracker.
    ///
    /// # Arguments
    ///
    /// * `eviction_timeout` - Age after which a token is considered stuck and
    ///   evicted; `None` disables eviction
    /// * `events` - Channel on which registration and eviction events are published
    pub fn new(eviction_timeout: Option<Duration>, events: broadcast::Sender<SyncEvent>) -> Self {
        let (generation_tx, _) = watch::channel(0);
        Self {
            tracker_id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
            registry: Mutex::new(Registry {
                tokens: HashMap::new(),
                last_change: Instant::now(),
            }),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            generation_tx,
            eviction_timeout,
            ignored: RwLock::new(HandleFilter::default()),
            stuck: Mutex::new(VecDeque::new()),
            events,
        }
    }

    /// Registers a unit of outstanding work. Never fails.
    pub fn register(&self, kind: TokenKind, handle: Option<String>) -> TokenHandle {
        let id = TokenId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();
        let token = BusyToken {
            id,
            kind,
            handle: handle.clone(),
            created_at: now,
            registered_at: Utc::now(),
        };

        {
            let mut registry = self.registry.lock();
            registry.tokens.insert(id, token);
            registry.last_change = now;
            self.bump_generation();
        }

        trace!(%id, %kind, handle = handle.as_deref(), "token registered");
        let _ = self.events.send(SyncEvent::TokenRegistered { id, kind, handle });

        TokenHandle {
            tracker: self.tracker_id,
            id,
            kind,
        }
    }

    /// Releases a token.
    ///
    /// Returns `true` if the token was registered. Unknown or already
    /// released handles, and handles issued by another tracker, are ignored
    /// and leave the generation untouched.
    pub fn deregister(&self, handle: TokenHandle) -> bool {
        if handle.tracker != self.tracker_id {
            warn!(id = %handle.id, kind = %handle.kind, "ignoring handle issued by another tracker");
            return false;
        }

        let removed = {
            let mut registry = self.registry.lock();
            let removed = registry.tokens.remove(&handle.id).is_some();
            if removed {
                registry.last_change = Instant::now();
                self.bump_generation();
            }
            removed
        };

        if removed {
            trace!(id = %handle.id, kind = %handle.kind, "token released");
            let _ = self.events.send(SyncEvent::TokenReleased {
                id: handle.id,
                kind: handle.kind,
            });
        }
        removed
    }

    /// Returns a copy of every registered token, ignored handles included.
    pub fn snapshot(&self) -> Vec<BusyToken> {
        let registry = self.registry.lock();
        let mut tokens: Vec<BusyToken> = registry.tokens.values().cloned().collect();
        tokens.sort_by_key(|t| t.id);
        tokens
    }

    /// Returns the tokens that count towards busyness.
    ///
    /// Tokens whose handle matches the ignored-handle filter are excluded.
    pub fn active_tokens(&self) -> Vec<BusyToken> {
        let ignored = self.ignored.read();
        let mut tokens = self.snapshot();
        if !ignored.is_empty() {
            tokens.retain(|t| !t.handle.as_deref().map_or(false, |h| ignored.matches(h)));
        }
        tokens
    }

    /// Number of registered tokens, ignored handles included.
    pub fn len(&self) -> usize {
        self.registry.lock().tokens.len()
    }

    /// Returns `true` if no tokens are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current generation. Increases on every effective mutation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Subscribes to generation changes.
    pub fn subscribe_generation(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    /// Instant of the most recent registration, release or eviction.
    pub fn last_change(&self) -> Instant {
        self.registry.lock().last_change
    }

    /// The configured eviction timeout.
    pub fn eviction_timeout(&self) -> Option<Duration> {
        self.eviction_timeout
    }

    /// Replaces the ignored-handle filter.
    ///
    /// Bumps the generation, since the busy verdict may change.
    pub fn set_ignored_handles(&self, filter: HandleFilter) {
        *self.ignored.write() = filter;
        let _registry = self.registry.lock();
        self.bump_generation();
    }

    /// Returns a copy of the ignored-handle filter.
    pub fn ignored_handles(&self) -> HandleFilter {
        self.ignored.read().clone()
    }

    /// Evicts every token older than the eviction timeout.
    pub fn evict_expired(&self) -> Vec<StuckResource> {
        self.evict_expired_at(Instant::now())
    }

    /// Evicts tokens that are expired as of `now`.
    pub(crate) fn evict_expired_at(&self, now: Instant) -> Vec<StuckResource> {
        let Some(timeout) = self.eviction_timeout else {
            return Vec::new();
        };

        let evicted: Vec<BusyToken> = {
            let mut registry = self.registry.lock();
            let expired: Vec<TokenId> = registry
                .tokens
                .values()
                .filter(|t| t.age_at(now) >= timeout)
                .map(|t| t.id)
                .collect();
            if expired.is_empty() {
                return Vec::new();
            }
            let evicted = expired
                .iter()
                .filter_map(|id| registry.tokens.remove(id))
                .collect();
            registry.last_change = now;
            self.bump_generation();
            evicted
        };

        let evicted_at = Utc::now();
        let stuck: Vec<StuckResource> = evicted
            .into_iter()
            .map(|t| StuckResource {
                id: t.id,
                kind: t.kind,
                age_ms: t.age_at(now).as_millis() as u64,
                handle: t.handle,
                registered_at: t.registered_at,
                evicted_at,
            })
            .collect();

        let mut history = self.stuck.lock();
        for resource in &stuck {
            warn!(
                id = %resource.id,
                kind = %resource.kind,
                handle = resource.handle.as_deref(),
                age_ms = resource.age_ms,
                "evicting stuck resource"
            );
            if history.len() >= MAX_STUCK_HISTORY {
                history.pop_front();
            }
            history.push_back(resource.clone());
            let _ = self.events.send(SyncEvent::StuckResource(resource.clone()));
        }

        stuck
    }

    /// Recently evicted tokens, oldest first.
    pub fn stuck_history(&self) -> Vec<StuckResource> {
        self.stuck.lock().iter().cloned().collect()
    }

    // Callers hold the registry lock so the published generation never runs
    // ahead of the registry contents.
    fn bump_generation(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.generation_tx.send_replace(generation);
    }
}

impl fmt::Debug for ActivityTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("tokens", &self.len())
            .field("generation", &self.generation())
            .field("eviction_timeout", &self.eviction_timeout)
            .field("ignored", &*self.ignored.read())
            .finish()
    }
}
