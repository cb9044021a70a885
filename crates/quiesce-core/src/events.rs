//! Events broadcast to harness observers.
//!
//! The tracker, executor and crash reporter publish [`SyncEvent`]s on a shared
//! broadcast channel. Subscribers (a log shipper, a live dashboard, a test
//! asserting that no resource got stuck) obtain a receiver from
//! [`SyncManager::subscribe`](crate::manager::SyncManager::subscribe).
//!
//! Sends ignore the "no subscribers" error; receivers that lag too far behind
//! miss events rather than blocking publishers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evaluator::BusyReport;
use crate::tracker::{StuckResource, TokenId, TokenKind};

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A state change worth surfacing to the harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A busy token was registered.
    TokenRegistered {
        id: TokenId,
        kind: TokenKind,
        handle: Option<String>,
    },

    /// A busy token was released by its owner.
    TokenReleased { id: TokenId, kind: TokenKind },

    /// A token exceeded the eviction timeout and was force-removed.
    StuckResource(StuckResource),

    /// A synchronized action was refused because the app did not settle.
    SettleTimedOut(BusyReport),

    /// A crash record was reported.
    CrashReported {
        /// Identifier of the stored [`CrashRecord`](crate::crash::CrashRecord).
        id: Uuid,
    },
}
