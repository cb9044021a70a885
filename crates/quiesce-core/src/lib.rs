//! # quiesce-core
//!
//! Idle detection and synchronized action execution for in-process UI test
//! agents.
//!
//! Instrumented application code registers *busy tokens* (network requests,
//! animations, dispatched blocks, timers) while it works. Test actions pass
//! through a synchronized executor that waits until no tokens are
//! outstanding and every busy predicate is clear, then runs the action on
//! the application's main context.
//!
//! ## Modules
//!
//! - [`tracker`] - Registry of outstanding busy tokens with stuck-token eviction
//! - [`filter`] - Glob patterns for token handles that never count as busy
//! - [`predicate`] - Pluggable busy predicates (main queue, quiet period)
//! - [`evaluator`] - Idle verdicts, busy diagnostics and settle waiting
//! - [`backend`] - Legacy (polling) and current (event-driven) strategies
//! - [`main_queue`] - The main execution context actions run on
//! - [`executor`] - The synchronized action gate
//! - [`crash`] - Crash reporting and forwarding to the harness
//! - [`sweeper`] - Background eviction of stuck tokens
//! - [`events`] - Broadcast events for observers
//! - [`config`] - Persistent configuration (`~/.quiesce/config.json`)
//! - [`interaction`] - Seam for the external element selector
//! - [`manager`] - The process-wide context object tying it all together
//!
//! ## Strategy selection
//!
//! The `QUIESCE_USE_LEGACY_SYNC` environment flag (or `use_legacy_sync` in the
//! config file) selects the legacy polling strategy. It is read once per
//! process; a manager never changes strategy after construction.
//!
//! ## Example
//!
//! ```no_run
//! use quiesce_core::config::SyncConfig;
//! use quiesce_core::manager::SyncManager;
//! use quiesce_core::tracker::TokenKind;
//!
//! let manager = SyncManager::new(SyncConfig::load()).expect("failed to start");
//!
//! let animation = manager.register(TokenKind::Animation, None);
//! assert!(!manager.is_idle());
//! manager.deregister(animation);
//!
//! manager
//!     .safe_execute_sync(|| println!("app is idle, tapping"))
//!     .expect("app never settled");
//! ```

pub mod backend;
pub mod config;
pub mod crash;
pub mod evaluator;
pub mod events;
pub mod executor;
pub mod filter;
pub mod interaction;
pub mod main_queue;
pub mod manager;
pub mod predicate;
pub mod sweeper;
pub mod tracker;
