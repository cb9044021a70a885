//! Configuration for the synchronization core.
//!
//! Settings live in `~/.quiesce/config.json`. Every field has a default, so a
//! missing file or a partial one is fine.
//!
//! # Example
//!
//! ```no_run
//! use quiesce_core::config::SyncConfig;
//!
//! // Load (returns defaults if the file doesn't exist)
//! let config = SyncConfig::load();
//!
//! println!("settle timeout: {:?}", config.settle_timeout());
//! println!("strategy: {}", config.strategy());
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{resolve_strategy, SyncStrategy};
use crate::predicate::PredicateConfig;

const CONFIG_FILENAME: &str = "config.json";

/// Errors from loading or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Returns the quiesce data directory (`~/.quiesce/`).
///
/// Falls back to `./.quiesce` when no home directory is known.
pub fn quiesce_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quiesce")
}

/// Settings for the synchronization core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Forces the legacy (`true`) or current (`false`) strategy. When unset
    /// the `QUIESCE_USE_LEGACY_SYNC` environment flag decides.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_legacy_sync: Option<bool>,

    /// Default settle timeout for blocking entry points (default: 10000).
    pub settle_timeout_ms: u64,

    /// Fallback re-evaluation interval of the current strategy (default: 50).
    pub poll_interval_ms: u64,

    /// Polling interval of the legacy strategy (default: 100).
    pub legacy_poll_interval_ms: u64,

    /// Age after which a token is evicted as stuck; 0 disables eviction
    /// (default: 10000).
    pub eviction_timeout_ms: u64,

    /// How often the background sweeper evicts stuck tokens; 0 disables the
    /// sweeper (default: 1000).
    pub sweep_interval_ms: u64,

    /// Busy predicates evaluated alongside the registry.
    pub predicates: Vec<PredicateConfig>,

    /// Glob patterns of token handles that never count as busy.
    pub ignored_handles: Vec<String>,

    /// Append crash records to this JSON Lines file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_log: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            use_legacy_sync: None,
            settle_timeout_ms: 10_000,
            poll_interval_ms: 50,
            legacy_poll_interval_ms: 100,
            eviction_timeout_ms: 10_000,
            sweep_interval_ms: 1000,
            predicates: vec![PredicateConfig::MainQueue],
            ignored_handles: Vec::new(),
            crash_log: None,
        }
    }
}

impl SyncConfig {
    /// Path of the default config file.
    pub fn default_path() -> PathBuf {
        quiesce_dir().join(CONFIG_FILENAME)
    }

    /// Load config from `~/.quiesce/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(Self::default_path()).unwrap_or_default()
    }

    /// Load config from an explicit path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save config to `~/.quiesce/config.json`.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path())
    }

    /// Save config to an explicit path, creating parent directories.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// The strategy this configuration selects.
    pub fn strategy(&self) -> SyncStrategy {
        resolve_strategy(self.use_legacy_sync)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn legacy_poll_interval(&self) -> Duration {
        Duration::from_millis(self.legacy_poll_interval_ms.max(1))
    }

    pub fn eviction_timeout(&self) -> Option<Duration> {
        (self.eviction_timeout_ms > 0).then(|| Duration::from_millis(self.eviction_timeout_ms))
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }
}
