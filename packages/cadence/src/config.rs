use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

use crate::pool::DEFAULT_POOL_CAPACITY;

/// Default catch-up window for wake entries that are due back to back.
pub const DEFAULT_GUARD_WINDOW_MS: u64 = 1000;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Event records kept on the pool's free list.
    pub pool_capacity: usize,
    /// Thread name of the background worker.
    pub worker_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            worker_name: "cadence-bg".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            pool_capacity: match lookup("CADENCE_POOL_CAPACITY") {
                Some(raw) => raw
                    .parse()
                    .context("CADENCE_POOL_CAPACITY must be a valid number")?,
                None => defaults.pool_capacity,
            },
            worker_name: lookup("CADENCE_WORKER_NAME").unwrap_or(defaults.worker_name),
        })
    }
}

/// Wake scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Entries due within this many milliseconds of a fire are run in the
    /// same callback instead of waiting for another alarm.
    pub guard_window_ms: u64,
    /// Key prefix in the key/value store.
    pub namespace: String,
    /// JSON file used when no store is supplied. `None` keeps the list in
    /// memory only.
    pub store_path: Option<PathBuf>,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            guard_window_ms: DEFAULT_GUARD_WINDOW_MS,
            namespace: "wake".to_string(),
            store_path: None,
        }
    }
}

impl WakeConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            guard_window_ms: match lookup("CADENCE_WAKE_GUARD_MS") {
                Some(raw) => raw
                    .parse()
                    .context("CADENCE_WAKE_GUARD_MS must be a valid number")?,
                None => defaults.guard_window_ms,
            },
            namespace: lookup("CADENCE_WAKE_NAMESPACE").unwrap_or(defaults.namespace),
            store_path: lookup("CADENCE_WAKE_STORE").map(PathBuf::from),
        })
    }

    pub fn guard_window(&self) -> Duration {
        Duration::from_millis(self.guard_window_ms)
    }

    pub(crate) fn guard_window_i64(&self) -> i64 {
        i64::try_from(self.guard_window_ms).unwrap_or(i64::MAX)
    }
}
