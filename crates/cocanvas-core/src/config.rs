//! Session tuning.
//!
//! The numbers here are tuned constants, not protocol constants. The only
//! relationship that matters is that a heartbeat lands well inside the lock
//! TTL, which [`SessionConfig::validate`] enforces.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default lock time-to-live in milliseconds.
pub const DEFAULT_LOCK_TTL_MS: u64 = 30_000;
/// Default heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
/// Default interval between stale-lock sweeps in milliseconds.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 15_000;
/// Default minimum spacing of live-edit broadcasts (~60 Hz).
pub const DEFAULT_LIVE_EDIT_THROTTLE_MS: u64 = 16;
/// Maximum number of undo entries to keep.
pub const DEFAULT_MAX_HISTORY: usize = 50;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables for one client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// A lock not refreshed for this long is treated as absent.
    pub lock_ttl_ms: u64,
    /// Period of the shared heartbeat task.
    pub heartbeat_interval_ms: u64,
    /// Period of the stale-lock sweep. Zero disables sweeping.
    pub sweep_interval_ms: u64,
    /// Live-edit updates closer together than this are dropped unless forced.
    pub live_edit_throttle_ms: u64,
    /// Undo stack capacity.
    pub max_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            live_edit_throttle_ms: DEFAULT_LIVE_EDIT_THROTTLE_MS,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

impl SessionConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check the relationships between the tunables.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_ttl_ms == 0 {
            return Err(ConfigError::Invalid("lockTtlMs must be positive".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeatIntervalMs must be positive".to_string(),
            ));
        }
        if self
            .heartbeat_interval_ms
            .checked_mul(2)
            .is_none_or(|twice| twice >= self.lock_ttl_ms)
        {
            return Err(ConfigError::Invalid(format!(
                "heartbeatIntervalMs ({}) must be less than half of lockTtlMs ({})",
                self.heartbeat_interval_ms, self.lock_ttl_ms
            )));
        }
        if self.max_history == 0 {
            return Err(ConfigError::Invalid("maxHistory must be positive".to_string()));
        }
        Ok(())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }
}
