//! Centralized Configuration Management
//!
//! This module consolidates the tunables of the bus, the retry policy, the
//! periodic synchronizer and the state store into one serde-loadable
//! structure. Durations are stored as milliseconds so TOML files stay flat.

use core::time::Duration;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TabsyncError};
use crate::retry::RetryPolicy;

// ----------------------------------------------------------------------------
// Bus Configuration
// ----------------------------------------------------------------------------

/// Configuration for the message bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Default deadline for a response, overridable per send
    pub response_timeout_ms: u64,
    /// Queue size above which a warning is logged on enqueue
    pub queue_warn_threshold: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5000,
            queue_warn_threshold: 1000,
        }
    }
}

impl BusConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Retry Configuration
// ----------------------------------------------------------------------------

/// Configuration for transport delivery retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total delivery attempts including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay_ms: u64,
    /// Cap on any single delay
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

// ----------------------------------------------------------------------------
// Sync Configuration
// ----------------------------------------------------------------------------

/// Configuration for tab-state reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the background sync timer
    pub sync_interval_ms: u64,
    /// Age after which an advisory lock is considered abandoned
    pub lock_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 5000,
            lock_timeout_ms: 5000,
        }
    }
}

impl SyncConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Store Configuration
// ----------------------------------------------------------------------------

/// Configuration for the reducer store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of actions kept in the history ring buffer
    pub history_limit: usize,
    /// Lower clamp bound of the feature parameter
    pub parameter_min: f64,
    /// Upper clamp bound of the feature parameter
    pub parameter_max: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            parameter_min: 0.0,
            parameter_max: 0.9,
        }
    }
}

// ----------------------------------------------------------------------------
// Top-level Configuration
// ----------------------------------------------------------------------------

/// Complete tabsync configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabsyncConfig {
    pub bus: BusConfig,
    pub retry: RetryConfig,
    pub sync: SyncConfig,
    pub store: StoreConfig,
}

impl TabsyncConfig {
    /// Short timers for tests and simulations
    pub fn testing() -> Self {
        Self {
            bus: BusConfig {
                response_timeout_ms: 200,
                queue_warn_threshold: 1000,
            },
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 10,
                max_delay_ms: 50,
                backoff_multiplier: 2.0,
            },
            sync: SyncConfig {
                sync_interval_ms: 100,
                lock_timeout_ms: 100,
            },
            store: StoreConfig::default(),
        }
    }

    /// Faster reconciliation for contexts that change often
    pub fn aggressive() -> Self {
        Self {
            sync: SyncConfig {
                sync_interval_ms: 1000,
                lock_timeout_ms: 2000,
            },
            retry: RetryConfig {
                max_attempts: 5,
                initial_delay_ms: 200,
                ..RetryConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: TabsyncConfig = toml::from_str(source)
            .map_err(|e| TabsyncError::config_error(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            TabsyncError::config_error(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TabsyncError::config_error(format!("Cannot encode TOML: {}", e)))
    }

    /// Reject values the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(TabsyncError::config_error("retry.max_attempts must be at least 1"));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(TabsyncError::config_error(
                "retry.max_delay_ms must not be below retry.initial_delay_ms",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(TabsyncError::config_error(
                "retry.backoff_multiplier must be at least 1.0",
            ));
        }
        if self.bus.response_timeout_ms == 0 {
            return Err(TabsyncError::config_error("bus.response_timeout_ms must be positive"));
        }
        if self.sync.sync_interval_ms == 0 || self.sync.lock_timeout_ms == 0 {
            return Err(TabsyncError::config_error("sync intervals must be positive"));
        }
        if self.store.history_limit == 0 {
            return Err(TabsyncError::config_error("store.history_limit must be positive"));
        }
        if self.store.parameter_min > self.store.parameter_max {
            return Err(TabsyncError::config_error(
                "store.parameter_min must not exceed store.parameter_max",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
