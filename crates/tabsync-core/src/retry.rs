//! Exponential backoff arithmetic
//!
//! The async executor lives in the runtime crate; this module only answers
//! "how long to wait before attempt N" so it can be tested without a clock.

use core::time::Duration;

/// Retry schedule for a fallible operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after `failed_attempts` failures (1-based)
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f32;
        let exponent = failed_attempts.saturating_sub(1) as i32;
        let multiplier = self.backoff_multiplier.powi(exponent);
        let delay = Duration::from_millis((base_delay * multiplier) as u64);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }

    /// Whether another attempt is allowed after `attempts_made`
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
