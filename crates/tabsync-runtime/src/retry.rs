//! Retry execution with exponential backoff
//!
//! Wraps a fallible async operation and re-runs it according to a
//! [`RetryPolicy`]. Only retryable failures (transport errors) are retried;
//! anything else is returned after the first attempt.

use std::future::Future;

use tabsync_core::{RetryPolicy, TabsyncResult};
use tracing::{debug, warn};

/// Runs operations under a retry policy
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently or attempts run out
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut operation: F) -> TabsyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = TabsyncResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if error.is_retryable() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tabsync_core::TabsyncError;
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_gives_up() {
        let manager = RetryManager::new(policy());
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: TabsyncResult<()> = manager
            .execute("deliver", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TabsyncError::communication("tab:1", "unreachable")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 500ms after the first failure, 1000ms after the second
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500));
        assert!(elapsed < Duration::from_millis(1600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_later_attempt() {
        let manager = RetryManager::new(policy());
        let result = manager
            .execute("deliver", |attempt| async move {
                if attempt < 2 {
                    Err(TabsyncError::communication("tab:1", "busy"))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_immediately() {
        let manager = RetryManager::new(policy());
        let calls = AtomicU32::new(0);
        let result: TabsyncResult<()> = manager
            .execute("deliver", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TabsyncError::internal("bad state")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
