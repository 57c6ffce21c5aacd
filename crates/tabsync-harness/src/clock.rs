//! Controllable time source

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tabsync_core::{TimeSource, Timestamp};

/// Mock time source for deterministic testing
///
/// Clones share the same clock, so a test can keep one handle and hand another
/// to the component under test.
#[derive(Debug, Clone, Default)]
pub struct MockTimeSource {
    current_time: Arc<AtomicU64>,
}

impl MockTimeSource {
    /// Create a mock time source starting at time 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock time source starting at `start_time` milliseconds
    pub fn new_at(start_time: u64) -> Self {
        Self {
            current_time: Arc::new(AtomicU64::new(start_time)),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.current_time.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set_time(&self, millis: u64) {
        self.current_time.store(millis, Ordering::SeqCst);
    }

    pub fn current_time(&self) -> u64 {
        self.current_time.load(Ordering::SeqCst)
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.current_time())
    }
}
