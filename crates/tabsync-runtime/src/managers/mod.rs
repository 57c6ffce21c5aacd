//! Stateful managers for the tabsync runtime
//!
//! The tab state manager drives store mutations from context lifecycle events
//! and keeps remote contexts informed; the lock table keeps its overlapping
//! sync runs from duplicating notifications.

pub mod lock;
pub mod tab_state;

pub use lock::{Lock, LockGuard, LockTable};
pub use tab_state::{ContextPhase, SyncOutcome, TabStateManager, SYNC_ALL_LOCK};
