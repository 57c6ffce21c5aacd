//! Tab State Manager
//!
//! Translates host lifecycle callbacks (context created, navigated, focused,
//! removed) into store dispatches and pushes the minimal per-context snapshot
//! to each affected context afterwards. A periodic timer re-sends snapshots to
//! every registered context so a lost notification is superseded by the next
//! run.
//!
//! Per context the manager tracks
//! `Unregistered -> Registered -> Active <-> Inactive -> Unregistered`,
//! derived from the store rather than kept separately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use tabsync_core::{
    ActionCreator, ApplicationState, ContextId, ContextNotifier, StateStore, SyncConfig,
    TabsyncError, TabsyncResult, TimeSource, Timestamp,
};

use super::lock::LockTable;

/// Lock key of the all-contexts sync run
pub const SYNC_ALL_LOCK: &str = "syncAll";

// ----------------------------------------------------------------------------
// Phases and Outcomes
// ----------------------------------------------------------------------------

/// Lifecycle phase of one context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextPhase {
    Unregistered,
    /// Registered but never focused
    Registered,
    Active,
    /// Was active before, another context is active now
    Inactive,
}

impl ContextPhase {
    pub fn of(state: &ApplicationState, id: &ContextId) -> Self {
        match state.context_registry.get(id) {
            None => ContextPhase::Unregistered,
            Some(context) if context.is_active_context => ContextPhase::Active,
            Some(context) if context.last_activated_at.is_none() => ContextPhase::Registered,
            Some(_) => ContextPhase::Inactive,
        }
    }
}

/// Result of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another run holds the lock
    Skipped,
    Completed { notified: usize, failed: usize },
}

// ----------------------------------------------------------------------------
// Tab State Manager
// ----------------------------------------------------------------------------

struct ManagerInner {
    store: StateStore,
    notifier: Arc<dyn ContextNotifier>,
    clock: Arc<dyn TimeSource>,
    locks: LockTable,
    config: SyncConfig,
    timer: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// Keeps the per-context mirrors of shared state eventually consistent
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct TabStateManager {
    inner: Arc<ManagerInner>,
}

impl TabStateManager {
    pub fn new(
        store: StateStore,
        notifier: Arc<dyn ContextNotifier>,
        clock: Arc<dyn TimeSource>,
        config: SyncConfig,
    ) -> Self {
        let locks = LockTable::new(config.lock_timeout(), clock.clone());
        Self {
            inner: Arc::new(ManagerInner {
                store,
                notifier,
                clock,
                locks,
                config,
                timer: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// Current time of the injected clock
    pub fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    pub fn locks(&self) -> &LockTable {
        &self.inner.locks
    }

    pub fn phase(&self, id: &ContextId) -> ContextPhase {
        ContextPhase::of(&self.inner.store.get_state(), id)
    }

    /// Registered contexts in registration order
    pub fn tracked_contexts(&self) -> Vec<ContextId> {
        self.inner
            .store
            .get_state()
            .context_registry
            .ids()
            .copied()
            .collect()
    }

    // ------------------------------------------------------------------------
    // Lifecycle Events
    // ------------------------------------------------------------------------

    /// A context was created; seeds its mirror from the current settings
    pub async fn register_tab(&self, id: ContextId, url: &str, title: &str) -> TabsyncResult<()> {
        self.inner.ensure_live()?;
        let at = self.inner.clock.now();
        self.inner
            .store
            .dispatch(ActionCreator::register_context(id, url, title, at))?;
        debug!(context = %id, url, "Registered context");
        self.inner.notify_tab(id).await;
        Ok(())
    }

    /// A context navigated; registers it when it was not yet known
    pub async fn navigate_tab(&self, id: ContextId, url: &str, title: &str) -> TabsyncResult<()> {
        self.inner.ensure_live()?;
        if !self.inner.store.get_state().context_registry.contains(&id) {
            return self.register_tab(id, url, title).await;
        }
        self.inner.store.dispatch(ActionCreator::update_context(
            id,
            Some(url.to_string()),
            Some(title.to_string()),
        ))?;
        self.inner.notify_tab(id).await;
        Ok(())
    }

    /// A context gained focus; the previously active one is told it lost it
    pub async fn activate_tab(&self, id: ContextId) -> TabsyncResult<()> {
        self.inner.ensure_live()?;
        let previous = self.inner.store.get_state().context_registry.active();
        let change = self
            .inner
            .store
            .dispatch(ActionCreator::activate_context(id, self.inner.clock.now()))?;
        if !change.changed() {
            return Ok(());
        }
        self.inner.notify_tab(id).await;
        if let Some(previous) = previous.filter(|previous| *previous != id) {
            self.inner.notify_tab(previous).await;
        }
        Ok(())
    }

    /// A context was destroyed; a promoted successor is notified
    pub async fn unregister_tab(&self, id: ContextId) -> TabsyncResult<()> {
        self.inner.ensure_live()?;
        let change = self
            .inner
            .store
            .dispatch(ActionCreator::unregister_context(id, self.inner.clock.now()))?;

        let before = change.prev.context_registry.active();
        let after = change.next.context_registry.active();
        if let Some(successor) = after.filter(|_| before != after) {
            info!(removed = %id, successor = %successor, "Promoted context to active");
            self.inner.notify_tab(successor).await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Synchronization
    // ------------------------------------------------------------------------

    /// Push the current snapshot to one context; returns whether it was sent
    pub async fn notify_tab(&self, id: ContextId) -> TabsyncResult<bool> {
        self.inner.ensure_live()?;
        Ok(self.inner.notify_tab(id).await)
    }

    /// Re-send one context's snapshot unless a sync for it is running
    pub async fn sync_tab_state(&self, id: ContextId) -> TabsyncResult<SyncOutcome> {
        self.inner.ensure_live()?;
        let key = format!("syncTab:{}", id);
        let Some(_guard) = self.inner.locks.try_acquire(&key) else {
            return Ok(SyncOutcome::Skipped);
        };
        let sent = self.inner.notify_tab(id).await;
        Ok(SyncOutcome::Completed {
            notified: usize::from(sent),
            failed: usize::from(!sent),
        })
    }

    /// Re-send every context's snapshot unless a full sync is running
    pub async fn sync_all_tabs(&self) -> TabsyncResult<SyncOutcome> {
        self.inner.ensure_live()?;
        Ok(self.inner.sync_all_tabs().await)
    }

    /// Push the current snapshot to every context, bypassing the sync lock
    ///
    /// Used after a state change: the new snapshot supersedes anything an
    /// in-flight sync run is sending.
    pub async fn notify_all(&self) -> TabsyncResult<SyncOutcome> {
        self.inner.ensure_live()?;
        let (notified, failed) = self.inner.notify_each().await;
        Ok(SyncOutcome::Completed { notified, failed })
    }

    /// Start the periodic sync timer; calling it again restarts the timer
    pub fn start(&self) -> TabsyncResult<()> {
        self.inner.ensure_live()?;
        let interval = self.inner.config.sync_interval();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(periodic_sync(weak, interval));

        if let Some(previous) = lock(&self.inner.timer).replace(handle) {
            previous.abort();
        }
        info!(interval_ms = interval.as_millis() as u64, "Started periodic sync");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.timer)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel the timer and drop all locks; the manager is unusable afterwards
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = lock(&self.inner.timer).take() {
            handle.abort();
        }
        self.inner.locks.clear();
        info!("Tab state manager disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TabStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabStateManager")
            .field("contexts", &self.tracked_contexts().len())
            .field("locks", &self.inner.locks)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Manager Internals
// ----------------------------------------------------------------------------

impl ManagerInner {
    fn ensure_live(&self) -> TabsyncResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(TabsyncError::Disposed {
                component: "TabStateManager",
            })
        } else {
            Ok(())
        }
    }

    /// Minimal per-context payload: feature flags, active flag and a timestamp
    fn snapshot_for(&self, state: &ApplicationState, id: &ContextId) -> Option<Value> {
        let context = state.context_registry.get(id)?;
        Some(json!({
            "enabled": state.feature_state.enabled,
            "parameter": state.feature_state.parameter,
            "isActive": context.is_active_context,
            "timestamp": self.clock.now().as_millis(),
        }))
    }

    async fn notify_tab(&self, id: ContextId) -> bool {
        let state = self.store.get_state();
        let Some(snapshot) = self.snapshot_for(&state, &id) else {
            debug!(context = %id, "Skipping notification for unregistered context");
            return false;
        };

        match self.notifier.notify(id, snapshot).await {
            Ok(()) => {
                let synced = ActionCreator::mark_context_synced(id, self.clock.now());
                if let Err(error) = self.store.dispatch(synced) {
                    warn!(context = %id, error = %error, "Cannot record sync time");
                }
                true
            }
            Err(error) => {
                warn!(context = %id, error = %error, "Context notification failed");
                false
            }
        }
    }

    async fn sync_all_tabs(&self) -> SyncOutcome {
        let Some(_guard) = self.locks.try_acquire(SYNC_ALL_LOCK) else {
            debug!("Full sync already in progress");
            return SyncOutcome::Skipped;
        };

        let (notified, failed) = self.notify_each().await;
        debug!(notified, failed, "Full sync finished");
        SyncOutcome::Completed { notified, failed }
    }

    /// Notify every registered context; returns (notified, failed)
    async fn notify_each(&self) -> (usize, usize) {
        let ids: Vec<ContextId> = self.store.get_state().context_registry.ids().copied().collect();
        let mut notified = 0;
        let mut failed = 0;
        for id in ids {
            if self.notify_tab(id).await {
                notified += 1;
            } else {
                failed += 1;
            }
        }
        (notified, failed)
    }
}

async fn periodic_sync(inner: Weak<ManagerInner>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.disposed.load(Ordering::Acquire) {
            return;
        }
        if inner.store.get_state().context_registry.is_empty() {
            continue;
        }
        inner.sync_all_tabs().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
