//! Single-writer state store
//!
//! [`StateStore`] owns the [`ApplicationState`] tree. The only mutation path is
//! [`StateStore::dispatch`], which is serialized across threads and refuses
//! reentry from the thread already dispatching (a reducer, middleware or
//! anything they call cannot trigger a nested dispatch mid-reduction).
//!
//! Changes are queued in reduction order while the dispatch guard is held and
//! delivered to subscribers by one thread at a time, after the guard is
//! released. Subscribers therefore see changes in the order they were reduced,
//! and a subscriber may itself dispatch: its change is delivered once the
//! current one has reached every subscriber. A dispatch that finds another
//! thread delivering returns as soon as its change is queued.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, ThreadId};

use serde_json::Value;
use tracing::{debug, error, warn};

use super::action::Action;
use super::app_state::ApplicationState;
use super::reducer::reduce;
use super::selectors::{project, select_path};
use crate::config::StoreConfig;
use crate::errors::{TabsyncError, TabsyncResult};
use crate::registration::Registration;

// ----------------------------------------------------------------------------
// Public Types
// ----------------------------------------------------------------------------

/// Result of one dispatch
#[derive(Debug, Clone)]
pub struct StateChange {
    pub prev: Arc<ApplicationState>,
    pub next: Arc<ApplicationState>,
    /// The action after middleware processing
    pub action: Action,
}

impl StateChange {
    /// Whether the reducer produced a structurally different state
    pub fn changed(&self) -> bool {
        !Arc::ptr_eq(&self.prev, &self.next)
    }
}

/// Transforms actions before they reach the reducer
pub trait StoreMiddleware: Send + Sync {
    /// Return the action to reduce; returning the input unchanged is a pass-through
    fn process(&self, action: Action, state: &ApplicationState) -> Action;
}

impl<F> StoreMiddleware for F
where
    F: Fn(Action, &ApplicationState) -> Action + Send + Sync,
{
    fn process(&self, action: Action, state: &ApplicationState) -> Action {
        self(action, state)
    }
}

type Subscriber = Arc<dyn Fn(&StateChange) + Send + Sync>;

// ----------------------------------------------------------------------------
// State Store
// ----------------------------------------------------------------------------

struct StoreInner {
    config: StoreConfig,
    state: RwLock<Arc<ApplicationState>>,
    history: Mutex<VecDeque<Action>>,
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    middleware: Mutex<Vec<(u64, Arc<dyn StoreMiddleware>)>>,
    next_registration: AtomicU64,
    /// Thread currently inside `dispatch`
    dispatching: Mutex<Option<ThreadId>>,
    /// Serializes dispatches from different threads
    serial: Mutex<()>,
    notifications: Mutex<Notifications>,
}

/// Changes waiting for subscribers, in reduction order
#[derive(Default)]
struct Notifications {
    queue: VecDeque<StateChange>,
    /// Some thread is delivering the queue
    draining: bool,
}

/// Reducer-based store with subscriptions and middleware
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl StateStore {
    pub fn new(config: StoreConfig) -> Self {
        Self::with_state(ApplicationState::default(), config)
    }

    /// Create a store starting from an existing state tree
    pub fn with_state(initial: ApplicationState, config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                state: RwLock::new(Arc::new(initial)),
                history: Mutex::new(VecDeque::new()),
                subscribers: Mutex::new(Vec::new()),
                middleware: Mutex::new(Vec::new()),
                next_registration: AtomicU64::new(1),
                dispatching: Mutex::new(None),
                serial: Mutex::new(()),
                notifications: Mutex::new(Notifications::default()),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Current snapshot; cheap to call, never a deep copy
    pub fn get_state(&self) -> Arc<ApplicationState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply an action through middleware and the reducer
    pub fn dispatch(&self, action: Action) -> TabsyncResult<StateChange> {
        let current = thread::current().id();
        if *lock(&self.inner.dispatching) == Some(current) {
            warn!(action = action.action_type(), "Rejected reentrant dispatch");
            return Err(TabsyncError::internal(format!(
                "dispatch of {} while another dispatch is in progress",
                action.action_type()
            )));
        }

        let change = {
            let _serial = lock(&self.inner.serial);
            let _owner = DispatchOwner::claim(&self.inner.dispatching, current);
            let change = self.reduce_locked(action);
            if change.changed() {
                lock(&self.inner.notifications).queue.push_back(change.clone());
            }
            change
        };

        self.deliver_notifications();
        Ok(change)
    }

    /// Deliver queued changes unless another thread already is
    fn deliver_notifications(&self) {
        {
            let mut notifications = lock(&self.inner.notifications);
            if notifications.draining || notifications.queue.is_empty() {
                return;
            }
            notifications.draining = true;
        }

        loop {
            let next = {
                let mut notifications = lock(&self.inner.notifications);
                let next = notifications.queue.pop_front();
                if next.is_none() {
                    notifications.draining = false;
                }
                next
            };
            match next {
                Some(change) => self.notify(&change),
                None => return,
            }
        }
    }

    fn reduce_locked(&self, action: Action) -> StateChange {
        self.record(&action);

        let prev = self.get_state();
        let action = self.run_middleware(action, &prev);
        let candidate = reduce(&prev, &action, &self.inner.config);

        let next = if candidate == *prev {
            prev.clone()
        } else {
            let next = Arc::new(candidate);
            *self
                .inner
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner) = next.clone();
            next
        };

        debug!(
            action = action.action_type(),
            changed = !Arc::ptr_eq(&prev, &next),
            "Dispatched action"
        );
        StateChange { prev, next, action }
    }

    fn record(&self, action: &Action) {
        let mut history = lock(&self.inner.history);
        history.push_back(action.clone());
        while history.len() > self.inner.config.history_limit {
            history.pop_front();
        }
    }

    fn run_middleware(&self, action: Action, state: &ApplicationState) -> Action {
        let chain: Vec<_> = lock(&self.inner.middleware)
            .iter()
            .map(|(_, middleware)| middleware.clone())
            .collect();

        chain.into_iter().fold(action, |action, middleware| {
            let original = action.clone();
            match catch_unwind(AssertUnwindSafe(|| middleware.process(action, state))) {
                Ok(next) => next,
                Err(_) => {
                    error!(action = original.action_type(), "Store middleware panicked; keeping action");
                    original
                }
            }
        })
    }

    fn notify(&self, change: &StateChange) {
        let subscribers: Vec<_> = lock(&self.inner.subscribers)
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect();

        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(change))).is_err() {
                error!(
                    action = change.action.action_type(),
                    "State subscriber panicked"
                );
            }
        }
    }

    /// Call `listener` after every dispatch that changes state
    pub fn subscribe<F>(&self, listener: F) -> Registration
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).push((id, Arc::new(listener)));

        let inner = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = inner.upgrade() {
                lock(&inner.subscribers).retain(|(key, _)| *key != id);
            }
        })
    }

    /// Call `listener(next, prev)` only when the value at `path` changes
    ///
    /// A path that does not exist projects to `null`.
    pub fn subscribe_to_path<F>(&self, path: &str, listener: F) -> Registration
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        let path = path.to_string();
        let last = Mutex::new(self.select(&path).unwrap_or(Value::Null));

        self.subscribe(move |change| {
            let tree = match serde_json::to_value(&*change.next) {
                Ok(tree) => tree,
                Err(e) => {
                    warn!(path = %path, error = %e, "Cannot project state for path subscriber");
                    return;
                }
            };
            let current = project(&tree, &path).cloned().unwrap_or(Value::Null);

            let previous = {
                let mut last = lock(&last);
                if *last == current {
                    return;
                }
                std::mem::replace(&mut *last, current.clone())
            };
            listener(&current, &previous);
        })
    }

    /// Insert a middleware at the end of the chain
    pub fn add_middleware<M>(&self, middleware: M) -> Registration
    where
        M: StoreMiddleware + 'static,
    {
        let id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.middleware).push((id, Arc::new(middleware)));

        let inner = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = inner.upgrade() {
                lock(&inner.middleware).retain(|(key, _)| *key != id);
            }
        })
    }

    /// Most recent actions, oldest first, as received before middleware
    pub fn history(&self) -> Vec<Action> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    pub fn middleware_count(&self) -> usize {
        lock(&self.inner.middleware).len()
    }

    /// Serialized projection of the current state at a dotted path
    pub fn select(&self, path: &str) -> Option<Value> {
        select_path(&self.get_state(), path)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("subscribers", &self.subscriber_count())
            .field("middleware", &self.middleware_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the dispatching thread; cleared on drop, including unwinding
struct DispatchOwner<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
}

impl<'a> DispatchOwner<'a> {
    fn claim(slot: &'a Mutex<Option<ThreadId>>, owner: ThreadId) -> Self {
        *lock(slot) = Some(owner);
        Self { slot }
    }
}

impl Drop for DispatchOwner<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::action::ActionCreator;
    use crate::types::{ContextId, Timestamp};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_unrecognized_action_succeeds_without_change() {
        let store = StateStore::default();
        let before = store.get_state();
        let change = store.dispatch(Action::Unrecognized).unwrap();
        assert!(!change.changed());
        assert_eq!(*store.get_state(), *before);
    }

    #[test]
    fn test_subscribers_only_see_changes() {
        let store = StateStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _registration = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.dispatch(ActionCreator::set_popup_open(true)).unwrap();
        store.dispatch(ActionCreator::set_popup_open(true)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let store = StateStore::default();
        let registration = store.subscribe(|_| {});
        assert_eq!(store.subscriber_count(), 1);
        registration.cancel();
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let store = StateStore::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _a = store.subscribe(|_| panic!("subscriber failure"));
        let _b = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(store.dispatch(ActionCreator::update_parameter(0.1)).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_state().feature_state.parameter, 0.1);
    }

    #[test]
    fn test_reentrant_dispatch_from_middleware_fails() {
        let store = StateStore::default();
        let inner_store = store.clone();
        let observed = Arc::new(Mutex::new(None));
        let slot = observed.clone();
        let _registration = store.add_middleware(move |action: Action, _: &ApplicationState| {
            if matches!(action, Action::SetPopupOpen { .. }) {
                let nested = inner_store.dispatch(ActionCreator::reset());
                *slot.lock().unwrap() = Some(nested.is_err());
            }
            action
        });

        store.dispatch(ActionCreator::set_popup_open(true)).unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(true));
        assert!(store.get_state().ui_state.popup_open);
    }

    #[test]
    fn test_subscriber_may_dispatch() {
        let store = StateStore::default();
        let inner_store = store.clone();
        let _registration = store.subscribe(move |change| {
            if matches!(change.action, Action::SetPopupOpen { open: true }) {
                inner_store
                    .dispatch(ActionCreator::set_status(Some("popup".into())))
                    .unwrap();
            }
        });
        store.dispatch(ActionCreator::set_popup_open(true)).unwrap();
        assert_eq!(store.get_state().ui_state.status_message.as_deref(), Some("popup"));
    }

    #[test]
    fn test_middleware_transforms_in_order() {
        let store = StateStore::default();
        let _double = store.add_middleware(|action: Action, _: &ApplicationState| match action {
            Action::UpdateParameter { value } => Action::UpdateParameter { value: value * 2.0 },
            other => other,
        });
        let _offset = store.add_middleware(|action: Action, _: &ApplicationState| match action {
            Action::UpdateParameter { value } => Action::UpdateParameter { value: value + 0.1 },
            other => other,
        });

        let change = store.dispatch(ActionCreator::update_parameter(0.2)).unwrap();
        assert!((store.get_state().feature_state.parameter - 0.5).abs() < 1e-9);
        assert!(matches!(change.action, Action::UpdateParameter { .. }));
    }

    #[test]
    fn test_history_is_bounded() {
        let store = StateStore::new(StoreConfig {
            history_limit: 3,
            ..StoreConfig::default()
        });
        for i in 0..5 {
            store
                .dispatch(ActionCreator::update_parameter(i as f64 / 10.0))
                .unwrap();
        }
        let history = store.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0], ActionCreator::update_parameter(0.2));
    }

    #[test]
    fn test_path_subscription_fires_on_path_change_only() {
        let store = StateStore::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _registration = store.subscribe_to_path("featureState.enabled", move |next, prev| {
            sink.lock().unwrap().push((prev.clone(), next.clone()));
        });

        store.dispatch(ActionCreator::set_popup_open(true)).unwrap();
        store
            .dispatch(ActionCreator::toggle_feature(Some(true), Timestamp::new(5)))
            .unwrap();
        store
            .dispatch(ActionCreator::register_context(ContextId::Tab(1), "u", "t", Timestamp::new(6)))
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (Value::Bool(false), Value::Bool(true)));
    }

    #[test]
    fn test_notifications_follow_reduction_order_across_threads() {
        let store = StateStore::default();
        let (entered, wait_for_entry) = std::sync::mpsc::channel();
        let entered = Mutex::new(entered);
        let _slow = store.subscribe(move |change| {
            if change.next.feature_state.parameter == 0.2 {
                let _ = lock(&entered).send(());
                thread::sleep(std::time::Duration::from_millis(50));
            }
        });
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        let _path = store.subscribe_to_path("featureState.parameter", move |next, _| {
            sink.lock().unwrap().push(next.as_f64().unwrap());
        });

        let first = store.clone();
        let handle = thread::spawn(move || {
            first.dispatch(ActionCreator::update_parameter(0.2)).unwrap();
        });
        wait_for_entry.recv().unwrap();
        store.dispatch(ActionCreator::update_parameter(0.4)).unwrap();
        handle.join().unwrap();

        assert_eq!(store.get_state().feature_state.parameter, 0.4);
        assert_eq!(*observed.lock().unwrap(), vec![0.2, 0.4]);
    }

    #[test]
    fn test_nested_dispatch_is_delivered_after_the_current_change() {
        let store = StateStore::default();
        let inner_store = store.clone();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let _dispatcher = store.subscribe(move |change| {
            first.lock().unwrap().push(("dispatcher", change.action.action_type()));
            if matches!(change.action, Action::SetPopupOpen { open: true }) {
                inner_store
                    .dispatch(ActionCreator::set_status(Some("popup".into())))
                    .unwrap();
            }
        });
        let second = order.clone();
        let _observer = store.subscribe(move |change| {
            second.lock().unwrap().push(("observer", change.action.action_type()));
        });

        store.dispatch(ActionCreator::set_popup_open(true)).unwrap();
        let order = order.lock().unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0].1, order[1].1);
        assert_eq!(order[2].1, order[3].1);
        assert_ne!(order[1].1, order[2].1);
    }

    #[test]
    fn test_concurrent_dispatch_from_threads_is_serialized() {
        let store = StateStore::default();
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        let id = ContextId::Tab(n * 100 + i);
                        store
                            .dispatch(ActionCreator::register_context(id, "u", "t", Timestamp::new(1)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get_state().context_registry.len(), 100);
    }
}
