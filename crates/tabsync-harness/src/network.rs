//! Loopback network connecting several in-process contexts
//!
//! Each context attaches an inbox closure (typically forwarding to its bus's
//! `receive`) and takes a [`LoopbackEndpoint`] as its transport. Deliveries are
//! handed to the target inbox on a spawned task, so the sender never waits for
//! the receiver's handlers. A seeded loss rate makes delivery attempts fail
//! with a communication error, which exercises the sender's retries.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, trace};

use tabsync_core::{ContextId, TabsyncError, TabsyncResult, Transport};

type Inbox = Arc<dyn Fn(String, ContextId) -> BoxFuture<'static, ()> + Send + Sync>;

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub lost: u64,
    pub unreachable: u64,
}

#[derive(Default)]
struct NetworkInner {
    inboxes: RwLock<HashMap<ContextId, Inbox>>,
    loss_rate: Mutex<f64>,
    rng: Mutex<fastrand::Rng>,
    delivered: AtomicU64,
    lost: AtomicU64,
    unreachable: AtomicU64,
}

/// Mock network for routing wire records between attached contexts
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network that loses `loss_rate` of all attempts, reproducibly per seed
    pub fn lossy(loss_rate: f64, seed: u64) -> Self {
        let network = Self::default();
        *lock(&network.inner.loss_rate) = loss_rate.clamp(0.0, 1.0);
        *lock(&network.inner.rng) = fastrand::Rng::with_seed(seed);
        network
    }

    /// Route records addressed to `id` into `inbox`; replaces an earlier inbox
    pub fn attach<F, Fut>(&self, id: ContextId, inbox: F)
    where
        F: Fn(String, ContextId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Inbox = Arc::new(move |raw: String, sender: ContextId| -> BoxFuture<'static, ()> {
            Box::pin(inbox(raw, sender))
        });
        write(&self.inner.inboxes).insert(id, boxed);
        debug!(context = %id, "Attached context to loopback network");
    }

    pub fn detach(&self, id: &ContextId) -> bool {
        write(&self.inner.inboxes).remove(id).is_some()
    }

    pub fn contexts(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = read(&self.inner.inboxes).keys().copied().collect();
        ids.sort();
        ids
    }

    /// Transport for the context `identity`
    pub fn endpoint(&self, identity: ContextId) -> Arc<LoopbackEndpoint> {
        Arc::new(LoopbackEndpoint {
            identity,
            network: self.clone(),
        })
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            lost: self.inner.lost.load(Ordering::Relaxed),
            unreachable: self.inner.unreachable.load(Ordering::Relaxed),
        }
    }

    fn loses_attempt(&self) -> bool {
        let rate = *lock(&self.inner.loss_rate);
        rate > 0.0 && lock(&self.inner.rng).f64() < rate
    }

    fn route(&self, from: ContextId, target: ContextId, raw: String) -> TabsyncResult<()> {
        if self.loses_attempt() {
            self.inner.lost.fetch_add(1, Ordering::Relaxed);
            trace!(from = %from, target = %target, "Loopback lost a delivery attempt");
            return Err(TabsyncError::communication(target.to_string(), "message lost"));
        }

        let recipients: Vec<(ContextId, Inbox)> = {
            let inboxes = read(&self.inner.inboxes);
            if target.is_broadcast() {
                inboxes
                    .iter()
                    .filter(|(id, _)| **id != from)
                    .map(|(id, inbox)| (*id, inbox.clone()))
                    .collect()
            } else {
                inboxes
                    .get(&target)
                    .map(|inbox| vec![(target, inbox.clone())])
                    .unwrap_or_default()
            }
        };

        if recipients.is_empty() && !target.is_broadcast() {
            self.inner.unreachable.fetch_add(1, Ordering::Relaxed);
            return Err(TabsyncError::communication(
                target.to_string(),
                "Receiving end does not exist",
            ));
        }

        for (id, inbox) in recipients {
            self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            trace!(from = %from, to = %id, "Loopback delivery");
            tokio::spawn(inbox(raw.clone(), from));
        }
        Ok(())
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("contexts", &self.contexts())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Transport of one context attached to a [`LoopbackNetwork`]
#[derive(Debug, Clone)]
pub struct LoopbackEndpoint {
    identity: ContextId,
    network: LoopbackNetwork,
}

impl LoopbackEndpoint {
    pub fn identity(&self) -> ContextId {
        self.identity
    }
}

#[async_trait]
impl Transport for LoopbackEndpoint {
    async fn deliver(&self, payload: String, target: ContextId) -> TabsyncResult<Option<String>> {
        self.network.route(self.identity, target, payload)?;
        Ok(None)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
