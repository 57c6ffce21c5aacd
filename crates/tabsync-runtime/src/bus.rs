//! Message Bus
//!
//! Typed request/response and pub/sub layer between contexts. Each bus owns an
//! outbound and an inbound [`MessageQueue`], a handler registry, a middleware
//! chain and the table of sends awaiting a response.
//!
//! ## Delivery
//!
//! Outbound messages are delivered one at a time by a single drain task, so
//! delivery order always follows dequeue order. Each delivery runs under the
//! bus's [`RetryManager`]; a reply returned by the transport is fed back
//! through inbound handling.
//!
//! ## Inbound processing
//!
//! Responses bypass the inbound queue and resolve their waiter on arrival, so a
//! handler that itself awaits a response cannot stall the inbound drain.
//! Everything else is queued and dispatched by a single latch-guarded drain to
//! every handler registered for the type, in registration order.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use tabsync_core::{
    BusConfig, ContextId, ContextNotifier, ErrorSink, Message, MessageId, MessageQueue,
    MessageType, MessageValidator, Priority, Registration, Schema, TabsyncError, TabsyncResult,
    TimeSource, Transport,
};

use crate::retry::RetryManager;

// ----------------------------------------------------------------------------
// Send Options and Outcomes
// ----------------------------------------------------------------------------

/// Per-send routing and correlation options
#[derive(Debug, Clone, PartialEq)]
pub struct SendOptions {
    pub target: ContextId,
    pub priority: Priority,
    pub needs_response: bool,
    /// Overrides the bus's default response deadline
    pub timeout: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::to(ContextId::Background)
    }
}

impl SendOptions {
    pub fn to(target: ContextId) -> Self {
        Self {
            target,
            priority: Priority::Normal,
            needs_response: false,
            timeout: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Wait for a correlated response
    pub fn expect_response(mut self) -> Self {
        self.needs_response = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What `send` produced
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Enqueued for delivery; no response requested
    Queued(MessageId),
    /// The correlated response
    Responded(Message),
    /// Middleware dropped the message before it was enqueued
    Dropped,
}

impl SendOutcome {
    pub fn into_response(self) -> Option<Message> {
        match self {
            SendOutcome::Responded(message) => Some(message),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Handlers and Middleware
// ----------------------------------------------------------------------------

/// Handles inbound messages of one type
///
/// A non-null result becomes the payload of the response when the sender asked
/// for one. A result carrying an `error` field is answered as `SYSTEM_ERROR`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> TabsyncResult<Option<Value>>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct HandlerFn<F>(F);

/// Wrap `f` as a handler; the closure receives its own copy of the message
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = TabsyncResult<Option<Value>>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = TabsyncResult<Option<Value>>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> TabsyncResult<Option<Value>> {
        (self.0)(message.clone()).await
    }
}

/// Which way a message is travelling through the middleware chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Transforms or drops messages on their way in or out
///
/// `Ok(None)` drops the message. An `Err` is logged and the message continues
/// unchanged, so a faulty middleware cannot block delivery.
pub trait MessageMiddleware: Send + Sync {
    fn process(&self, message: Message, direction: Direction) -> TabsyncResult<Option<Message>>;
}

impl<F> MessageMiddleware for F
where
    F: Fn(Message, Direction) -> TabsyncResult<Option<Message>> + Send + Sync,
{
    fn process(&self, message: Message, direction: Direction) -> TabsyncResult<Option<Message>> {
        self(message, direction)
    }
}

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Counters describing bus activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub sent: u64,
    pub received: u64,
    pub delivered: u64,
    pub delivery_failures: u64,
    pub dropped: u64,
    pub timeouts: u64,
    pub handler_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    delivered: AtomicU64,
    delivery_failures: AtomicU64,
    dropped: AtomicU64,
    timeouts: AtomicU64,
    handler_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BusStats {
        BusStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

/// Current queue depths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSizes {
    pub outbound: usize,
    pub inbound: usize,
}

// ----------------------------------------------------------------------------
// Message Bus
// ----------------------------------------------------------------------------

type PendingSender = oneshot::Sender<TabsyncResult<Message>>;
type HandlerList = Vec<(u64, Arc<dyn MessageHandler>)>;

struct BusInner {
    identity: ContextId,
    config: BusConfig,
    validator: RwLock<MessageValidator>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    error_sink: Arc<dyn ErrorSink>,
    clock: Arc<dyn TimeSource>,
    retry: RetryManager,
    outbound: Mutex<MessageQueue>,
    inbound: Mutex<MessageQueue>,
    handlers: DashMap<MessageType, HandlerList>,
    middleware: Mutex<Vec<(u64, Arc<dyn MessageMiddleware>)>>,
    pending: DashMap<MessageId, PendingSender>,
    outbound_draining: AtomicBool,
    inbound_draining: AtomicBool,
    disposed: AtomicBool,
    next_registration: AtomicU64,
    counters: Counters,
}

/// Message bus owned by one context
///
/// Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a bus for `identity` delivering through `transport`
    ///
    /// Outgoing messages and replies are stamped from `clock`.
    pub fn new(
        identity: ContextId,
        transport: Arc<dyn Transport>,
        error_sink: Arc<dyn ErrorSink>,
        clock: Arc<dyn TimeSource>,
        config: BusConfig,
        retry: RetryManager,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                identity,
                config,
                validator: RwLock::new(MessageValidator::default()),
                transport: RwLock::new(Some(transport)),
                error_sink,
                clock,
                retry,
                outbound: Mutex::new(MessageQueue::new()),
                inbound: Mutex::new(MessageQueue::new()),
                handlers: DashMap::new(),
                middleware: Mutex::new(Vec::new()),
                pending: DashMap::new(),
                outbound_draining: AtomicBool::new(false),
                inbound_draining: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                next_registration: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn identity(&self) -> ContextId {
        self.inner.identity
    }

    /// Register or replace the payload schema for a type
    pub fn register_schema(&self, message_type: MessageType, schema: Schema) {
        write(&self.inner.validator).register(message_type, schema);
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Validate, run outbound middleware, enqueue and optionally await a response
    pub async fn send(
        &self,
        message_type: MessageType,
        payload: Value,
        options: SendOptions,
    ) -> TabsyncResult<SendOutcome> {
        self.inner.ensure_live()?;
        read(&self.inner.validator).validate(message_type, &payload)?;

        let mut message = Message::new(
            message_type,
            payload,
            self.inner.identity,
            options.target,
            self.inner.clock.now(),
        )
        .with_priority(options.priority);
        if options.needs_response {
            message = message.expecting_response();
        }

        let Some(message) = self.inner.apply_middleware(message, Direction::Outbound) else {
            Counters::bump(&self.inner.counters.dropped);
            debug!(message_type = %message_type, "Outbound message dropped by middleware");
            return Ok(SendOutcome::Dropped);
        };
        Counters::bump(&self.inner.counters.sent);

        if !message.needs_response {
            let id = message.id.clone();
            self.inner.enqueue_outbound(message);
            return Ok(SendOutcome::Queued(id));
        }

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.response_timeout());
        let id = message.id.clone();
        let (sender, receiver) = oneshot::channel();
        self.inner.pending.insert(id.clone(), sender);
        // Removes the entry on every exit, including the caller dropping this future
        let _pending = PendingEntry {
            pending: &self.inner.pending,
            id: id.clone(),
        };
        self.inner.enqueue_outbound(message);

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(Ok(response))) => Ok(SendOutcome::Responded(response)),
            Ok(Ok(Err(error))) => Err(error),
            Ok(Err(_)) => Err(TabsyncError::internal(format!(
                "response channel for {} closed",
                id
            ))),
            Err(_) => {
                Counters::bump(&self.inner.counters.timeouts);
                warn!(message_id = %id, timeout_ms = timeout.as_millis() as u64, "Response timed out");
                Err(TabsyncError::timeout(id.to_string(), timeout.as_millis() as u64))
            }
        }
    }

    /// Send expecting a response and return it; a middleware drop is an error
    pub async fn request(
        &self,
        message_type: MessageType,
        payload: Value,
        options: SendOptions,
    ) -> TabsyncResult<Message> {
        match self.send(message_type, payload, options.expect_response()).await? {
            SendOutcome::Responded(message) => Ok(message),
            _ => Err(TabsyncError::Rejected {
                message_id: message_type.to_string(),
            }),
        }
    }

    /// Answer `original` with `payload`, addressed back to its sender
    pub fn respond_to(&self, original: &Message, payload: Value) -> TabsyncResult<()> {
        self.inner.ensure_live()?;
        let response_type = response_type_for(original.message_type, &payload);
        self.inner.respond(original, response_type, payload);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    /// Inbound hook for raw wire records delivered by the host
    ///
    /// Malformed records are logged and dropped; nothing reaches a handler.
    pub async fn receive(&self, raw: &str, sender: ContextId) {
        self.inner.receive_raw(raw, sender).await;
    }

    /// Inbound hook for already-decoded messages
    pub async fn receive_message(&self, message: Message) {
        self.inner.receive_message(message).await;
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Add a handler for `message_type`; all handlers for a type run in order
    pub fn register_handler<H>(&self, message_type: MessageType, handler: H) -> Registration
    where
        H: MessageHandler + 'static,
    {
        if self.inner.disposed.load(Ordering::Acquire) {
            warn!(message_type = %message_type, "Handler registration on disposed bus ignored");
            return Registration::noop();
        }
        let id = self.inner.next_id();
        self.inner
            .handlers
            .entry(message_type)
            .or_default()
            .push((id, Arc::new(handler)));

        let inner = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = Weak::upgrade(&inner) {
                if let Some(mut handlers) = inner.handlers.get_mut(&message_type) {
                    handlers.retain(|(key, _)| *key != id);
                }
            }
        })
    }

    /// Register an async closure as a handler
    pub fn on<F, Fut>(&self, message_type: MessageType, f: F) -> Registration
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TabsyncResult<Option<Value>>> + Send + 'static,
    {
        self.register_handler(message_type, handler_fn(f))
    }

    /// Append a middleware to the chain
    pub fn add_middleware<M>(&self, middleware: M) -> Registration
    where
        M: MessageMiddleware + 'static,
    {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Registration::noop();
        }
        let id = self.inner.next_id();
        lock(&self.inner.middleware).push((id, Arc::new(middleware)));

        let inner = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = Weak::upgrade(&inner) {
                lock(&inner.middleware).retain(|(key, _)| *key != id);
            }
        })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Empty both queues and fail every pending response; handlers stay
    pub fn clear(&self) {
        self.inner.clear("bus cleared");
    }

    /// Clear, drop handlers and middleware, and detach from the transport
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.clear("bus disposed");
        self.inner.handlers.clear();
        lock(&self.inner.middleware).clear();
        *write(&self.inner.transport) = None;
        info!(identity = %self.inner.identity, "Message bus disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Wait until the outbound queue is empty and no delivery is in flight
    pub async fn flush(&self) {
        loop {
            let idle = lock(&self.inner.outbound).is_empty()
                && !self.inner.outbound_draining.load(Ordering::Acquire);
            if idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn has_pending(&self, id: &MessageId) -> bool {
        self.inner.pending.contains_key(id)
    }

    pub fn handler_count(&self, message_type: MessageType) -> usize {
        self.inner
            .handlers
            .get(&message_type)
            .map(|handlers| handlers.len())
            .unwrap_or(0)
    }

    pub fn middleware_count(&self) -> usize {
        lock(&self.inner.middleware).len()
    }

    pub fn queue_sizes(&self) -> QueueSizes {
        QueueSizes {
            outbound: lock(&self.inner.outbound).size(),
            inbound: lock(&self.inner.inbound).size(),
        }
    }

    pub fn stats(&self) -> BusStats {
        self.inner.counters.snapshot()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("identity", &self.inner.identity)
            .field("pending", &self.pending_count())
            .field("queues", &self.queue_sizes())
            .finish()
    }
}

#[async_trait]
impl ContextNotifier for MessageBus {
    async fn notify(&self, target: ContextId, snapshot: Value) -> TabsyncResult<()> {
        self.send(
            MessageType::StateSync,
            snapshot,
            SendOptions::to(target).priority(Priority::High),
        )
        .await
        .map(|_| ())
    }
}

// ----------------------------------------------------------------------------
// Bus Internals
// ----------------------------------------------------------------------------

impl BusInner {
    fn next_id(&self) -> u64 {
        self.next_registration.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_live(&self) -> TabsyncResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(TabsyncError::Disposed {
                component: "MessageBus",
            })
        } else {
            Ok(())
        }
    }

    fn apply_middleware(&self, message: Message, direction: Direction) -> Option<Message> {
        let chain: Vec<_> = lock(&self.middleware)
            .iter()
            .map(|(_, middleware)| middleware.clone())
            .collect();

        let mut current = message;
        for middleware in chain {
            let original = current.clone();
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                middleware.process(current, direction)
            }));
            current = match outcome {
                Ok(Ok(Some(next))) => next,
                Ok(Ok(None)) => return None,
                Ok(Err(error)) => {
                    warn!(message_id = %original.id, error = %error, "Middleware failed; message kept");
                    self.error_sink.report("middleware", &error);
                    original
                }
                Err(_) => {
                    let error = TabsyncError::internal("middleware panicked");
                    warn!(message_id = %original.id, "Middleware panicked; message kept");
                    self.error_sink.report("middleware", &error);
                    original
                }
            };
        }
        Some(current)
    }

    fn clear(&self, reason: &str) {
        let outbound = {
            let mut queue = lock(&self.outbound);
            let size = queue.size();
            queue.clear();
            size
        };
        let inbound = {
            let mut queue = lock(&self.inbound);
            let size = queue.size();
            queue.clear();
            size
        };

        let ids: Vec<MessageId> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        let rejected = ids.len();
        for id in ids {
            if let Some((_, sender)) = self.pending.remove(&id) {
                let _ = sender.send(Err(TabsyncError::internal(reason)));
            }
        }
        debug!(outbound, inbound, rejected, reason, "Cleared message bus");
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    fn enqueue_outbound(self: &Arc<Self>, message: Message) {
        let size = {
            let mut queue = lock(&self.outbound);
            queue.enqueue(message);
            queue.size()
        };
        if size > self.config.queue_warn_threshold {
            warn!(size, threshold = self.config.queue_warn_threshold, "Outbound queue is growing");
        }
        self.schedule_outbound();
    }

    fn schedule_outbound(self: &Arc<Self>) {
        if self
            .outbound_draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            inner.drain_outbound().await;
        });
    }

    /// Deliver queued messages one at a time; caller holds the outbound latch
    async fn drain_outbound(self: Arc<Self>) {
        loop {
            let next = lock(&self.outbound).dequeue();
            match next {
                Some(message) => self.deliver(message).await,
                None => {
                    self.outbound_draining.store(false, Ordering::Release);
                    // A message enqueued between the empty dequeue and the
                    // release found the latch held; pick it up here.
                    let refill = !lock(&self.outbound).is_empty();
                    if !refill
                        || self
                            .outbound_draining
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }

    async fn deliver(self: &Arc<Self>, message: Message) {
        let Some(transport) = read(&self.transport).clone() else {
            self.fail_pending(
                &message.id,
                TabsyncError::Disposed {
                    component: "MessageBus",
                },
            );
            return;
        };

        let raw = match message.serialize() {
            Ok(raw) => raw,
            Err(error) => {
                error!(message_id = %message.id, error = %error, "Cannot serialize outbound message");
                self.fail_pending(&message.id, error);
                return;
            }
        };

        let target = message.target;
        trace!(message_id = %message.id, target = %target, "Delivering message");
        let result = self
            .retry
            .execute("deliver", |_| {
                let transport = transport.clone();
                let raw = raw.clone();
                async move { transport.deliver(raw, target).await }
            })
            .await;

        match result {
            Ok(reply) => {
                Counters::bump(&self.counters.delivered);
                if let Some(reply) = reply {
                    self.receive_raw(&reply, target).await;
                }
            }
            Err(error) => {
                Counters::bump(&self.counters.delivery_failures);
                error!(
                    message_id = %message.id,
                    target = %target,
                    error = %error,
                    "Delivery failed after retries"
                );
                self.error_sink.report("delivery", &error);
                let failure = match error {
                    TabsyncError::Communication { .. } => error,
                    other => TabsyncError::communication(target.to_string(), other.to_string()),
                };
                self.fail_pending(&message.id, failure);
            }
        }
    }

    fn fail_pending(&self, id: &MessageId, error: TabsyncError) {
        if let Some((_, sender)) = self.pending.remove(id) {
            let _ = sender.send(Err(error));
        }
    }

    fn respond(self: &Arc<Self>, original: &Message, response_type: MessageType, payload: Value) {
        let response = original.reply(self.identity, response_type, payload, self.clock.now());
        match self.apply_middleware(response, Direction::Outbound) {
            Some(response) => self.enqueue_outbound(response),
            None => {
                Counters::bump(&self.counters.dropped);
                debug!(response_to = %original.id, "Response dropped by middleware");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    async fn receive_raw(self: &Arc<Self>, raw: &str, sender: ContextId) {
        match Message::deserialize(raw) {
            Ok(message) => self.receive_message(message).await,
            Err(error) => {
                Counters::bump(&self.counters.dropped);
                warn!(sender = %sender, error = %error, "Rejected malformed inbound message");
            }
        }
    }

    async fn receive_message(self: &Arc<Self>, message: Message) {
        if self.disposed.load(Ordering::Acquire) {
            debug!(message_id = %message.id, "Inbound message on disposed bus ignored");
            return;
        }
        Counters::bump(&self.counters.received);

        let Some(message) = self.apply_middleware(message, Direction::Inbound) else {
            Counters::bump(&self.counters.dropped);
            debug!("Inbound message dropped by middleware");
            return;
        };

        if let Some(response_to) = message.response_to_id.clone() {
            match self.pending.remove(&response_to) {
                Some((_, sender)) => {
                    let _ = sender.send(Ok(message));
                }
                None => {
                    debug!(response_to = %response_to, "Uncorrelated response discarded");
                }
            }
            return;
        }

        lock(&self.inbound).enqueue(message);
        self.drain_inbound().await;
    }

    /// Dispatch queued messages unless another task already is
    async fn drain_inbound(self: &Arc<Self>) {
        loop {
            if self
                .inbound_draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                let next = lock(&self.inbound).dequeue();
                match next {
                    Some(message) => self.dispatch(message).await,
                    None => break,
                }
            }
            self.inbound_draining.store(false, Ordering::Release);
            if lock(&self.inbound).is_empty() {
                return;
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, message: Message) {
        let message_type = message.message_type;

        if !message_type.is_response() {
            let validation = read(&self.validator).validate(message_type, &message.payload);
            if let Err(error) = validation {
                warn!(message_id = %message.id, error = %error, "Inbound message failed validation");
                if message.needs_response {
                    self.respond(&message, MessageType::SystemError, json!({ "error": error.to_string() }));
                }
                return;
            }
        }

        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .get(&message_type)
            .map(|handlers| handlers.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            warn!(message_type = %message_type, source = %message.source, "No handler registered");
            if message.needs_response {
                self.respond(
                    &message,
                    MessageType::SystemError,
                    json!({ "error": format!("No handler registered for {}", message_type) }),
                );
            }
            return;
        }

        let origin = format!("handler:{}", message_type);
        let mut result = None;
        let mut failure = None;
        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle(&message)).catch_unwind().await;
            match outcome {
                Ok(Ok(Some(value))) => {
                    if result.is_none() {
                        result = Some(value);
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(error)) => {
                    Counters::bump(&self.counters.handler_errors);
                    warn!(message_type = %message_type, error = %error, "Handler failed");
                    self.error_sink.report(&origin, &error);
                    failure.get_or_insert(error.to_string());
                }
                Err(_) => {
                    Counters::bump(&self.counters.handler_errors);
                    let error = TabsyncError::internal(format!("handler for {} panicked", message_type));
                    error!(message_type = %message_type, "Handler panicked");
                    self.error_sink.report(&origin, &error);
                    failure.get_or_insert(error.to_string());
                }
            }
        }

        if !message.needs_response {
            return;
        }
        match (result, failure) {
            (Some(payload), _) => {
                let response_type = response_type_for(message_type, &payload);
                self.respond(&message, response_type, payload);
            }
            (None, Some(reason)) => {
                self.respond(&message, MessageType::SystemError, json!({ "error": reason }));
            }
            (None, None) => {
                debug!(message_type = %message_type, "No handler produced a response");
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// A send's slot in the pending table, released when the send ends
struct PendingEntry<'a> {
    pending: &'a DashMap<MessageId, PendingSender>,
    id: MessageId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

fn response_type_for(request: MessageType, payload: &Value) -> MessageType {
    if payload.get("error").is_some() {
        MessageType::SystemError
    } else {
        request.response_type()
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
