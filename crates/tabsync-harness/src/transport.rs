//! Scripted mock transport
//!
//! Records every delivery, can fail a configurable number of attempts, and can
//! answer requests through a responder closure the way a host returns the one
//! reply it allows per message.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use tabsync_core::{ContextId, Message, TabsyncError, TabsyncResult, Transport};

type Responder = Box<dyn Fn(&Message) -> Option<Value> + Send + Sync>;

/// One successful delivery
#[derive(Debug, Clone)]
pub struct Delivery {
    pub target: ContextId,
    pub raw: String,
    /// Decoded form of `raw`; `None` when it was not a valid wire record
    pub message: Option<Message>,
}

/// Mock transport implementation for testing
#[derive(Default)]
pub struct MockTransport {
    deliveries: Mutex<Vec<Delivery>>,
    attempts: AtomicU32,
    failures_remaining: AtomicU32,
    always_fail: AtomicBool,
    responder: Mutex<Option<Responder>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` delivery attempts with a communication error
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Fail every attempt until reset with `fail_always(false)`
    pub fn fail_always(&self, enabled: bool) {
        self.always_fail.store(enabled, Ordering::SeqCst);
    }

    /// Answer delivered requests that expect a response
    ///
    /// The closure's payload is wrapped as the request type's response; a
    /// payload with an `error` field is sent back as `SYSTEM_ERROR`.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Message) -> Option<Value> + Send + Sync + 'static,
    {
        *lock(&self.responder) = Some(Box::new(responder));
    }

    /// Successful deliveries in order
    pub fn deliveries(&self) -> Vec<Delivery> {
        lock(&self.deliveries).clone()
    }

    /// Decoded messages of successful deliveries
    pub fn sent_messages(&self) -> Vec<Message> {
        lock(&self.deliveries)
            .iter()
            .filter_map(|delivery| delivery.message.clone())
            .collect()
    }

    /// Every call to `deliver`, including failed ones
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        lock(&self.deliveries).clear();
        self.attempts.store(0, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        if self.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn reply_for(&self, message: &Message) -> TabsyncResult<Option<String>> {
        if !message.needs_response {
            return Ok(None);
        }
        let responder = lock(&self.responder);
        let Some(payload) = responder.as_ref().and_then(|respond| respond(message)) else {
            return Ok(None);
        };
        let response_type = if payload.get("error").is_some() {
            tabsync_core::MessageType::SystemError
        } else {
            message.message_type.response_type()
        };
        // Scripted replies answer instantly, so they share the request's time
        message
            .reply(message.target, response_type, payload, message.created_at)
            .serialize()
            .map(Some)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn deliver(&self, payload: String, target: ContextId) -> TabsyncResult<Option<String>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.should_fail() {
            trace!(attempt, target = %target, "Mock delivery failed");
            return Err(TabsyncError::communication(target.to_string(), "mock delivery failure"));
        }

        let message = Message::deserialize(&payload).ok();
        let reply = match &message {
            Some(message) => self.reply_for(message)?,
            None => None,
        };
        lock(&self.deliveries).push(Delivery {
            target,
            raw: payload,
            message,
        });
        Ok(reply)
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("deliveries", &lock(&self.deliveries).len())
            .field("attempts", &self.attempts())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabsync_core::{MessageType, Timestamp};

    fn ping(needs_response: bool) -> Message {
        let message = Message::new(
            MessageType::Ping,
            json!({}),
            ContextId::Popup,
            ContextId::Background,
            Timestamp::new(1_000),
        );
        if needs_response {
            message.expecting_response()
        } else {
            message
        }
    }

    #[tokio::test]
    async fn test_records_and_fails_on_demand() {
        let transport = MockTransport::new();
        transport.fail_next(1);

        let raw = ping(false).serialize().unwrap();
        assert!(transport.deliver(raw.clone(), ContextId::Background).await.is_err());
        assert!(transport.deliver(raw, ContextId::Background).await.unwrap().is_none());

        assert_eq!(transport.attempts(), 2);
        assert_eq!(transport.deliveries().len(), 1);
        assert_eq!(transport.sent_messages()[0].message_type, MessageType::Ping);
    }

    #[tokio::test]
    async fn test_responder_builds_correlated_reply() {
        let transport = MockTransport::new();
        transport.respond_with(|_| Some(json!({ "pong": true })));

        let request = ping(true);
        let raw = request.serialize().unwrap();
        let reply = transport.deliver(raw, ContextId::Background).await.unwrap().unwrap();
        let reply = Message::deserialize(&reply).unwrap();

        assert_eq!(reply.message_type, MessageType::PingResponse);
        assert_eq!(reply.response_to_id, Some(request.id));
        assert_eq!(reply.target, ContextId::Popup);
    }
}
