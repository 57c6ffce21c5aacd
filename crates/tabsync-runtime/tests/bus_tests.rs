//! Message bus behavior against scripted and loopback transports

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tabsync_core::{
    BusConfig, ContextId, Message, MessageType, Priority, TabsyncError, TabsyncResult, Timestamp,
    Transport,
};
use tabsync_harness::{LoopbackNetwork, MockTimeSource, MockTransport, RecordingErrorSink};
use tabsync_runtime::{Direction, MessageBus, RetryManager, SendOptions, SendOutcome};
use tokio::time::timeout;

const CLOCK_START: u64 = 1_700_000_000_000;

fn bus_on(identity: ContextId, transport: Arc<dyn Transport>) -> (MessageBus, Arc<RecordingErrorSink>) {
    let sink = Arc::new(RecordingErrorSink::new());
    let bus = MessageBus::new(
        identity,
        transport,
        sink.clone(),
        Arc::new(MockTimeSource::new_at(CLOCK_START)),
        BusConfig::default(),
        RetryManager::default(),
    );
    (bus, sink)
}

fn attach(network: &LoopbackNetwork, bus: &MessageBus) {
    let bus = bus.clone();
    network.attach(bus.identity(), move |raw, from| {
        let bus = bus.clone();
        async move { bus.receive(&raw, from).await }
    });
}

async fn explode(_message: Message) -> TabsyncResult<Option<Value>> {
    panic!("handler exploded")
}

fn inbound(message_type: MessageType, payload: serde_json::Value) -> Message {
    Message::new(
        message_type,
        payload,
        ContextId::Tab(1),
        ContextId::Background,
        Timestamp::new(CLOCK_START),
    )
    .expecting_response()
}

#[tokio::test]
async fn test_fire_and_forget_is_delivered() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Popup, transport.clone());

    let outcome = bus
        .send(MessageType::Ping, json!({}), SendOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Queued(_)));
    bus.flush().await;

    let sent = transport.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type, MessageType::Ping);
    assert_eq!(sent[0].source, ContextId::Popup);
    assert_eq!(sent[0].target, ContextId::Background);
    assert_eq!(sent[0].created_at, Timestamp::new(CLOCK_START));
    assert_eq!(bus.stats().delivered, 1);
}

#[tokio::test]
async fn test_replies_are_stamped_from_the_bus_clock() {
    let transport = Arc::new(MockTransport::new());
    let clock = MockTimeSource::new_at(CLOCK_START);
    let bus = MessageBus::new(
        ContextId::Background,
        transport.clone(),
        Arc::new(RecordingErrorSink::new()),
        Arc::new(clock.clone()),
        BusConfig::default(),
        RetryManager::default(),
    );
    let _handler = bus.on(MessageType::Ping, |_| async { Ok(Some(json!({ "pong": true }))) });

    clock.advance(750);
    bus.receive_message(inbound(MessageType::Ping, json!({}))).await;
    bus.flush().await;

    let sent = transport.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type, MessageType::PingResponse);
    assert_eq!(sent[0].created_at, Timestamp::new(CLOCK_START + 750));
}

#[tokio::test]
async fn test_response_times_out_and_pending_entry_is_removed() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Popup, transport);

    let result = bus
        .send(
            MessageType::Ping,
            json!({}),
            SendOptions::default()
                .expect_response()
                .timeout(Duration::from_millis(50)),
        )
        .await;

    assert!(matches!(result, Err(TabsyncError::Timeout { timeout_ms: 50, .. })));
    assert_eq!(bus.pending_count(), 0);
    assert_eq!(bus.stats().timeouts, 1);
}

#[tokio::test]
async fn test_abandoned_request_leaves_no_pending_entry() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Popup, transport);

    let abandoned = timeout(
        Duration::from_millis(20),
        bus.request(
            MessageType::Ping,
            json!({}),
            SendOptions::default().timeout(Duration::from_secs(10)),
        ),
    )
    .await;

    assert!(abandoned.is_err());
    assert_eq!(bus.pending_count(), 0);
    assert_eq!(bus.stats().timeouts, 0);
}

#[tokio::test]
async fn test_transport_reply_resolves_request() {
    let transport = Arc::new(MockTransport::new());
    transport.respond_with(|message| Some(json!({ "echo": message.message_type.as_str() })));
    let (bus, _) = bus_on(ContextId::Popup, transport);

    let response = bus
        .request(MessageType::Ping, json!({}), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(response.message_type, MessageType::PingResponse);
    assert_eq!(response.payload["echo"], json!("PING"));
    assert!(!bus.has_pending(&response.response_to_id.unwrap()));
}

#[tokio::test]
async fn test_error_reply_resolves_as_system_error() {
    let transport = Arc::new(MockTransport::new());
    transport.respond_with(|_| Some(json!({ "error": "feature unavailable" })));
    let (bus, _) = bus_on(ContextId::Popup, transport);

    let response = bus
        .request(MessageType::Ping, json!({}), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(response.message_type, MessageType::SystemError);
    assert_eq!(response.payload["error"], json!("feature unavailable"));
}

#[tokio::test]
async fn test_outbound_order_follows_priority_then_fifo() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Background, transport.clone());

    let sends = [
        ("low-1", Priority::Low),
        ("normal-1", Priority::Normal),
        ("high-1", Priority::High),
        ("normal-2", Priority::Normal),
        ("high-2", Priority::High),
    ];
    // Nothing yields between these sends, so the drain sees all of them
    for (label, priority) in sends {
        bus.send(
            MessageType::Ping,
            json!({ "label": label }),
            SendOptions::to(ContextId::Tab(1)).priority(priority),
        )
        .await
        .unwrap();
    }
    bus.flush().await;

    let labels: Vec<String> = transport
        .sent_messages()
        .iter()
        .map(|message| message.payload["label"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(labels, ["high-1", "high-2", "normal-1", "normal-2", "low-1"]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_the_pending_response() {
    let transport = Arc::new(MockTransport::new());
    transport.fail_always(true);
    let (bus, sink) = bus_on(ContextId::Popup, transport.clone());

    let result = bus
        .request(
            MessageType::Ping,
            json!({}),
            SendOptions::default().timeout(Duration::from_secs(30)),
        )
        .await;

    assert!(matches!(result, Err(TabsyncError::Communication { .. })));
    assert_eq!(transport.attempts(), 3);
    assert_eq!(bus.pending_count(), 0);
    assert_eq!(bus.stats().delivery_failures, 1);
    assert_eq!(sink.origins(), ["delivery"]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried() {
    let transport = Arc::new(MockTransport::new());
    transport.fail_next(2);
    let (bus, _) = bus_on(ContextId::Popup, transport.clone());

    bus.send(MessageType::Ping, json!({}), SendOptions::default())
        .await
        .unwrap();
    bus.flush().await;

    assert_eq!(transport.attempts(), 3);
    assert_eq!(transport.deliveries().len(), 1);
}

#[tokio::test]
async fn test_invalid_payload_is_rejected_before_enqueue() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Popup, transport.clone());

    let result = bus
        .send(MessageType::UpdateParameter, json!({}), SendOptions::default())
        .await;
    assert!(matches!(result, Err(TabsyncError::Validation(_))));
    bus.flush().await;
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn test_unhandled_request_gets_system_error_reply() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Background, transport.clone());

    let request = inbound(MessageType::Ping, json!({}));
    bus.receive(&request.serialize().unwrap(), ContextId::Tab(1)).await;
    bus.flush().await;

    let sent = transport.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type, MessageType::SystemError);
    assert_eq!(sent[0].target, ContextId::Tab(1));
    assert_eq!(sent[0].response_to_id, Some(request.id));
}

#[tokio::test]
async fn test_invalid_inbound_payload_never_reaches_handler() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Background, transport.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let _handler = bus.on(MessageType::UpdateParameter, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(None) }
    });

    let request = inbound(MessageType::UpdateParameter, json!({ "value": "high" }));
    bus.receive(&request.serialize().unwrap(), ContextId::Tab(1)).await;
    bus.flush().await;

    let sent = transport.sent_messages();
    assert_eq!(sent[0].message_type, MessageType::SystemError);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failing_handler_does_not_stop_the_next_one() {
    let transport = Arc::new(MockTransport::new());
    let (bus, sink) = bus_on(ContextId::Background, transport.clone());
    let _failing = bus.on(MessageType::Ping, |_| async {
        Err(TabsyncError::internal("first handler broke"))
    });
    let _working = bus.on(MessageType::Ping, |_| async { Ok(Some(json!({ "pong": true }))) });

    let request = inbound(MessageType::Ping, json!({}));
    bus.receive_message(request).await;
    bus.flush().await;

    let sent = transport.sent_messages();
    assert_eq!(sent[0].message_type, MessageType::PingResponse);
    assert_eq!(sent[0].payload, json!({ "pong": true }));
    assert_eq!(sink.origins(), ["handler:PING"]);
    assert_eq!(bus.stats().handler_errors, 1);
}

#[tokio::test]
async fn test_handler_panic_is_isolated() {
    let transport = Arc::new(MockTransport::new());
    let (bus, sink) = bus_on(ContextId::Background, transport.clone());
    let _panicking = bus.on(MessageType::Ping, explode);

    bus.receive_message(inbound(MessageType::Ping, json!({}))).await;
    bus.flush().await;

    assert_eq!(transport.sent_messages()[0].message_type, MessageType::SystemError);
    assert_eq!(sink.reports().len(), 1);
}

#[tokio::test]
async fn test_cancelled_handler_no_longer_runs() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Background, transport);
    let registration = bus.on(MessageType::Ping, |_| async { Ok(None) });
    assert_eq!(bus.handler_count(MessageType::Ping), 1);
    registration.cancel();
    assert_eq!(bus.handler_count(MessageType::Ping), 0);
}

#[tokio::test]
async fn test_middleware_can_drop_outbound_messages() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Popup, transport.clone());
    let _filter = bus.add_middleware(|message: Message, direction: Direction| -> TabsyncResult<Option<Message>> {
        if direction == Direction::Outbound && message.message_type == MessageType::Ping {
            Ok(None)
        } else {
            Ok(Some(message))
        }
    });

    let outcome = bus
        .send(MessageType::Ping, json!({}), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Dropped);
    bus.flush().await;
    assert_eq!(transport.attempts(), 0);
    assert_eq!(bus.stats().dropped, 1);
}

#[tokio::test]
async fn test_middleware_can_drop_inbound_messages() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Background, transport.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let _handler = bus.on(MessageType::Ping, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(Some(json!({ "pong": true }))) }
    });
    let _filter = bus.add_middleware(|message: Message, direction: Direction| -> TabsyncResult<Option<Message>> {
        if direction == Direction::Inbound && message.message_type == MessageType::Ping {
            Ok(None)
        } else {
            Ok(Some(message))
        }
    });

    let raw = inbound(MessageType::Ping, json!({})).serialize().unwrap();
    bus.receive(&raw, ContextId::Tab(1)).await;
    bus.flush().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(transport.attempts(), 0);
    assert_eq!(bus.stats().dropped, 1);
    assert_eq!(bus.stats().received, 1);
}

#[tokio::test]
async fn test_failing_middleware_keeps_the_message() {
    let transport = Arc::new(MockTransport::new());
    let (bus, sink) = bus_on(ContextId::Popup, transport.clone());
    let _broken = bus.add_middleware(|_: Message, _: Direction| -> TabsyncResult<Option<Message>> {
        Err(TabsyncError::internal("bad middleware"))
    });
    let _tagging = bus.add_middleware(|mut message: Message, _: Direction| -> TabsyncResult<Option<Message>> {
        message.payload = json!({ "tagged": true });
        Ok(Some(message))
    });

    bus.send(MessageType::Ping, json!({}), SendOptions::default())
        .await
        .unwrap();
    bus.flush().await;

    assert_eq!(transport.sent_messages()[0].payload, json!({ "tagged": true }));
    assert_eq!(sink.origins(), ["middleware"]);
}

#[tokio::test]
async fn test_clear_rejects_pending_requests() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Popup, transport);

    let requester = bus.clone();
    let request = tokio::spawn(async move {
        requester
            .request(
                MessageType::Ping,
                json!({}),
                SendOptions::default().timeout(Duration::from_secs(10)),
            )
            .await
    });
    while bus.pending_count() == 0 {
        tokio::task::yield_now().await;
    }

    bus.clear();
    let result = request.await.unwrap();
    assert!(matches!(result, Err(TabsyncError::Internal { .. })));
    assert_eq!(bus.pending_count(), 0);
    assert_eq!(bus.queue_sizes().outbound, 0);
}

#[tokio::test]
async fn test_disposed_bus_refuses_work() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Popup, transport);
    let _handler = bus.on(MessageType::Ping, |_| async { Ok(None) });

    bus.dispose();
    assert!(bus.is_disposed());
    assert_eq!(bus.handler_count(MessageType::Ping), 0);

    let result = bus.send(MessageType::Ping, json!({}), SendOptions::default()).await;
    assert!(matches!(result, Err(TabsyncError::Disposed { .. })));
    let late = bus.on(MessageType::Ping, |_| async { Ok(None) });
    assert_eq!(bus.handler_count(MessageType::Ping), 0);
    late.cancel();
}

#[tokio::test]
async fn test_malformed_inbound_record_is_dropped() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Background, transport.clone());

    bus.receive("{ not json", ContextId::Tab(4)).await;
    bus.receive(r#"{"type":"NOT_A_TYPE"}"#, ContextId::Tab(4)).await;
    bus.flush().await;

    assert_eq!(bus.stats().dropped, 2);
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn test_uncorrelated_response_is_ignored() {
    let transport = Arc::new(MockTransport::new());
    let (bus, _) = bus_on(ContextId::Popup, transport.clone());

    let stray = inbound(MessageType::Ping, json!({})).reply(
        ContextId::Background,
        MessageType::PingResponse,
        json!({}),
        Timestamp::new(CLOCK_START),
    );
    bus.receive_message(stray).await;
    bus.flush().await;
    assert_eq!(transport.attempts(), 0);
    assert_eq!(bus.pending_count(), 0);
}

#[tokio::test]
async fn test_request_across_loopback_network() {
    let network = LoopbackNetwork::new();
    let (background, _) = bus_on(ContextId::Background, network.endpoint(ContextId::Background));
    let (popup, _) = bus_on(ContextId::Popup, network.endpoint(ContextId::Popup));
    attach(&network, &background);
    attach(&network, &popup);

    let _handler = background.on(MessageType::Ping, |message| async move {
        Ok(Some(json!({ "pong": true, "from": message.source.to_string() })))
    });

    let response = timeout(
        Duration::from_secs(2),
        popup.request(MessageType::Ping, json!({}), SendOptions::default()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(response.message_type, MessageType::PingResponse);
    assert_eq!(response.source, ContextId::Background);
    assert_eq!(response.payload["from"], json!("popup"));
}

#[tokio::test]
async fn test_broadcast_request_takes_first_response() {
    let network = LoopbackNetwork::new();
    let (background, _) = bus_on(ContextId::Background, network.endpoint(ContextId::Background));
    attach(&network, &background);

    let mut tabs = Vec::new();
    for tab in 1..=3 {
        let (bus, _) = bus_on(ContextId::Tab(tab), network.endpoint(ContextId::Tab(tab)));
        attach(&network, &bus);
        let registration = bus.on(MessageType::Ping, move |_| async move { Ok(Some(json!({ "tab": tab }))) });
        tabs.push((bus, registration));
    }

    let response = timeout(
        Duration::from_secs(2),
        background.request(MessageType::Ping, json!({}), SendOptions::to(ContextId::Broadcast)),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(response.message_type, MessageType::PingResponse);
    assert!(response.payload["tab"].as_u64().is_some());
}
