//! End-to-end RPC between two channels wired through message hubs.

use mosaic_channel::{
    ChannelEndpoint, ChannelOptions, MessageChannel, MessageHub, Subscription, OPAQUE_ORIGIN,
};
use mosaic_core::error::RpcError;
use mosaic_core::id::ContextId;
use mosaic_core::types::InboundMessage;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

// Initialize tracing for tests
fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Delivers posted messages into the peer's hub, stamped with our identity.
struct HubEndpoint {
    peer: MessageHub,
    source: ContextId,
    origin: String,
}

impl ChannelEndpoint for HubEndpoint {
    fn post(&self, data: Value) -> Result<(), RpcError> {
        self.peer
            .deliver(InboundMessage::new(self.source, self.origin.clone(), data));
        Ok(())
    }
}

struct Side {
    channel: MessageChannel,
    _subscription: Subscription,
}

fn side(
    name: &str,
    own_hub: &MessageHub,
    peer_hub: &MessageHub,
    own_id: ContextId,
    own_origin: &str,
    peer_id: ContextId,
    peer_origin: &str,
) -> Side {
    let endpoint = Arc::new(HubEndpoint {
        peer: peer_hub.clone(),
        source: own_id,
        origin: own_origin.to_string(),
    });
    let channel = MessageChannel::new(
        endpoint,
        ChannelOptions::named(name)
            .with_expected_source(peer_id)
            .with_expected_origin(peer_origin)
            .with_timeout(Duration::from_secs(1)),
    );

    let receiver = channel.clone();
    let subscription = own_hub.subscribe(move |message| {
        receiver.receive(message);
    });

    Side {
        channel,
        _subscription: subscription,
    }
}

fn pair() -> (Side, Side) {
    init_tracing();
    let host_hub = MessageHub::new();
    let guest_hub = MessageHub::new();
    let host_id = ContextId::new();
    let guest_id = ContextId::new();

    let host = side(
        "host",
        &host_hub,
        &guest_hub,
        host_id,
        "https://host.example.com",
        guest_id,
        OPAQUE_ORIGIN,
    );
    let guest = side(
        "guest",
        &guest_hub,
        &host_hub,
        guest_id,
        OPAQUE_ORIGIN,
        host_id,
        "https://host.example.com",
    );
    (host, guest)
}

#[tokio::test]
async fn test_greet_round_trip() {
    let (host, guest) = pair();

    guest.channel.expose("greet", |args: Vec<Value>| async move {
        let name = args
            .first()
            .and_then(Value::as_str)
            .ok_or("missing name")?
            .to_string();
        Ok::<_, &str>(json!(format!("Hello, {}!", name)))
    });

    let greeting: String = host
        .channel
        .call_as("greet", vec![json!("World")])
        .await
        .unwrap();
    assert_eq!(greeting, "Hello, World!");
    assert_eq!(host.channel.pending_calls(), 0);
}

#[tokio::test]
async fn test_handler_failure_becomes_remote_error() {
    let (host, guest) = pair();

    guest
        .channel
        .expose("explode", |_args| async { Err::<Value, _>("boom") });

    let err = host.channel.call("explode", vec![]).await.unwrap_err();
    match err {
        RpcError::Remote(message) => {
            assert!(message.contains("explode"));
            assert!(message.contains("boom"));
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_method_rejects_caller() {
    let (host, _guest) = pair();

    let err = host.channel.call("nope", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote(ref message) if message.contains("nope")));
}

#[tokio::test]
async fn test_events_in_both_directions() {
    let (host, guest) = pair();
    let received = Arc::new(AtomicUsize::new(0));

    {
        let received = received.clone();
        guest.channel.on("props", move |payload| {
            assert_eq!(payload, json!({ "theme": "dark" }));
            received.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let received = received.clone();
        host.channel.on("ready", move |_| {
            received.fetch_add(10, Ordering::SeqCst);
        });
    }

    host.channel.emit("props", json!({ "theme": "dark" })).unwrap();
    guest.channel.emit("ready", Value::Null).unwrap();
    // Events unrelated to any listener are ignored.
    guest.channel.emit("other", Value::Null).unwrap();

    assert_eq!(received.load(Ordering::SeqCst), 11);
}

#[tokio::test]
async fn test_calls_are_correlated_independently() {
    let (host, guest) = pair();

    guest.channel.expose("echo", |args: Vec<Value>| async move {
        let delay = args[1].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok::<_, String>(args[0].clone())
    });

    let (a, b) = tokio::join!(
        host.channel.call("echo", vec![json!("slow"), json!(30)]),
        host.channel.call("echo", vec![json!("fast"), json!(0)]),
    );
    assert_eq!(a.unwrap(), json!("slow"));
    assert_eq!(b.unwrap(), json!("fast"));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let (host, guest) = pair();

    guest.channel.expose("hang", |_args| async {
        std::future::pending::<()>().await;
        Ok::<_, String>(Value::Null)
    });

    let err = host
        .channel
        .call_with_timeout("hang", vec![], Duration::from_millis(250))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { timeout_ms: 250, .. }));
    assert_eq!(host.channel.pending_calls(), 0);
}
