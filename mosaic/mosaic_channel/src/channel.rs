//! Typed RPC channel.
//!
//! A `MessageChannel` sits on one side of an isolation boundary. Outbound
//! messages go through a [`ChannelEndpoint`]; inbound messages are handed to
//! [`MessageChannel::receive`] by whoever subscribed to the host's message
//! hub. Calls are correlated by a fresh `CallId` and complete exactly once.

use futures::future::BoxFuture;
use futures::FutureExt;
use mosaic_core::error::RpcError;
use mosaic_core::id::{CallId, ContextId};
use mosaic_core::types::InboundMessage;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::origin::origin_matches;
use crate::protocol::RpcMessage;

/// Default call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// The outbound half of a channel.
pub trait ChannelEndpoint: Send + Sync {
    /// Post an encoded message across the boundary.
    fn post(&self, data: Value) -> Result<(), RpcError>;
}

type MethodHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;
type EventListener = Arc<dyn Fn(Value) + Send + Sync>;
type PendingSender = oneshot::Sender<Result<Value, RpcError>>;

/// Identifier of an event listener registered with [`MessageChannel::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Acceptance rules and defaults of a channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Label used in logs.
    pub name: String,

    /// Exact origin inbound messages must declare, if any.
    pub expected_origin: Option<String>,

    /// Context inbound messages must come from, if any.
    pub expected_source: Option<ContextId>,

    /// Default call timeout.
    pub timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            name: "channel".to_string(),
            expected_origin: None,
            expected_source: None,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl ChannelOptions {
    /// Options with a log label.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Only accept messages declaring `origin`.
    pub fn with_expected_origin(mut self, origin: impl Into<String>) -> Self {
        self.expected_origin = Some(origin.into());
        self
    }

    /// Only accept messages posted by `source`.
    pub fn with_expected_source(mut self, source: ContextId) -> Self {
        self.expected_source = Some(source);
        self
    }

    /// Default call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

struct ChannelInner {
    endpoint: Arc<dyn ChannelEndpoint>,
    options: ChannelOptions,
    handlers: Mutex<HashMap<String, MethodHandler>>,
    listeners: Mutex<Vec<(ListenerId, String, EventListener)>>,
    pending: Mutex<HashMap<CallId, PendingSender>>,
    next_listener: AtomicU64,
    disposed: AtomicBool,
}

impl ChannelInner {
    fn post(&self, message: &RpcMessage) -> Result<(), RpcError> {
        let data = message.encode()?;
        trace!(
            "[{}] -> {} {}",
            self.options.name,
            message.kind(),
            message.id()
        );
        self.endpoint.post(data)
    }

    fn complete(&self, id: CallId, outcome: Result<Value, RpcError>) {
        let sender = self.pending.lock().remove(&id);
        match sender {
            Some(sender) => {
                // The caller may already be gone; nothing to do then.
                let _ = sender.send(outcome);
            }
            None => trace!("[{}] Dropping response for unknown call {}", self.options.name, id),
        }
    }
}

/// Removes a pending call however the caller's future ends.
struct PendingGuard<'a> {
    inner: &'a ChannelInner,
    id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

/// Request/response and event channel across one isolation boundary.
///
/// Cloning is cheap; clones share handlers, listeners and pending calls.
#[derive(Clone)]
pub struct MessageChannel {
    inner: Arc<ChannelInner>,
}

impl MessageChannel {
    /// Create a channel posting through `endpoint`.
    pub fn new(endpoint: Arc<dyn ChannelEndpoint>, options: ChannelOptions) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                endpoint,
                options,
                handlers: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Acceptance rules of this channel.
    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    /// Register a handler the remote side can call.
    ///
    /// A handler registered under an existing name replaces it.
    pub fn expose<F, Fut, E>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        let handler: MethodHandler = Arc::new(move |args: Vec<Value>| {
            handler(args)
                .map(|result| result.map_err(|e| e.to_string()))
                .boxed()
        });
        self.inner.handlers.lock().insert(method.into(), handler);
    }

    /// Remove an exposed handler.
    pub fn unexpose(&self, method: &str) -> bool {
        self.inner.handlers.lock().remove(method).is_some()
    }

    /// Call a remote method with the default timeout.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call_with_timeout(method, args, self.inner.options.timeout)
            .await
    }

    /// Call a remote method and decode the result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<T, RpcError> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call a remote method with an explicit timeout.
    ///
    /// The pending entry is removed when the call completes, times out, fails
    /// to send, or when the returned future is dropped.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if self.is_disposed() {
            return Err(RpcError::Disposed);
        }

        let id = CallId::new();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            inner: &self.inner,
            id,
        };

        self.inner.post(&RpcMessage::Call {
            id,
            method: method.to_string(),
            args,
        })?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an answer: the channel was torn down.
            Ok(Err(_)) => Err(RpcError::Disposed),
            Err(_) => {
                debug!(
                    "[{}] Call '{}' ({}) timed out after {:?}",
                    self.inner.options.name, method, id, timeout
                );
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a fire-and-forget event.
    pub fn emit(&self, event: &str, payload: Value) -> Result<(), RpcError> {
        if self.is_disposed() {
            return Err(RpcError::Disposed);
        }

        self.inner.post(&RpcMessage::Event {
            id: CallId::new(),
            name: event.to_string(),
            payload,
        })
    }

    /// Listen for inbound events named `event`.
    pub fn on<F>(&self, event: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .lock()
            .push((id, event.into(), Arc::new(listener)));
        id
    }

    /// Remove an event listener.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Handle an inbound message.
    ///
    /// Returns `false` when the message was dropped: the channel is disposed,
    /// the sender or origin is not the expected one, or the message does not
    /// speak the channel protocol.
    pub fn receive(&self, message: &InboundMessage) -> bool {
        let name = &self.inner.options.name;

        if self.is_disposed() {
            return false;
        }

        if let Some(expected) = self.inner.options.expected_source {
            if message.source != expected {
                trace!("[{}] Ignoring message from context {}", name, message.source);
                return false;
            }
        }

        if !origin_matches(self.inner.options.expected_origin.as_deref(), &message.origin) {
            debug!(
                "[{}] Dropping message from unexpected origin '{}'",
                name, message.origin
            );
            return false;
        }

        let rpc = match RpcMessage::decode(&message.data) {
            Some(rpc) => rpc,
            None => return false,
        };

        trace!("[{}] <- {} {}", name, rpc.kind(), rpc.id());

        match rpc {
            RpcMessage::Call { id, method, args } => self.dispatch_call(id, method, args),
            RpcMessage::Result { id, value } => self.inner.complete(id, Ok(value)),
            RpcMessage::Error { id, message } => {
                self.inner.complete(id, Err(RpcError::Remote(message)))
            }
            RpcMessage::Event { name, payload, .. } => self.dispatch_event(&name, payload),
        }
        true
    }

    fn dispatch_call(&self, id: CallId, method: String, args: Vec<Value>) {
        let handler = self.inner.handlers.lock().get(&method).cloned();

        let handler = match handler {
            Some(handler) => handler,
            None => {
                let reply = RpcMessage::Error {
                    id,
                    message: RpcError::UnknownMethod(method).to_string(),
                };
                if let Err(e) = self.inner.post(&reply) {
                    warn!("[{}] Failed to reply to call {}: {}", self.inner.options.name, id, e);
                }
                return;
            }
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(
                    "[{}] No async runtime to serve '{}', rejecting call {}",
                    self.inner.options.name, method, id
                );
                let _ = self.inner.post(&RpcMessage::Error {
                    id,
                    message: format!("Handler for '{}' could not be scheduled", method),
                });
                return;
            }
        };

        let inner = self.inner.clone();
        runtime.spawn(async move {
            let outcome = AssertUnwindSafe(async move { handler(args).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    warn!("[{}] Handler for '{}' panicked", inner.options.name, method);
                    Err("handler panicked".to_string())
                });
            let reply = match outcome {
                Ok(value) => RpcMessage::Result { id, value },
                Err(message) => RpcMessage::Error {
                    id,
                    message: RpcError::HandlerFailed { method, message }.to_string(),
                },
            };

            if inner.disposed.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = inner.post(&reply) {
                warn!("[{}] Failed to reply to call {}: {}", inner.options.name, id, e);
            }
        });
    }

    fn dispatch_event(&self, name: &str, payload: Value) {
        let listeners: Vec<EventListener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .filter(|(_, event, _)| event == name)
            .map(|(_, _, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(payload.clone());
        }
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Reject every pending call and drop all handlers and listeners.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending: Vec<PendingSender> = self
            .inner
            .pending
            .lock()
            .drain()
            .map(|(_, sender)| sender)
            .collect();
        let rejected = pending.len();
        for sender in pending {
            let _ = sender.send(Err(RpcError::Disposed));
        }

        self.inner.handlers.lock().clear();
        self.inner.listeners.lock().clear();

        debug!(
            "[{}] Channel disposed, {} pending calls rejected",
            self.inner.options.name, rejected
        );
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("name", &self.inner.options.name)
            .field("pending", &self.pending_calls())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_MARKER;
    use serde_json::json;

    /// Records posted messages without delivering them anywhere.
    #[derive(Default)]
    struct RecordingEndpoint {
        posted: Mutex<Vec<Value>>,
    }

    impl ChannelEndpoint for RecordingEndpoint {
        fn post(&self, data: Value) -> Result<(), RpcError> {
            self.posted.lock().push(data);
            Ok(())
        }
    }

    fn channel_with_recorder(options: ChannelOptions) -> (MessageChannel, Arc<RecordingEndpoint>) {
        let endpoint = Arc::new(RecordingEndpoint::default());
        (MessageChannel::new(endpoint.clone(), options), endpoint)
    }

    fn last_call_id(endpoint: &RecordingEndpoint) -> CallId {
        let posted = endpoint.posted.lock();
        match RpcMessage::decode(posted.last().unwrap()) {
            Some(RpcMessage::Call { id, .. }) => id,
            other => panic!("expected a call, got {:?}", other),
        }
    }

    fn response(source: ContextId, origin: &str, message: RpcMessage) -> InboundMessage {
        InboundMessage::new(source, origin, message.encode().unwrap())
    }

    #[tokio::test]
    async fn test_duplicate_response_completes_once() {
        let source = ContextId::new();
        let (channel, endpoint) = channel_with_recorder(
            ChannelOptions::named("dup").with_expected_source(source),
        );

        let caller = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call("sum", vec![json!(1), json!(2)]).await })
        };
        while channel.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }

        let id = last_call_id(&endpoint);
        assert!(channel.receive(&response(source, "null", RpcMessage::Result { id, value: json!(3) })));
        // A late duplicate is accepted as protocol traffic but changes nothing.
        channel.receive(&response(source, "null", RpcMessage::Result { id, value: json!(99) }));

        assert_eq!(caller.await.unwrap().unwrap(), json!(3));
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending_entry() {
        let (channel, _endpoint) =
            channel_with_recorder(ChannelOptions::named("slow").with_timeout(Duration::from_millis(50)));

        for _ in 0..5 {
            let err = channel.call("never", vec![]).await.unwrap_err();
            assert_eq!(
                err,
                RpcError::Timeout {
                    method: "never".to_string(),
                    timeout_ms: 50
                }
            );
        }
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_after_timeout_is_dropped() {
        let source = ContextId::new();
        let (channel, endpoint) = channel_with_recorder(
            ChannelOptions::named("late")
                .with_expected_source(source)
                .with_timeout(Duration::from_millis(50)),
        );
        let events = Arc::new(AtomicU64::new(0));
        {
            let events = events.clone();
            channel.on("result", move |_| {
                events.fetch_add(1, Ordering::SeqCst);
            });
        }

        let err = channel.call("slow", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        let id = last_call_id(&endpoint);

        // Still protocol traffic, but nobody is waiting for it any more.
        assert!(channel.receive(&response(source, "null", RpcMessage::Result { id, value: json!(1) })));
        assert!(channel.receive(&response(
            source,
            "null",
            RpcMessage::Error {
                id,
                message: "too late".to_string()
            }
        )));
        assert_eq!(channel.pending_calls(), 0);
        assert_eq!(events.load(Ordering::SeqCst), 0);
        assert_eq!(endpoint.posted.lock().len(), 1);

        // The channel keeps working for later calls.
        let caller = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call("fast", vec![]).await })
        };
        while channel.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }
        let id = last_call_id(&endpoint);
        channel.receive(&response(source, "null", RpcMessage::Result { id, value: json!(2) }));
        assert_eq!(caller.await.unwrap().unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_panicking_handler_replies_with_error() {
        let (channel, endpoint) = channel_with_recorder(ChannelOptions::default());
        channel.expose("explode", |args: Vec<Value>| async move {
            if args.is_empty() {
                panic!("boom");
            }
            Ok::<_, String>(json!(null))
        });

        let id = CallId::new();
        channel.receive(&response(
            ContextId::new(),
            "null",
            RpcMessage::Call {
                id,
                method: "explode".to_string(),
                args: vec![],
            },
        ));

        for _ in 0..20 {
            if !endpoint.posted.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let posted = endpoint.posted.lock();
        match RpcMessage::decode(posted.last().unwrap()) {
            Some(RpcMessage::Error { id: reply_id, message }) => {
                assert_eq!(reply_id, id);
                assert!(message.contains("explode"));
                assert!(message.contains("panicked"));
            }
            other => panic!("expected an error reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_call_future_removes_pending_entry() {
        let (channel, _endpoint) = channel_with_recorder(ChannelOptions::default());

        let call = channel.call("abandoned", vec![]);
        let mut call = Box::pin(call);
        // Poll once so the call registers, then drop it.
        assert!(futures::poll!(call.as_mut()).is_pending());
        assert_eq!(channel.pending_calls(), 1);
        drop(call);
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_origin_mismatch_is_dropped() {
        let source = ContextId::new();
        let (channel, endpoint) = channel_with_recorder(
            ChannelOptions::named("strict")
                .with_expected_origin("https://widgets.example.com")
                .with_expected_source(source),
        );

        let caller = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .call_with_timeout("ping", vec![], Duration::from_millis(200))
                    .await
            })
        };
        while channel.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }
        let id = last_call_id(&endpoint);

        let spoofed = response(source, "https://evil.example.com", RpcMessage::Result { id, value: json!("pwned") });
        assert!(!channel.receive(&spoofed));

        let wrong_source = response(
            ContextId::new(),
            "https://widgets.example.com",
            RpcMessage::Result { id, value: json!("pwned") },
        );
        assert!(!channel.receive(&wrong_source));
        assert_eq!(channel.pending_calls(), 1);

        let genuine = response(source, "https://widgets.example.com", RpcMessage::Result { id, value: json!("pong") });
        assert!(channel.receive(&genuine));
        assert_eq!(caller.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_origin_mismatch_never_reaches_listeners() {
        let (channel, _endpoint) =
            channel_with_recorder(ChannelOptions::named("events").with_expected_origin("null"));
        let hits = Arc::new(AtomicU64::new(0));
        {
            let hits = hits.clone();
            channel.on("tick", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        let event = RpcMessage::Event {
            id: CallId::new(),
            name: "tick".to_string(),
            payload: json!(1),
        };
        channel.receive(&response(ContextId::new(), "https://host.example.com", event.clone()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        channel.receive(&response(ContextId::new(), "null", event));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unmarked_messages_are_ignored() {
        let (channel, _endpoint) = channel_with_recorder(ChannelOptions::default());
        let data = json!({ "type": "event", "id": CallId::new(), "name": "tick" });
        assert!(!channel.receive(&InboundMessage::new(ContextId::new(), "null", data)));

        let data = json!({ PROTOCOL_MARKER: true, "type": "event", "id": CallId::new(), "name": "tick" });
        assert!(channel.receive(&InboundMessage::new(ContextId::new(), "null", data)));
    }

    #[tokio::test]
    async fn test_unknown_method_replies_with_error() {
        let (channel, endpoint) = channel_with_recorder(ChannelOptions::default());
        let id = CallId::new();
        channel.receive(&response(
            ContextId::new(),
            "null",
            RpcMessage::Call {
                id,
                method: "missing".to_string(),
                args: vec![],
            },
        ));

        let posted = endpoint.posted.lock();
        match RpcMessage::decode(posted.last().unwrap()) {
            Some(RpcMessage::Error { id: reply_id, message }) => {
                assert_eq!(reply_id, id);
                assert!(message.contains("missing"));
            }
            other => panic!("expected an error reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispose_rejects_pending_and_later_calls() {
        let (channel, _endpoint) = channel_with_recorder(ChannelOptions::default());

        let caller = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call("slow", vec![]).await })
        };
        while channel.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }

        channel.dispose();
        assert_eq!(caller.await.unwrap(), Err(RpcError::Disposed));
        assert_eq!(channel.pending_calls(), 0);
        assert!(channel.is_disposed());

        assert_eq!(channel.call("again", vec![]).await, Err(RpcError::Disposed));
        assert_eq!(channel.emit("tick", json!(null)), Err(RpcError::Disposed));
        assert!(!channel.receive(&InboundMessage::new(
            ContextId::new(),
            "null",
            RpcMessage::Event {
                id: CallId::new(),
                name: "tick".into(),
                payload: json!(null)
            }
            .encode()
            .unwrap()
        )));
    }

    #[test]
    fn test_listener_registration() {
        let (channel, _endpoint) = channel_with_recorder(ChannelOptions::default());
        let id = channel.on("a", |_| {});
        assert!(channel.off(id));
        assert!(!channel.off(id));

        channel.expose("m", |_args| async { Ok::<_, String>(json!(null)) });
        assert!(channel.unexpose("m"));
        assert!(!channel.unexpose("m"));
    }
}
