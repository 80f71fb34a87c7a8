//! A complete fake host for exercising strategies and the runtime.
//!
//! `FakeHost` wires every double from `mosaic_core::testing` into one
//! [`HostServices`] and can play the sub-application side of the RPC
//! protocol. Enabled with the `testing` feature.

use mosaic_channel::{RpcMessage, Subscription, ANY_ORIGIN, OPAQUE_ORIGIN};
use mosaic_core::error::Result;
use mosaic_core::id::{ContextId, InstanceId};
use mosaic_core::testing::{
    FakeContext, FakeContextFactory, FakeFetcher, FakeGlobals, FakeOverlayHooks, FakeScriptHost,
    FakeTimers,
};
use mosaic_core::types::InboundMessage;
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

use crate::host::HostServices;

/// Trust origin of the fake host.
pub const HOST_ORIGIN: &str = "https://host.example.com";

/// Sub-application side of an RPC method.
pub type GuestHandler =
    Arc<dyn Fn(&str, Vec<Value>) -> std::result::Result<Value, String> + Send + Sync>;

/// Every host double plus the services built from them.
pub struct FakeHost {
    /// Context factory behind the services.
    pub contexts: Arc<FakeContextFactory>,

    /// Document and script fetcher.
    pub fetcher: Arc<FakeFetcher>,

    /// Script engine.
    pub scripts: Arc<FakeScriptHost>,

    /// Host global object.
    pub globals: Arc<FakeGlobals>,

    /// Host timers.
    pub timers: Arc<FakeTimers>,

    /// Overlay promotion recorder.
    pub overlay: Arc<FakeOverlayHooks>,

    /// The services handed to Mosaic.
    pub services: HostServices,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    /// Build a host with default doubles.
    pub fn new() -> Self {
        let contexts = Arc::new(FakeContextFactory::new());
        let fetcher = Arc::new(FakeFetcher::new());
        let globals = Arc::new(FakeGlobals::new());
        let timers = Arc::new(FakeTimers::new());
        let scripts = Arc::new(FakeScriptHost::new(globals.clone(), timers.clone()));
        let overlay = Arc::new(FakeOverlayHooks::new());

        let services = HostServices::new(
            contexts.clone(),
            fetcher.clone(),
            scripts.clone(),
            globals.clone(),
            timers.clone(),
            HOST_ORIGIN,
        )
        .with_overlay(overlay.clone());

        Self {
            contexts,
            fetcher,
            scripts,
            globals,
            timers,
            overlay,
            services,
        }
    }

    /// Look up a context created by the factory.
    pub fn context(&self, id: ContextId) -> Option<Arc<FakeContext>> {
        self.contexts.context(id)
    }

    /// Deliver a message into the hub as if posted by `source`.
    pub fn post_from(&self, source: ContextId, origin: &str, data: Value) -> usize {
        self.services
            .hub
            .deliver(InboundMessage::new(source, origin, data))
    }

    /// Answer RPC calls posted into every context created from now on.
    ///
    /// Replies declare the origin the call was addressed to, or the opaque
    /// origin when it was addressed to any origin.
    pub fn respond_in_contexts(&self, handler: GuestHandler) {
        let hub = self.services.hub.clone();
        self.contexts
            .set_post_hook(Arc::new(move |source, data, target_origin| {
                let Some(reply) = answer(&handler, &data) else {
                    return;
                };
                let origin = if target_origin == ANY_ORIGIN {
                    OPAQUE_ORIGIN.to_string()
                } else {
                    target_origin
                };
                trace!("Fake guest {} replying from {}", source, origin);
                hub.deliver(InboundMessage::new(source, origin, reply));
            }));
    }

    /// Answer RPC calls sent to an instance over the local bus.
    pub fn respond_on_bus(&self, id: InstanceId, handler: GuestHandler) -> Result<Subscription> {
        let bus = self.services.local_bus.clone();
        let replies = bus.clone();
        bus.on_guest(
            id,
            Arc::new(move |message: &InboundMessage| {
                if let Some(reply) = answer(&handler, &message.data) {
                    let _ = replies.to_host(id, reply);
                }
            }),
        )
    }
}

/// Greets the first argument; fails on anything but a string.
pub fn greeter() -> GuestHandler {
    Arc::new(|method: &str, args: Vec<Value>| match (method, args.first()) {
        ("greet", Some(Value::String(name))) => Ok(Value::String(format!("Hello, {}!", name))),
        ("greet", _) => Err("greet expects a name".to_string()),
        (other, _) => Err(format!("Unknown method: {}", other)),
    })
}

fn answer(handler: &GuestHandler, data: &Value) -> Option<Value> {
    let RpcMessage::Call { id, method, args } = RpcMessage::decode(data)? else {
        return None;
    };
    let reply = match handler(&method, args) {
        Ok(value) => RpcMessage::Result { id, value },
        Err(message) => RpcMessage::Error { id, message },
    };
    reply.encode().ok()
}
