//! In-process message bus for `none` and `light` isolation.
//!
//! Sub-applications without their own execution context cannot post
//! messages through the host, so both directions of their channel run over
//! this bus. The sub-application side is given a synthetic `ContextId` so the
//! host side can apply the same source checks as for real contexts.

use dashmap::DashMap;
use mosaic_channel::{InboundHandler, Subscription, LOCAL_ORIGIN};
use mosaic_core::error::{IsolationError, Result};
use mosaic_core::id::{ContextId, InstanceId};
use mosaic_core::types::InboundMessage;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Host,
    Guest,
}

struct Port {
    source: ContextId,
    host: Vec<(u64, InboundHandler)>,
    guest: Vec<(u64, InboundHandler)>,
}

#[derive(Default)]
struct BusInner {
    ports: DashMap<InstanceId, Port>,
    next_id: AtomicU64,
}

/// Per-instance duplex message bus inside the host process.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the port of an instance and return its synthetic source id.
    /// Opening an open port returns the existing id.
    pub fn open(&self, id: InstanceId) -> ContextId {
        self.inner
            .ports
            .entry(id)
            .or_insert_with(|| Port {
                source: ContextId::new(),
                host: Vec::new(),
                guest: Vec::new(),
            })
            .source
    }

    /// Close the port of an instance, dropping every handler.
    pub fn close(&self, id: InstanceId) {
        self.inner.ports.remove(&id);
    }

    /// Whether the port of an instance is open.
    pub fn is_open(&self, id: InstanceId) -> bool {
        self.inner.ports.contains_key(&id)
    }

    /// Synthetic source id of an open port.
    pub fn source(&self, id: InstanceId) -> Option<ContextId> {
        self.inner.ports.get(&id).map(|port| port.source)
    }

    /// Deliver a host message to the sub-application.
    pub fn to_guest(&self, id: InstanceId, data: Value) -> Result<()> {
        self.deliver(id, Side::Guest, data)
    }

    /// Deliver a sub-application message to the host.
    pub fn to_host(&self, id: InstanceId, data: Value) -> Result<()> {
        self.deliver(id, Side::Host, data)
    }

    /// Listen on the host side of a port.
    pub fn on_host(&self, id: InstanceId, handler: InboundHandler) -> Result<Subscription> {
        self.listen(id, Side::Host, handler)
    }

    /// Listen on the sub-application side of a port.
    pub fn on_guest(&self, id: InstanceId, handler: InboundHandler) -> Result<Subscription> {
        self.listen(id, Side::Guest, handler)
    }

    fn deliver(&self, id: InstanceId, side: Side, data: Value) -> Result<()> {
        // Clone the handlers out so none run while the map shard is locked.
        let (message, handlers) = {
            let port = self
                .inner
                .ports
                .get(&id)
                .ok_or(IsolationError::NotMounted(id))?;
            let (source, handlers) = match side {
                Side::Host => (port.source, &port.host),
                Side::Guest => (ContextId::nil(), &port.guest),
            };
            let handlers: Vec<InboundHandler> =
                handlers.iter().map(|(_, handler)| handler.clone()).collect();
            (InboundMessage::new(source, LOCAL_ORIGIN, data), handlers)
        };

        trace!("Local delivery for {} to {} handlers", id, handlers.len());
        for handler in handlers {
            handler(&message);
        }
        Ok(())
    }

    fn listen(&self, id: InstanceId, side: Side, handler: InboundHandler) -> Result<Subscription> {
        let handler_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut port = self
                .inner
                .ports
                .get_mut(&id)
                .ok_or(IsolationError::NotMounted(id))?;
            match side {
                Side::Host => port.host.push((handler_id, handler)),
                Side::Guest => port.guest.push((handler_id, handler)),
            }
        }

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                if let Some(mut port) = inner.ports.get_mut(&id) {
                    let handlers = match side {
                        Side::Host => &mut port.host,
                        Side::Guest => &mut port.guest,
                    };
                    handlers.retain(|(existing, _)| *existing != handler_id);
                }
            }
        }))
    }
}
