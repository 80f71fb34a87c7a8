//! Inbound message dispatch.
//!
//! The host hands every message posted by an execution context to
//! [`MessageHub::deliver`]. Subscribers see every message and filter by
//! source and origin themselves.

use mosaic_core::types::InboundMessage;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Callback invoked for an inbound message.
pub type InboundHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Guard returned by every `subscribe`-style call.
///
/// Dropping the guard unsubscribes. Use [`Subscription::detach`] to keep the
/// subscription alive for as long as its source lives.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Create a subscription that runs `cancel` when dropped.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Forget the guard without unsubscribing.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Default)]
struct HubInner {
    handlers: Mutex<Vec<(u64, InboundHandler)>>,
    next_id: AtomicU64,
}

/// Fan-out point for messages arriving from execution contexts.
#[derive(Clone, Default)]
pub struct MessageHub {
    inner: Arc<HubInner>,
}

impl MessageHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every inbound message.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, Arc::new(handler)));

        let weak: Weak<HubInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handlers.lock().retain(|(handler_id, _)| *handler_id != id);
            }
        })
    }

    /// Deliver a message to every subscriber, returning how many saw it.
    ///
    /// Handlers run outside the hub's lock, so they may subscribe or
    /// unsubscribe while being invoked.
    pub fn deliver(&self, message: InboundMessage) -> usize {
        let handlers: Vec<InboundHandler> = self
            .inner
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        trace!(
            "Delivering message from {} ({}) to {} subscribers",
            message.source,
            message.origin,
            handlers.len()
        );

        for handler in &handlers {
            handler(&message);
        }
        handlers.len()
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }
}

impl fmt::Debug for MessageHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHub")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_core::id::ContextId;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_deliver_reaches_every_subscriber() {
        let hub = MessageHub::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let s1 = {
            let seen = seen.clone();
            hub.subscribe(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };
        let s2 = {
            let seen = seen.clone();
            hub.subscribe(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };

        let delivered = hub.deliver(InboundMessage::new(ContextId::new(), "null", json!({})));
        assert_eq!(delivered, 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        drop(s1);
        s2.unsubscribe();
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.deliver(InboundMessage::new(ContextId::new(), "null", json!({}))), 0);
    }

    #[test]
    fn test_detached_subscription_stays_active() {
        let hub = MessageHub::new();
        hub.subscribe(|_| {}).detach();
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_handler_may_unsubscribe_during_delivery() {
        let hub = MessageHub::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let subscription = {
            let slot = slot.clone();
            hub.subscribe(move |_| {
                // Dropping our own guard re-enters the hub.
                slot.lock().take();
            })
        };
        *slot.lock() = Some(subscription);

        hub.deliver(InboundMessage::new(ContextId::new(), "null", json!(1)));
        assert_eq!(hub.subscriber_count(), 0);
    }
}
