//! Presentation of a context-backed instance.
//!
//! Tracks which content boundary currently shows the context, applies the
//! height reported by the sub-application, and promotes the context to the
//! full viewport while an overlay is open.

use mosaic_core::id::InstanceId;
use mosaic_core::traits::{ContentContainer, ExecutionContext, OverlayHooks};
use mosaic_core::types::{InboundMessage, Presentation};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::BridgeMessage;

pub(crate) struct Presenter {
    id: InstanceId,
    context: Arc<dyn ExecutionContext>,
    boundary: Mutex<Option<Arc<dyn ContentContainer>>>,
    height: Mutex<Option<u32>>,
    promoted: AtomicBool,
    overlay: Option<Arc<dyn OverlayHooks>>,
    allow_promotion: bool,
}

impl Presenter {
    pub(crate) fn new(
        id: InstanceId,
        context: Arc<dyn ExecutionContext>,
        overlay: Option<Arc<dyn OverlayHooks>>,
        allow_promotion: bool,
    ) -> Self {
        Self {
            id,
            context,
            boundary: Mutex::new(None),
            height: Mutex::new(None),
            promoted: AtomicBool::new(false),
            overlay,
            allow_promotion,
        }
    }

    /// Show the context inside `container`, wrapped in a new boundary.
    pub(crate) fn attach(&self, container: &Arc<dyn ContentContainer>) {
        let boundary = container.attach_boundary();
        boundary.attach_context(&self.context);
        if let Some(height) = *self.height.lock() {
            boundary.set_height(height);
        }
        *self.boundary.lock() = Some(boundary);
    }

    /// Take the context out of its boundary.
    pub(crate) fn detach(&self) {
        self.demote();
        let boundary = self.boundary.lock().take();
        if let Some(boundary) = boundary {
            boundary.detach_context(self.context.id());
        }
    }

    /// Apply a bridge message posted by the context.
    pub(crate) fn handle(&self, message: &InboundMessage) {
        match BridgeMessage::decode(&message.data) {
            Some(BridgeMessage::Resize { height }) => {
                trace!("Instance {} reported height {}", self.id, height);
                *self.height.lock() = Some(height);
                let boundary = self.boundary.lock().clone();
                if let Some(boundary) = boundary {
                    boundary.set_height(height);
                }
            }
            Some(BridgeMessage::Overlay { open }) if self.allow_promotion => {
                if open {
                    self.promote();
                } else {
                    self.demote();
                }
            }
            _ => {}
        }
    }

    fn promote(&self) {
        if self.promoted.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Promoting instance {} to the full viewport", self.id);
        self.context.set_presentation(Presentation::FullViewport);
        if let Some(overlay) = &self.overlay {
            overlay.promotion_entered(self.id);
        }
    }

    pub(crate) fn demote(&self) {
        if !self.promoted.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("Returning instance {} inline", self.id);
        self.context.set_presentation(Presentation::Inline);
        if let Some(overlay) = &self.overlay {
            overlay.promotion_exited(self.id);
        }
    }

    pub(crate) fn is_promoted(&self) -> bool {
        self.promoted.load(Ordering::SeqCst)
    }
}
