//! The host environment as seen by the isolation strategies.

use mosaic_channel::MessageHub;
use mosaic_core::traits::{
    ContentFetcher, ContextFactory, GlobalScope, OverlayHooks, ScriptHost, TimerHost,
};
use std::fmt;
use std::sync::Arc;

use crate::strategy::LocalBus;

/// Everything Mosaic needs from its host.
#[derive(Clone)]
pub struct HostServices {
    /// Creates isolated execution contexts.
    pub contexts: Arc<dyn ContextFactory>,

    /// Fetches documents and external scripts.
    pub fetcher: Arc<dyn ContentFetcher>,

    /// Runs scripts of `none` and `light` instances.
    pub scripts: Arc<dyn ScriptHost>,

    /// The host's global object.
    pub globals: Arc<dyn GlobalScope>,

    /// The host's timer facility.
    pub timers: Arc<dyn TimerHost>,

    /// Notified when a context is promoted for an overlay.
    pub overlay: Option<Arc<dyn OverlayHooks>>,

    /// Receives every message posted by an execution context.
    pub hub: MessageHub,

    /// Carries messages of instances without an execution context.
    pub local_bus: LocalBus,

    /// Trust origin of the host itself.
    pub host_origin: String,
}

impl HostServices {
    /// Bundle host services with a fresh hub and local bus.
    pub fn new(
        contexts: Arc<dyn ContextFactory>,
        fetcher: Arc<dyn ContentFetcher>,
        scripts: Arc<dyn ScriptHost>,
        globals: Arc<dyn GlobalScope>,
        timers: Arc<dyn TimerHost>,
        host_origin: impl Into<String>,
    ) -> Self {
        Self {
            contexts,
            fetcher,
            scripts,
            globals,
            timers,
            overlay: None,
            hub: MessageHub::new(),
            local_bus: LocalBus::new(),
            host_origin: host_origin.into(),
        }
    }

    /// Install overlay hooks.
    pub fn with_overlay(mut self, overlay: Arc<dyn OverlayHooks>) -> Self {
        self.overlay = Some(overlay);
        self
    }
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices")
            .field("host_origin", &self.host_origin)
            .field("overlay", &self.overlay.is_some())
            .field("hub", &self.hub)
            .finish()
    }
}
