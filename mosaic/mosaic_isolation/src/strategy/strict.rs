//! `strict` isolation: a pooled execution context per instance.
//!
//! The context comes from the [`ContextPool`], is sandboxed with the
//! same-origin policy and wrapped in a content boundary. After the source
//! loads, the bridge script is injected. Every message in both directions is
//! bound to the exact origin of the source.

use async_trait::async_trait;
use dashmap::DashMap;
use mosaic_channel::{origin_of, InboundHandler, MessageHub, Subscription};
use mosaic_core::error::{Error, IsolationError, Result};
use mosaic_core::id::{ContextId, InstanceId};
use mosaic_core::traits::{ContentContainer, ExecutionContext, OverlayHooks};
use mosaic_core::types::{validate_source, InboundMessage, IsolationLevel, SandboxPolicy};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

use super::presenter::Presenter;
use super::{render_bridge, storage_namespace, subscribe_context, IsolationStrategy, MountTarget};
use crate::host::HostServices;
use crate::manager::ContextPool;

struct StrictInstance {
    context: Arc<dyn ExecutionContext>,
    container: Arc<dyn ContentContainer>,
    origin: String,
    presenter: Arc<Presenter>,
    retained: bool,
    _bridge: Subscription,
}

/// Runs sub-applications in pooled, same-origin sandboxed contexts.
pub struct StrictStrategy {
    pool: Arc<ContextPool>,
    hub: MessageHub,
    overlay: Option<Arc<dyn OverlayHooks>>,
    host_origin: String,
    instances: DashMap<InstanceId, StrictInstance>,
}

impl StrictStrategy {
    /// Create the strategy over a host and a context pool.
    pub fn new(services: &HostServices, pool: Arc<ContextPool>) -> Self {
        Self {
            pool,
            hub: services.hub.clone(),
            overlay: services.overlay.clone(),
            host_origin: services.host_origin.clone(),
            instances: DashMap::new(),
        }
    }

    /// Whether an instance is promoted to the full viewport.
    pub fn is_promoted(&self, id: InstanceId) -> bool {
        self.instances
            .get(&id)
            .map(|instance| instance.presenter.is_promoted())
            .unwrap_or(false)
    }

    fn restore(&self, target: &MountTarget) -> bool {
        let (presenter, previous) = {
            let Some(mut instance) = self.instances.get_mut(&target.id) else {
                return false;
            };
            let previous = (!instance.retained).then(|| instance.container.clone());
            instance.container = target.container.clone();
            instance.retained = false;
            (instance.presenter.clone(), previous)
        };

        if let Some(previous) = previous {
            presenter.detach();
            previous.clear();
        }
        presenter.attach(&target.container);
        debug!("Re-attached retained context of {} ({})", target.name, target.id);
        true
    }

    async fn load(&self, target: &MountTarget, context: &Arc<dyn ExecutionContext>) -> Result<()> {
        context.load(&target.source).await.map_err(Error::Load)?;
        let namespace = storage_namespace(&target.name, target.id);
        let bridge = render_bridge(&namespace, &self.host_origin);
        context
            .inject_script(&bridge)
            .map_err(|e| IsolationError::BridgeInjection(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl IsolationStrategy for StrictStrategy {
    fn level(&self) -> IsolationLevel {
        IsolationLevel::Strict
    }

    async fn mount(&self, target: &MountTarget) -> Result<()> {
        validate_source(&target.source)?;
        if self.restore(target) {
            return Ok(());
        }

        let context = self.pool.acquire(target.id)?;
        context.apply_sandbox(&SandboxPolicy::same_origin());

        let origin = origin_of(&target.source);
        let presenter = Arc::new(Presenter::new(
            target.id,
            context.clone(),
            self.overlay.clone(),
            true,
        ));
        presenter.attach(&target.container);

        let bridge = {
            let presenter = presenter.clone();
            subscribe_context(
                &self.hub,
                context.id(),
                origin.clone(),
                Arc::new(move |message: &InboundMessage| presenter.handle(message)),
            )
        };

        // Registered before loading so an abandoned mount can be destroyed.
        self.instances.insert(
            target.id,
            StrictInstance {
                context: context.clone(),
                container: target.container.clone(),
                origin: origin.clone(),
                presenter,
                retained: false,
                _bridge: bridge,
            },
        );

        if let Err(e) = self.load(target, &context).await {
            self.destroy(target.id).await?;
            return Err(e);
        }

        debug!(
            "Mounted instance {} ({}) in context {} for {}",
            target.name,
            target.id,
            context.id(),
            origin
        );
        Ok(())
    }

    async fn unmount(&self, id: InstanceId) -> Result<()> {
        let (presenter, container) = {
            let mut instance = self
                .instances
                .get_mut(&id)
                .ok_or(IsolationError::NotMounted(id))?;
            instance.retained = true;
            (instance.presenter.clone(), instance.container.clone())
        };
        presenter.detach();
        container.clear();
        Ok(())
    }

    async fn destroy(&self, id: InstanceId) -> Result<()> {
        let Some((_, instance)) = self.instances.remove(&id) else {
            return Ok(());
        };

        instance.presenter.detach();
        if !instance.retained {
            instance.container.clear();
        }
        self.pool.release(&instance.context);
        debug!("Destroyed instance {}, context {} released", id, instance.context.id());
        Ok(())
    }

    fn send(&self, id: InstanceId, message: Value) -> Result<()> {
        let (context, origin) = self
            .instances
            .get(&id)
            .map(|instance| (instance.context.clone(), instance.origin.clone()))
            .ok_or(IsolationError::NotMounted(id))?;
        trace!("Posting to {} at {}", id, origin);
        context.post_message(message, &origin)
    }

    fn on_receive(&self, id: InstanceId, handler: InboundHandler) -> Result<Subscription> {
        let (source, origin) = self
            .instances
            .get(&id)
            .map(|instance| (instance.context.id(), instance.origin.clone()))
            .ok_or(IsolationError::NotMounted(id))?;
        Ok(subscribe_context(&self.hub, source, origin, handler))
    }

    fn trust_origin(&self, id: InstanceId) -> Option<String> {
        self.instances.get(&id).map(|instance| instance.origin.clone())
    }

    fn source_context(&self, id: InstanceId) -> Option<ContextId> {
        self.instances.get(&id).map(|instance| instance.context.id())
    }

    fn held_context(&self, id: InstanceId) -> Option<Arc<dyn ExecutionContext>> {
        self.instances.get(&id).map(|instance| instance.context.clone())
    }

    fn is_retained(&self, id: InstanceId) -> bool {
        self.instances
            .get(&id)
            .map(|instance| instance.retained)
            .unwrap_or(false)
    }
}
