//! `remote` isolation for untrusted third parties.
//!
//! Every instance gets a fresh context that is never pooled. The sandbox
//! omits same-origin, so the context runs with the opaque origin and nothing
//! is injected into it. Outbound messages cannot name an opaque origin and
//! target any origin; inbound messages are accepted only from the bound
//! context declaring the opaque origin.

use async_trait::async_trait;
use dashmap::DashMap;
use mosaic_channel::{InboundHandler, MessageHub, Subscription, ANY_ORIGIN, OPAQUE_ORIGIN};
use mosaic_core::error::{Error, IsolationError, Result};
use mosaic_core::id::{ContextId, InstanceId};
use mosaic_core::traits::{ContentContainer, ContextFactory, ExecutionContext};
use mosaic_core::types::{validate_source, InboundMessage, IsolationLevel, SandboxPolicy};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

use super::presenter::Presenter;
use super::{subscribe_context, IsolationStrategy, MountTarget};
use crate::host::HostServices;

struct RemoteInstance {
    context: Arc<dyn ExecutionContext>,
    container: Arc<dyn ContentContainer>,
    presenter: Arc<Presenter>,
    retained: bool,
    _resize: Subscription,
}

/// Runs sub-applications in dedicated opaque-origin contexts.
pub struct RemoteStrategy {
    contexts: Arc<dyn ContextFactory>,
    hub: MessageHub,
    instances: DashMap<InstanceId, RemoteInstance>,
}

impl RemoteStrategy {
    /// Create the strategy over a host.
    pub fn new(services: &HostServices) -> Self {
        Self {
            contexts: services.contexts.clone(),
            hub: services.hub.clone(),
            instances: DashMap::new(),
        }
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
        debug!("Re-attached remote context of {} ({})", target.name, target.id);
        true
    }
}

#[async_trait]
impl IsolationStrategy for RemoteStrategy {
    fn level(&self) -> IsolationLevel {
        IsolationLevel::Remote
    }

    async fn mount(&self, target: &MountTarget) -> Result<()> {
        validate_source(&target.source)?;
        if self.restore(target) {
            return Ok(());
        }

        let context = self.contexts.create_context()?;
        context.apply_sandbox(&SandboxPolicy::opaque());

        let presenter = Arc::new(Presenter::new(target.id, context.clone(), None, false));
        presenter.attach(&target.container);

        // Without a bridge, only the sub-application's own resize messages
        // size the container.
        let resize = {
            let presenter = presenter.clone();
            subscribe_context(
                &self.hub,
                context.id(),
                OPAQUE_ORIGIN.to_string(),
                Arc::new(move |message: &InboundMessage| presenter.handle(message)),
            )
        };

        self.instances.insert(
            target.id,
            RemoteInstance {
                context: context.clone(),
                container: target.container.clone(),
                presenter,
                retained: false,
                _resize: resize,
            },
        );

        if let Err(e) = context.load(&target.source).await {
            self.destroy(target.id).await?;
            return Err(Error::Load(e));
        }

        debug!(
            "Mounted instance {} ({}) in dedicated context {}",
            target.name,
            target.id,
            context.id()
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
        instance.context.destroy();
        debug!("Destroyed instance {} and context {}", id, instance.context.id());
        Ok(())
    }

    fn send(&self, id: InstanceId, message: Value) -> Result<()> {
        let context = self
            .instances
            .get(&id)
            .map(|instance| instance.context.clone())
            .ok_or(IsolationError::NotMounted(id))?;
        trace!("Posting to remote instance {}", id);
        context.post_message(message, ANY_ORIGIN)
    }

    fn on_receive(&self, id: InstanceId, handler: InboundHandler) -> Result<Subscription> {
        let source = self
            .source_context(id)
            .ok_or(IsolationError::NotMounted(id))?;
        Ok(subscribe_context(
            &self.hub,
            source,
            OPAQUE_ORIGIN.to_string(),
            handler,
        ))
    }

    fn trust_origin(&self, id: InstanceId) -> Option<String> {
        self.instances
            .contains_key(&id)
            .then(|| OPAQUE_ORIGIN.to_string())
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
