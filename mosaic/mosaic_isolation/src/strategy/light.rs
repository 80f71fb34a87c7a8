//! `light` isolation: a content boundary plus a shadow global scope.
//!
//! Markup lives in a nested content boundary of the host container, so its
//! styles cannot leak out. Scripts still run in the host's engine but against
//! a [`ShadowScope`], keeping their global writes, title, cookies and timers
//! private to the instance.

use async_trait::async_trait;
use dashmap::DashMap;
use mosaic_channel::{InboundHandler, Subscription, LOCAL_ORIGIN};
use mosaic_core::error::{IsolationError, Result};
use mosaic_core::id::{ContextId, InstanceId};
use mosaic_core::traits::{
    ContentContainer, ContentFetcher, ExecutionContext, GlobalScope, ScopeAccess, ScriptHost,
    ScriptScope, TimerHost,
};
use mosaic_core::types::{validate_source, ContentNode, IsolationLevel};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{
    fetch_document, load_scripts, run_scripts, CapturedError, ErrorBoundary, IsolationStrategy,
    LocalBus, MountTarget, ShadowScope,
};
use crate::host::HostServices;

struct LightInstance {
    container: Arc<dyn ContentContainer>,
    nodes: Vec<ContentNode>,
    scope: Arc<ShadowScope>,
    errors: Arc<ErrorBoundary>,
    retained: bool,
}

/// Runs sub-applications behind a content boundary and a shadow scope.
pub struct LightStrategy {
    fetcher: Arc<dyn ContentFetcher>,
    scripts: Arc<dyn ScriptHost>,
    globals: Arc<dyn GlobalScope>,
    timers: Arc<dyn TimerHost>,
    bus: LocalBus,
    instances: DashMap<InstanceId, LightInstance>,
}

impl LightStrategy {
    /// Create the strategy over a host.
    pub fn new(services: &HostServices) -> Self {
        Self {
            fetcher: services.fetcher.clone(),
            scripts: services.scripts.clone(),
            globals: services.globals.clone(),
            timers: services.timers.clone(),
            bus: services.local_bus.clone(),
            instances: DashMap::new(),
        }
    }

    /// The shadow scope of an instance.
    pub fn scope(&self, id: InstanceId) -> Option<Arc<ShadowScope>> {
        self.instances.get(&id).map(|instance| instance.scope.clone())
    }

    /// Errors captured for an instance.
    pub fn errors(&self, id: InstanceId) -> Vec<CapturedError> {
        self.instances
            .get(&id)
            .map(|instance| instance.errors.errors())
            .unwrap_or_default()
    }

    fn restore(&self, target: &MountTarget) -> bool {
        let (previous, nodes) = {
            let Some(mut instance) = self.instances.get_mut(&target.id) else {
                return false;
            };
            let previous = (!instance.retained).then(|| instance.container.clone());
            instance.container = target.container.clone();
            instance.retained = false;
            (previous, instance.nodes.clone())
        };

        if let Some(previous) = previous {
            previous.clear();
        }
        let boundary = target.container.attach_boundary();
        for node in nodes {
            boundary.append(node);
        }
        debug!("Restored instance {} ({})", target.name, target.id);
        true
    }
}

#[async_trait]
impl IsolationStrategy for LightStrategy {
    fn level(&self) -> IsolationLevel {
        IsolationLevel::Light
    }

    async fn mount(&self, target: &MountTarget) -> Result<()> {
        validate_source(&target.source)?;
        if self.restore(target) {
            return Ok(());
        }

        let document = fetch_document(&self.fetcher, &target.source).await?;
        let errors = Arc::new(ErrorBoundary::new(target.name.clone()));
        let scripts = load_scripts(&self.fetcher, &document.scripts, &errors).await;

        let boundary = target.container.attach_boundary();
        for node in &document.nodes {
            boundary.append(node.clone());
        }

        let scope = Arc::new(ShadowScope::new(self.globals.clone(), self.timers.clone()));
        if let Some(title) = &document.title {
            scope.set("document.title", Value::String(title.clone()));
        }

        self.bus.open(target.id);
        self.instances.insert(
            target.id,
            LightInstance {
                container: target.container.clone(),
                nodes: document.nodes,
                scope: scope.clone(),
                errors: errors.clone(),
                retained: false,
            },
        );

        run_scripts(
            &self.scripts,
            &scripts,
            ScriptScope::Scoped(scope.as_ref()),
            &errors,
        );
        debug!(
            "Mounted instance {} ({}) with light isolation, {} scripts",
            target.name,
            target.id,
            scripts.len()
        );
        Ok(())
    }

    async fn unmount(&self, id: InstanceId) -> Result<()> {
        let container = {
            let mut instance = self
                .instances
                .get_mut(&id)
                .ok_or(IsolationError::NotMounted(id))?;
            instance.retained = true;
            instance.container.clone()
        };
        container.clear();
        Ok(())
    }

    async fn destroy(&self, id: InstanceId) -> Result<()> {
        if let Some((_, instance)) = self.instances.remove(&id) {
            instance.scope.dispose();
            if !instance.retained {
                instance.container.clear();
            }
            debug!("Destroyed instance {}", id);
        }
        self.bus.close(id);
        Ok(())
    }

    fn send(&self, id: InstanceId, message: Value) -> Result<()> {
        self.bus.to_guest(id, message)
    }

    fn on_receive(&self, id: InstanceId, handler: InboundHandler) -> Result<Subscription> {
        self.bus.on_host(id, handler)
    }

    fn trust_origin(&self, id: InstanceId) -> Option<String> {
        self.bus.is_open(id).then(|| LOCAL_ORIGIN.to_string())
    }

    fn source_context(&self, id: InstanceId) -> Option<ContextId> {
        self.bus.source(id)
    }

    fn held_context(&self, _id: InstanceId) -> Option<Arc<dyn ExecutionContext>> {
        None
    }

    fn is_retained(&self, id: InstanceId) -> bool {
        self.instances
            .get(&id)
            .map(|instance| instance.retained)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use mosaic_core::error::{Error, LoadError};
    use mosaic_core::testing::FakeContainer;
    use serde_json::json;
    use url::Url;

    const PAGE: &str = "https://apps.example.com/chat/index.html";

    fn target(id: InstanceId, container: &Arc<FakeContainer>) -> MountTarget {
        MountTarget {
            id,
            name: "chat".to_string(),
            source: Url::parse(PAGE).unwrap(),
            container: container.clone(),
        }
    }

    fn host() -> FakeHost {
        let host = FakeHost::new();
        host.fetcher.serve(
            PAGE,
            "<title>Chat</title><style>p { color: red }</style><p>hi</p>\
             <script>set chatReady true\nset document.cookie \"sid=1; Path=/\"\ntimer 50\nframe</script>",
        );
        host
    }

    #[tokio::test]
    async fn test_mount_uses_boundary_and_shadow_scope() {
        let host = host();
        let strategy = LightStrategy::new(&host.services);
        let container = FakeContainer::new();
        let id = InstanceId::new();

        strategy.mount(&target(id, &container)).await.unwrap();

        assert!(container.nodes().is_empty());
        let boundaries = container.boundaries();
        assert_eq!(boundaries.len(), 1);
        assert_eq!(boundaries[0].nodes().len(), 2);
        assert_eq!(boundaries[0].nodes()[0], ContentNode::Style("p { color: red }".into()));

        let scope = strategy.scope(id).unwrap();
        assert_eq!(scope.local("chatReady"), Some(json!(true)));
        assert_eq!(scope.title(), "Chat");
        assert_eq!(scope.cookie(), "sid=1");
        assert_eq!(host.globals.value("chatReady"), None);
        assert!(host.scripts.executed().iter().all(|(_, scoped)| *scoped));
        assert_eq!(host.timers.active(), 2);
    }

    #[tokio::test]
    async fn test_rejects_script_source() {
        let host = host();
        let strategy = LightStrategy::new(&host.services);
        let container = FakeContainer::new();
        let id = InstanceId::new();
        let mut target = target(id, &container);

        for source in ["javascript:alert(document.cookie)", "data:text/html,<script>1</script>"] {
            target.source = Url::parse(source).unwrap();
            let err = strategy.mount(&target).await.unwrap_err();
            assert!(matches!(err, Error::Load(LoadError::InvalidSource(_))));
        }
        assert!(host.fetcher.fetches().is_empty());
        assert!(container.boundaries().is_empty());
        assert!(strategy.scope(id).is_none());
    }

    #[tokio::test]
    async fn test_destroy_cancels_timers() {
        let host = host();
        let strategy = LightStrategy::new(&host.services);
        let container = FakeContainer::new();
        let id = InstanceId::new();
        strategy.mount(&target(id, &container)).await.unwrap();

        strategy.destroy(id).await.unwrap();
        assert_eq!(host.timers.active(), 0);
        assert!(container.boundaries().is_empty());
        assert!(strategy.scope(id).is_none());
        strategy.destroy(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_keeps_scope_and_timers() {
        let host = host();
        let strategy = LightStrategy::new(&host.services);
        let id = InstanceId::new();
        let first = FakeContainer::new();
        strategy.mount(&target(id, &first)).await.unwrap();
        let scope = strategy.scope(id).unwrap();

        strategy.unmount(id).await.unwrap();
        assert!(first.boundaries().is_empty());
        assert_eq!(host.timers.active(), 2);

        let second = FakeContainer::new();
        strategy.mount(&target(id, &second)).await.unwrap();
        assert!(Arc::ptr_eq(&scope, &strategy.scope(id).unwrap()));
        assert_eq!(second.boundaries()[0].nodes().len(), 2);
        assert_eq!(host.scripts.executed().len(), 1);
        assert_eq!(host.fetcher.fetches().len(), 1);
    }

    #[tokio::test]
    async fn test_script_failure_is_contained() {
        let host = FakeHost::new();
        host.fetcher
            .serve(PAGE, "<p>x</p><script>throw kaboom</script><script>set after 1</script>");
        let strategy = LightStrategy::new(&host.services);
        let container = FakeContainer::new();
        let id = InstanceId::new();

        strategy.mount(&target(id, &container)).await.unwrap();

        let errors = strategy.errors(id);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "kaboom");
        assert_eq!(strategy.scope(id).unwrap().local("after"), Some(json!(1)));
    }
}
