//! `none` isolation: content and scripts run directly in the host.
//!
//! The document is parsed into nodes appended to the host container, and its
//! scripts run in the host's own scope. The only protection is the error
//! boundary, which keeps a failing script from taking the host down.

use async_trait::async_trait;
use dashmap::DashMap;
use mosaic_channel::{InboundHandler, Subscription, LOCAL_ORIGIN};
use mosaic_core::error::{IsolationError, Result};
use mosaic_core::id::{ContextId, InstanceId};
use mosaic_core::traits::{
    ContentContainer, ContentFetcher, ExecutionContext, ScriptHost, ScriptScope,
};
use mosaic_core::types::{validate_source, ContentNode, IsolationLevel};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{
    fetch_document, load_scripts, run_scripts, CapturedError, ErrorBoundary, IsolationStrategy,
    LocalBus, MountTarget,
};
use crate::host::HostServices;

struct NoneInstance {
    container: Arc<dyn ContentContainer>,
    nodes: Vec<ContentNode>,
    boundary: Arc<ErrorBoundary>,
    retained: bool,
}

/// Runs sub-applications without isolation.
pub struct NoneStrategy {
    fetcher: Arc<dyn ContentFetcher>,
    scripts: Arc<dyn ScriptHost>,
    bus: LocalBus,
    instances: DashMap<InstanceId, NoneInstance>,
}

impl NoneStrategy {
    /// Create the strategy over a host.
    pub fn new(services: &HostServices) -> Self {
        Self {
            fetcher: services.fetcher.clone(),
            scripts: services.scripts.clone(),
            bus: services.local_bus.clone(),
            instances: DashMap::new(),
        }
    }

    /// Errors captured for an instance.
    pub fn errors(&self, id: InstanceId) -> Vec<CapturedError> {
        self.instances
            .get(&id)
            .map(|instance| instance.boundary.errors())
            .unwrap_or_default()
    }

    /// Re-append retained nodes into a new container.
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
        for node in nodes {
            target.container.append(node);
        }
        debug!("Restored instance {} ({})", target.name, target.id);
        true
    }
}

#[async_trait]
impl IsolationStrategy for NoneStrategy {
    fn level(&self) -> IsolationLevel {
        IsolationLevel::None
    }

    async fn mount(&self, target: &MountTarget) -> Result<()> {
        validate_source(&target.source)?;
        if self.restore(target) {
            return Ok(());
        }

        let document = fetch_document(&self.fetcher, &target.source).await?;
        let boundary = Arc::new(ErrorBoundary::new(target.name.clone()));
        let scripts = load_scripts(&self.fetcher, &document.scripts, &boundary).await;

        for node in &document.nodes {
            target.container.append(node.clone());
        }
        self.bus.open(target.id);
        self.instances.insert(
            target.id,
            NoneInstance {
                container: target.container.clone(),
                nodes: document.nodes,
                boundary: boundary.clone(),
                retained: false,
            },
        );

        run_scripts(&self.scripts, &scripts, ScriptScope::Host, &boundary);
        debug!(
            "Mounted instance {} ({}) without isolation, {} scripts",
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
    use crate::testing::{greeter, FakeHost};
    use mosaic_core::error::{Error, LoadError};
    use mosaic_core::testing::FakeContainer;
    use mosaic_core::types::InboundMessage;
    use parking_lot::Mutex;
    use serde_json::json;
    use url::Url;

    const PAGE: &str = "https://apps.example.com/profile/index.html";

    fn target(id: InstanceId, container: &Arc<FakeContainer>) -> MountTarget {
        MountTarget {
            id,
            name: "profile".to_string(),
            source: Url::parse(PAGE).unwrap(),
            container: container.clone(),
        }
    }

    fn host() -> FakeHost {
        let host = FakeHost::new();
        host.fetcher.serve(
            PAGE,
            r#"<h1 onclick="steal()">Profile</h1>
               <script>set profileLoaded true</script>
               <script src="app.js"></script>
               <script>throw bad inline</script>
               <script src="missing.js"></script>"#,
        );
        host.fetcher
            .serve("https://apps.example.com/profile/app.js", "timer 100");
        host
    }

    #[tokio::test]
    async fn test_mount_runs_scripts_in_host_scope() {
        let host = host();
        let strategy = NoneStrategy::new(&host.services);
        let container = FakeContainer::new();
        let id = InstanceId::new();

        strategy.mount(&target(id, &container)).await.unwrap();

        let nodes = container.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].tag(), Some("h1"));
        assert_eq!(nodes[0].attribute("onclick"), None);

        assert_eq!(host.globals.value("profileLoaded"), Some(json!(true)));
        assert_eq!(host.timers.active(), 1);
        assert!(host.scripts.executed().iter().all(|(_, scoped)| !scoped));

        let errors = strategy.errors(id);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].origin, "https://apps.example.com/profile/missing.js");
        assert_eq!(errors[1].origin, "inline script #3");
        assert_eq!(errors[1].message, "bad inline");
    }

    #[tokio::test]
    async fn test_unreachable_source_fails_mount() {
        let host = FakeHost::new();
        let strategy = NoneStrategy::new(&host.services);
        let container = FakeContainer::new();
        let id = InstanceId::new();

        assert!(strategy.mount(&target(id, &container)).await.is_err());
        assert!(container.nodes().is_empty());
        assert!(strategy.trust_origin(id).is_none());
    }

    #[tokio::test]
    async fn test_rejects_script_source() {
        let host = host();
        let strategy = NoneStrategy::new(&host.services);
        let container = FakeContainer::new();
        let id = InstanceId::new();
        let mut target = target(id, &container);

        for source in ["javascript:alert(document.cookie)", "data:text/html,<script>1</script>"] {
            target.source = Url::parse(source).unwrap();
            let err = strategy.mount(&target).await.unwrap_err();
            assert!(matches!(err, Error::Load(LoadError::InvalidSource(_))));
        }
        assert!(host.fetcher.fetches().is_empty());
        assert!(host.scripts.executed().is_empty());
        assert!(container.nodes().is_empty());
        assert!(strategy.trust_origin(id).is_none());
    }

    #[tokio::test]
    async fn test_unmount_then_restore_skips_fetch() {
        let host = host();
        let strategy = NoneStrategy::new(&host.services);
        let first = FakeContainer::new();
        let id = InstanceId::new();

        strategy.mount(&target(id, &first)).await.unwrap();
        let fetches = host.fetcher.fetches().len();

        strategy.unmount(id).await.unwrap();
        assert!(strategy.is_retained(id));
        assert!(first.nodes().is_empty());

        let second = FakeContainer::new();
        strategy.mount(&target(id, &second)).await.unwrap();
        assert!(!strategy.is_retained(id));
        assert_eq!(second.nodes().len(), 1);
        assert_eq!(host.fetcher.fetches().len(), fetches);
        assert_eq!(host.scripts.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_messages_travel_over_local_bus() {
        let host = host();
        let strategy = NoneStrategy::new(&host.services);
        let container = FakeContainer::new();
        let id = InstanceId::new();
        strategy.mount(&target(id, &container)).await.unwrap();

        assert_eq!(strategy.trust_origin(id).as_deref(), Some(LOCAL_ORIGIN));
        let source = strategy.source_context(id).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let received = received.clone();
            strategy
                .on_receive(
                    id,
                    Arc::new(move |m: &InboundMessage| received.lock().push(m.clone())),
                )
                .unwrap()
        };
        let _guest = host.respond_on_bus(id, greeter()).unwrap();

        host.services.local_bus.to_host(id, json!({ "hello": 1 })).unwrap();
        strategy.send(id, json!({ "unrelated": true })).unwrap();

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].source, source);
        assert_eq!(received[0].data, json!({ "hello": 1 }));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let host = host();
        let strategy = NoneStrategy::new(&host.services);
        let container = FakeContainer::new();
        let id = InstanceId::new();
        strategy.mount(&target(id, &container)).await.unwrap();

        strategy.destroy(id).await.unwrap();
        strategy.destroy(id).await.unwrap();

        assert!(container.nodes().is_empty());
        assert!(strategy.send(id, json!(1)).is_err());
        assert!(!strategy.is_retained(id));
    }
}
