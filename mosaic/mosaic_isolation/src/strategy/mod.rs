//! Isolation strategies.
//!
//! Each isolation level is one strategy implementing [`IsolationStrategy`].
//! Strategies are stateless towards each other: every strategy keeps its own
//! per-instance state in a map keyed by `InstanceId`.

mod boundary;
mod bridge;
mod document;
mod light;
mod local;
mod none;
mod presenter;
mod remote;
mod scope;
mod strict;

pub use boundary::{CapturedError, ErrorBoundary};
pub use bridge::{render_bridge, storage_namespace, BridgeMessage, BRIDGE_MARKER};
pub use document::{decode_entities, is_script_url, parse_document, ParsedDocument, ScriptEntry};
pub use light::LightStrategy;
pub use local::LocalBus;
pub use none::NoneStrategy;
pub use remote::RemoteStrategy;
pub use scope::ShadowScope;
pub use strict::StrictStrategy;

use async_trait::async_trait;
use mosaic_channel::{ChannelEndpoint, InboundHandler, MessageHub, Subscription};
use mosaic_core::error::{Error, LoadError, Result, RpcError};
use mosaic_core::id::{ContextId, InstanceId};
use mosaic_core::traits::{
    ContentContainer, ContentFetcher, ExecutionContext, ScriptHost, ScriptScope,
};
use mosaic_core::types::{IsolationLevel, ScriptBlock, ScriptSource};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use url::Url;

use crate::host::HostServices;
use crate::manager::ContextPool;

/// Where and what to mount.
#[derive(Clone)]
pub struct MountTarget {
    /// The instance being mounted.
    pub id: InstanceId,

    /// Display name, used to tag logs and errors.
    pub name: String,

    /// Source locator of the sub-application.
    pub source: Url,

    /// Host container the sub-application is attached to.
    pub container: Arc<dyn ContentContainer>,
}

impl fmt::Debug for MountTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountTarget")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("source", &self.source.as_str())
            .finish()
    }
}

/// One isolation level.
///
/// `unmount` detaches an instance but keeps its state so a later `mount`
/// with the same id restores it cheaply. `destroy` releases everything and is
/// idempotent.
#[async_trait]
pub trait IsolationStrategy: Send + Sync {
    /// The level this strategy implements.
    fn level(&self) -> IsolationLevel;

    /// Mount an instance, or restore it if it was unmounted.
    async fn mount(&self, target: &MountTarget) -> Result<()>;

    /// Detach an instance, retaining its state.
    async fn unmount(&self, id: InstanceId) -> Result<()>;

    /// Release every resource of an instance.
    async fn destroy(&self, id: InstanceId) -> Result<()>;

    /// Send a message to a mounted instance.
    fn send(&self, id: InstanceId, message: Value) -> Result<()>;

    /// Listen for messages from an instance.
    fn on_receive(&self, id: InstanceId, handler: InboundHandler) -> Result<Subscription>;

    /// Origin messages from the instance must declare.
    fn trust_origin(&self, id: InstanceId) -> Option<String>;

    /// Context messages from the instance are posted by.
    fn source_context(&self, id: InstanceId) -> Option<ContextId>;

    /// Execution context held by the instance, if any.
    fn held_context(&self, id: InstanceId) -> Option<Arc<dyn ExecutionContext>>;

    /// Whether the instance was unmounted and can be restored.
    fn is_retained(&self, id: InstanceId) -> bool;
}

/// One strategy per isolation level.
#[derive(Clone)]
pub struct StrategySet {
    none: Arc<NoneStrategy>,
    light: Arc<LightStrategy>,
    strict: Arc<StrictStrategy>,
    remote: Arc<RemoteStrategy>,
}

impl StrategySet {
    /// Build every strategy over the same host.
    pub fn new(services: &HostServices, pool: Arc<ContextPool>) -> Self {
        Self {
            none: Arc::new(NoneStrategy::new(services)),
            light: Arc::new(LightStrategy::new(services)),
            strict: Arc::new(StrictStrategy::new(services, pool)),
            remote: Arc::new(RemoteStrategy::new(services)),
        }
    }

    /// The strategy for a level.
    pub fn get(&self, level: IsolationLevel) -> Arc<dyn IsolationStrategy> {
        match level {
            IsolationLevel::None => self.none.clone(),
            IsolationLevel::Light => self.light.clone(),
            IsolationLevel::Strict => self.strict.clone(),
            IsolationLevel::Remote => self.remote.clone(),
        }
    }

    /// Every strategy, weakest first.
    pub fn all(&self) -> Vec<Arc<dyn IsolationStrategy>> {
        IsolationLevel::ALL
            .iter()
            .map(|level| self.get(*level))
            .collect()
    }
}

/// Channel endpoint that posts through a strategy.
pub struct StrategyEndpoint {
    strategy: Arc<dyn IsolationStrategy>,
    id: InstanceId,
}

impl StrategyEndpoint {
    /// Post to `id` through `strategy`.
    pub fn new(strategy: Arc<dyn IsolationStrategy>, id: InstanceId) -> Self {
        Self { strategy, id }
    }
}

impl ChannelEndpoint for StrategyEndpoint {
    fn post(&self, data: Value) -> Result<(), RpcError> {
        self.strategy
            .send(self.id, data)
            .map_err(|e| RpcError::Transport(e.to_string()))
    }
}

/// Subscribe to hub messages posted by one context.
///
/// Messages from other contexts or declaring another origin are filtered out
/// before `handler` runs.
pub(crate) fn subscribe_context(
    hub: &MessageHub,
    context: ContextId,
    expected_origin: String,
    handler: InboundHandler,
) -> Subscription {
    hub.subscribe(move |message| {
        if message.source == context && message.origin == expected_origin {
            handler(message);
        }
    })
}

/// Fetch the code of every script, in document order.
///
/// External scripts that cannot be fetched are reported to `boundary` and
/// skipped.
pub(crate) async fn load_scripts(
    fetcher: &Arc<dyn ContentFetcher>,
    scripts: &[ScriptEntry],
    boundary: &ErrorBoundary,
) -> Vec<ScriptBlock> {
    let mut blocks = Vec::with_capacity(scripts.len());
    for entry in scripts {
        match &entry.source {
            ScriptSource::Inline(code) => blocks.push(ScriptBlock {
                code: code.clone(),
                url: None,
                module: entry.module,
            }),
            ScriptSource::External(url) => match fetcher.fetch(url).await {
                Ok(code) => blocks.push(ScriptBlock {
                    code,
                    url: Some(url.clone()),
                    module: entry.module,
                }),
                Err(e) => boundary.capture(url.as_str(), LoadError::Script(e.to_string())),
            },
        }
    }
    blocks
}

/// Run scripts through the host engine, containing failures in `boundary`.
pub(crate) fn run_scripts(
    host: &Arc<dyn ScriptHost>,
    scripts: &[ScriptBlock],
    scope: ScriptScope<'_>,
    boundary: &ErrorBoundary,
) {
    for (index, script) in scripts.iter().enumerate() {
        let origin = match &script.url {
            Some(url) => url.to_string(),
            None => format!("inline script #{}", index + 1),
        };
        boundary.guard(origin, host.execute(script, scope));
    }
}

/// Fetch and parse a document.
pub(crate) async fn fetch_document(
    fetcher: &Arc<dyn ContentFetcher>,
    source: &Url,
) -> Result<ParsedDocument> {
    let html = fetcher.fetch(source).await.map_err(Error::Load)?;
    Ok(parse_document(&html, source))
}
