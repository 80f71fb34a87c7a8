//! Mosaic Runtime - Lifecycle runtime for embedded sub-applications
//!
//! This crate ties the isolation strategies, the context pool and the
//! keep-alive registry together behind an explicitly constructed
//! [`Framework`], and drives every embedded instance through an
//! [`InstanceController`] state machine.

pub mod controller;
pub mod events;
pub mod external;
pub mod instance;

pub use controller::{ControllerTimeouts, InstanceController, PROPS_EVENT};
pub use events::LifecycleEvent;
pub use instance::{InstanceSnapshot, InstanceSpec};

use anyhow::Context as _;
use dashmap::DashMap;
use mosaic_core::config::FrameworkConfig;
use mosaic_core::error::{IsolationError, Result};
use mosaic_core::id::InstanceId;
use mosaic_core::types::validate_source;
use mosaic_isolation::{
    ContextPool, HostServices, KeepAliveEntry, KeepAliveRegistry, PoolStats, StrategySet,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

type InstanceIndex = Arc<DashMap<InstanceId, Weak<InstanceController>>>;

/// Context object owning every shared Mosaic resource.
///
/// There is no global instance: construct one with [`Framework::init`], pass
/// it where instances are created and call [`Framework::dispose`] when done.
pub struct Framework {
    config: FrameworkConfig,
    host: HostServices,
    pool: Arc<ContextPool>,
    keep_alive: Arc<KeepAliveRegistry>,
    strategies: StrategySet,
    instances: InstanceIndex,
    reaper: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Framework {
    /// Initialize a framework.
    ///
    /// Must be called from within a tokio runtime; the eviction reaper and
    /// every instance worker are spawned on it.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated before anything is created.
    /// * `host` - The host environment.
    pub fn init(config: FrameworkConfig, host: HostServices) -> Result<Arc<Self>> {
        info!("Initializing Mosaic framework");
        config.validate()?;

        let pool = ContextPool::new(host.contexts.clone(), config.pool.clone());

        // Evictions are handed to the reaper so the instance's own worker
        // releases its resources, in order with its other operations.
        let (evictions, reaped) = mpsc::unbounded_channel::<InstanceId>();
        let keep_alive = Arc::new(KeepAliveRegistry::with_callback(
            config.pool.max_alive,
            &config.keep_alive,
            Arc::new(move |entry: KeepAliveEntry| {
                let _ = evictions.send(entry.id);
            }),
        ));

        let strategies = StrategySet::new(&host, pool.clone());
        let instances: InstanceIndex = Arc::new(DashMap::new());
        let reaper = tokio::spawn(reap(reaped, instances.clone()));

        info!(
            "Mosaic framework initialized (default sandbox: {}, pool: {}/{}, max alive: {})",
            config.default_sandbox,
            config.pool.initial_size,
            config.pool.max_size,
            config.pool.max_alive
        );

        Ok(Arc::new(Self {
            config,
            host,
            pool,
            keep_alive,
            strategies,
            instances,
            reaper: Mutex::new(Some(reaper)),
            disposed: AtomicBool::new(false),
        }))
    }

    /// Initialize a framework from a JSON or TOML configuration file.
    pub fn from_config_file(path: impl AsRef<Path>, host: HostServices) -> anyhow::Result<Arc<Self>> {
        let path = path.as_ref();
        let config = FrameworkConfig::load(Some(path))
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        Self::init(config, host).context("Failed to initialize Mosaic framework")
    }

    /// Create an instance. It stays `Idle` until connected to a container.
    pub fn create_instance(&self, spec: InstanceSpec) -> Result<Arc<InstanceController>> {
        if self.is_disposed() {
            return Err(IsolationError::PoolDisposed.into());
        }

        validate_source(&spec.source)?;

        let level = spec.isolation.unwrap_or(self.config.default_sandbox);
        let controller = Arc::new(InstanceController::spawn(
            spec,
            level,
            self.strategies.get(level),
            self.keep_alive.clone(),
            ControllerTimeouts {
                load: self.config.load_timeout(),
                rpc: self.config.rpc_timeout(),
            },
        ));

        self.instances
            .insert(controller.id(), Arc::downgrade(&controller));
        Ok(controller)
    }

    /// Look up a live instance.
    pub fn instance(&self, id: InstanceId) -> Option<Arc<InstanceController>> {
        self.instances.get(&id).and_then(|entry| entry.value().upgrade())
    }

    /// Every live instance.
    pub fn instances(&self) -> Vec<Arc<InstanceController>> {
        self.instances.retain(|_, controller| controller.strong_count() > 0);
        self.instances
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    /// Current pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The context pool.
    pub fn pool(&self) -> &Arc<ContextPool> {
        &self.pool
    }

    /// The keep-alive registry.
    pub fn keep_alive(&self) -> &Arc<KeepAliveRegistry> {
        &self.keep_alive
    }

    /// The active configuration.
    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    /// One strategy per isolation level.
    pub fn strategies(&self) -> &StrategySet {
        &self.strategies
    }

    /// The host environment.
    pub fn host(&self) -> &HostServices {
        &self.host
    }

    /// Whether `dispose` has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Destroy every instance and release all shared resources.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disposing Mosaic framework");

        let pending: Vec<_> = self
            .instances()
            .iter()
            .map(|controller| controller.destroy())
            .collect();
        let count = pending.len();
        // Already-destroyed instances answer with an error; nothing to do.
        futures::future::join_all(pending).await;
        self.instances.clear();

        self.keep_alive.dispose();
        self.pool.dispose();
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }

        info!("Mosaic framework disposed ({} instances destroyed)", count);
    }
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("config", &self.config)
            .field("instances", &self.instances.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Forward registry evictions to the owning controllers.
async fn reap(mut evictions: mpsc::UnboundedReceiver<InstanceId>, instances: InstanceIndex) {
    while let Some(id) = evictions.recv().await {
        let controller = instances.get(&id).and_then(|entry| entry.value().upgrade());
        match controller {
            // The operation is queued on send; the outcome is not needed.
            Some(controller) => drop(controller.evict()),
            None => debug!("Evicted instance {} is already gone", id),
        }
    }
}
