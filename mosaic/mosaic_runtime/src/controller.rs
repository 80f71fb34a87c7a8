//! Instance lifecycle controller.
//!
//! Every instance is driven by one controller. Operations are queued on a
//! per-instance FIFO worker and run one at a time, so a detach issued while a
//! load is still in flight runs after the load settles and a quick
//! detach/attach sequence always ends in the state of the last operation.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use mosaic_channel::{ChannelOptions, MessageChannel, Subscription};
use mosaic_core::error::{Error, IsolationError, LifecycleError, LoadError, Result};
use mosaic_core::id::InstanceId;
use mosaic_core::traits::ContentContainer;
use mosaic_core::types::{InboundMessage, InstanceStatus, IsolationLevel, Priority};
use mosaic_isolation::{IsolationStrategy, KeepAliveRegistry, MountTarget, StrategyEndpoint};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::events::{LifecycleEvent, EVENT_CAPACITY};
use crate::instance::{InstanceSnapshot, InstanceSpec};

/// Event carrying the input properties to the sub-application.
pub const PROPS_EVENT: &str = "mosaic:props";

/// Timeouts applied by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerTimeouts {
    /// Bound on a full load and on a restore.
    pub load: Duration,

    /// Default timeout of channel calls.
    pub rpc: Duration,
}

enum Op {
    Attach(Arc<dyn ContentContainer>),
    Detach,
    Reload,
    Destroy,
    Evict,
    SetProps(Value),
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Attach(_) => "attach",
            Op::Detach => "detach",
            Op::Reload => "reload",
            Op::Destroy => "destroy",
            Op::Evict => "evict",
            Op::SetProps(_) => "set_props",
        }
    }
}

struct Command {
    op: Op,
    done: oneshot::Sender<Result<()>>,
}

struct InstanceState {
    status: InstanceStatus,
    container: Option<Arc<dyn ContentContainer>>,
    channel: Option<MessageChannel>,
    props: Value,
    last_active_at: DateTime<Utc>,
    destroyed: bool,
}

/// State shared between a controller handle and its worker.
struct Shared {
    id: InstanceId,
    name: String,
    source: Url,
    level: IsolationLevel,
    keep_alive: bool,
    priority: Priority,
    created_at: DateTime<Utc>,
    strategy: Arc<dyn IsolationStrategy>,
    state: Mutex<InstanceState>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Shared {
    fn status(&self) -> InstanceStatus {
        self.state.lock().status
    }

    fn emit(&self, event: LifecycleEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn transition(&self, to: InstanceStatus) -> Result<()> {
        let from = {
            let mut state = self.state.lock();
            let from = state.status;
            if !from.can_transition_to(to) {
                return Err(LifecycleError::InvalidTransition { from, to }.into());
            }
            state.status = to;
            state.last_active_at = Utc::now();
            from
        };
        debug!("[{}] {} -> {}", self.name, from, to);
        self.emit(LifecycleEvent::StatusChanged {
            id: self.id,
            from,
            to,
        });
        Ok(())
    }

    fn take_channel(&self) -> Option<MessageChannel> {
        self.state.lock().channel.take()
    }
}

/// Handle to one instance.
///
/// Every operation is enqueued synchronously and returns a future resolving
/// once the worker has run it. Dropping the future does not cancel the
/// operation. Dropping the last handle destroys the instance.
pub struct InstanceController {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Command>,
}

impl InstanceController {
    /// Create a controller and start its worker on the current runtime.
    ///
    /// # Arguments
    ///
    /// * `spec` - What to run.
    /// * `level` - Effective isolation level.
    /// * `strategy` - The strategy implementing `level`.
    /// * `registry` - Keep-alive registry shared by all instances.
    /// * `timeouts` - Load and call timeouts.
    pub fn spawn(
        spec: InstanceSpec,
        level: IsolationLevel,
        strategy: Arc<dyn IsolationStrategy>,
        registry: Arc<KeepAliveRegistry>,
        timeouts: ControllerTimeouts,
    ) -> Self {
        let now = Utc::now();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            id: InstanceId::new(),
            name: spec.name,
            source: spec.source,
            level,
            keep_alive: spec.keep_alive,
            priority: spec.priority,
            created_at: now,
            strategy,
            state: Mutex::new(InstanceState {
                status: InstanceStatus::Idle,
                container: None,
                channel: None,
                props: spec.props,
                last_active_at: now,
                destroyed: false,
            }),
            events,
        });

        let (queue, commands) = mpsc::unbounded_channel();
        let worker = Worker {
            shared: shared.clone(),
            registry,
            timeouts,
            subscription: None,
        };
        tokio::spawn(worker.run(commands));

        debug!("[{}] Created instance {} ({})", shared.name, shared.id, level);
        Self { shared, queue }
    }

    /// Instance id.
    pub fn id(&self) -> InstanceId {
        self.shared.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Effective isolation level.
    pub fn isolation(&self) -> IsolationLevel {
        self.shared.level
    }

    /// Current lifecycle status.
    pub fn status(&self) -> InstanceStatus {
        self.shared.status()
    }

    /// Whether `destroy` has run.
    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().destroyed
    }

    /// The channel of the current mount.
    ///
    /// A new channel is opened on every mount; listen for
    /// [`LifecycleEvent::RpcReady`] to expose host methods on it.
    pub fn channel(&self) -> Option<MessageChannel> {
        self.shared.state.lock().channel.clone()
    }

    /// Current input properties.
    pub fn props(&self) -> Value {
        self.shared.state.lock().props.clone()
    }

    /// Listen for lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.events.subscribe()
    }

    /// Point-in-time view of the instance.
    pub fn snapshot(&self) -> InstanceSnapshot {
        let shared = &self.shared;
        let context = shared.strategy.held_context(shared.id).map(|c| c.id());
        let retained = shared.strategy.is_retained(shared.id);
        let state = shared.state.lock();
        InstanceSnapshot {
            id: shared.id,
            name: shared.name.clone(),
            source: shared.source.clone(),
            isolation: shared.level,
            status: state.status,
            keep_alive: shared.keep_alive,
            priority: shared.priority,
            retained,
            context,
            props: state.props.clone(),
            created_at: shared.created_at,
            last_active_at: state.last_active_at,
            destroyed: state.destroyed,
        }
    }

    /// Attach the instance to a container.
    ///
    /// Loads the source on first attach or after an error, restores cheaply
    /// when the instance was retained.
    pub fn connect(
        &self,
        container: Arc<dyn ContentContainer>,
    ) -> BoxFuture<'static, Result<()>> {
        self.enqueue(Op::Attach(container))
    }

    /// Detach the instance, retaining it when keep-alive is enabled.
    pub fn disconnect(&self) -> BoxFuture<'static, Result<()>> {
        self.enqueue(Op::Detach)
    }

    /// Tear down and load the source again in the same container.
    pub fn reload(&self) -> BoxFuture<'static, Result<()>> {
        self.enqueue(Op::Reload)
    }

    /// Release everything. Later operations fail with
    /// [`LifecycleError::Destroyed`].
    pub fn destroy(&self) -> BoxFuture<'static, Result<()>> {
        self.enqueue(Op::Destroy)
    }

    /// Replace the input properties and push them to a mounted instance.
    pub fn set_props(&self, props: Value) -> BoxFuture<'static, Result<()>> {
        self.enqueue(Op::SetProps(props))
    }

    /// Release a retained instance chosen for eviction.
    pub(crate) fn evict(&self) -> BoxFuture<'static, Result<()>> {
        self.enqueue(Op::Evict)
    }

    fn enqueue(&self, op: Op) -> BoxFuture<'static, Result<()>> {
        let id = self.shared.id;
        let (done, outcome) = oneshot::channel();
        let queued = self.queue.send(Command { op, done }).is_ok();

        async move {
            if !queued {
                return Err(LifecycleError::QueueClosed(id).into());
            }
            outcome
                .await
                .unwrap_or_else(|_| Err(LifecycleError::QueueClosed(id).into()))
        }
        .boxed()
    }
}

impl std::fmt::Debug for InstanceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceController")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("isolation", &self.shared.level)
            .field("status", &self.status())
            .finish()
    }
}

/// Runs the operations of one instance in order.
struct Worker {
    shared: Arc<Shared>,
    registry: Arc<KeepAliveRegistry>,
    timeouts: ControllerTimeouts,
    subscription: Option<Subscription>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(Command { op, done }) = commands.recv().await {
            let name = op.name();
            let outcome = if self.shared.state.lock().destroyed {
                Err(LifecycleError::Destroyed(self.shared.id).into())
            } else {
                self.apply(op).await
            };
            if let Err(e) = &outcome {
                debug!("[{}] {} failed: {}", self.shared.name, name, e);
            }
            let _ = done.send(outcome);
        }

        // Every handle is gone.
        if !self.shared.state.lock().destroyed {
            debug!("[{}] Controller dropped, destroying instance", self.shared.name);
            self.destroy().await;
        }
    }

    async fn apply(&mut self, op: Op) -> Result<()> {
        match op {
            Op::Attach(container) => self.attach(container).await,
            Op::Detach => self.detach().await,
            Op::Reload => self.reload().await,
            Op::Destroy => {
                self.destroy().await;
                Ok(())
            }
            Op::Evict => {
                self.evict().await;
                Ok(())
            }
            Op::SetProps(props) => {
                let channel = {
                    let mut state = self.shared.state.lock();
                    state.props = props.clone();
                    state.channel.clone()
                };
                if let Some(channel) = channel {
                    channel.emit(PROPS_EVENT, props)?;
                }
                Ok(())
            }
        }
    }

    async fn attach(&mut self, container: Arc<dyn ContentContainer>) -> Result<()> {
        let id = self.shared.id;
        match self.shared.status() {
            InstanceStatus::Mounted => {
                debug!("[{}] Already mounted", self.shared.name);
                Ok(())
            }
            InstanceStatus::Unmounted if self.shared.strategy.is_retained(id) => {
                self.restore(container).await
            }
            _ => self.load(container).await,
        }
    }

    /// Full load from the source.
    async fn load(&mut self, container: Arc<dyn ContentContainer>) -> Result<()> {
        self.shared.transition(InstanceStatus::Loading)?;
        self.shared.state.lock().container = Some(container.clone());

        if let Err(e) = self.mount(container).await {
            return Err(self.fail(e).await);
        }

        self.shared.transition(InstanceStatus::Mounting)?;
        if let Err(e) = self.open_channel() {
            return Err(self.fail(e).await);
        }
        self.shared.transition(InstanceStatus::Mounted)?;
        self.shared.emit(LifecycleEvent::RpcReady { id: self.shared.id });
        Ok(())
    }

    /// Cheap re-attach of a retained instance.
    async fn restore(&mut self, container: Arc<dyn ContentContainer>) -> Result<()> {
        let id = self.shared.id;
        self.registry.remove(id);
        self.registry.record_visit(id);

        self.shared.transition(InstanceStatus::Mounting)?;
        self.shared.state.lock().container = Some(container.clone());

        if let Err(e) = self.mount(container).await {
            return Err(self.fail(e).await);
        }
        if let Err(e) = self.open_channel() {
            return Err(self.fail(e).await);
        }

        self.shared.transition(InstanceStatus::Mounted)?;
        self.shared.emit(LifecycleEvent::KeepAliveRestore { id });
        self.shared.emit(LifecycleEvent::RpcReady { id });
        debug!("[{}] Restored from keep-alive", self.shared.name);
        Ok(())
    }

    async fn mount(&self, container: Arc<dyn ContentContainer>) -> Result<()> {
        let target = MountTarget {
            id: self.shared.id,
            name: self.shared.name.clone(),
            source: self.shared.source.clone(),
            container,
        };
        let limit = self.timeouts.load;
        match tokio::time::timeout(limit, self.shared.strategy.mount(&target)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(LoadError::Timeout(limit.as_millis() as u64).into()),
        }
    }

    /// Release partial resources and enter `Error`.
    async fn fail(&mut self, err: Error) -> Error {
        error!("[{}] Failed to mount {}: {}", self.shared.name, self.shared.source, err);
        self.close_channel();
        if let Err(e) = self.shared.strategy.destroy(self.shared.id).await {
            warn!("[{}] Cleanup after failure failed: {}", self.shared.name, e);
        }
        if let Err(e) = self.shared.transition(InstanceStatus::Error) {
            warn!("[{}] {}", self.shared.name, e);
        }
        self.shared.emit(LifecycleEvent::Error {
            id: self.shared.id,
            message: err.to_string(),
        });
        err
    }

    fn open_channel(&mut self) -> Result<()> {
        let id = self.shared.id;
        let strategy = &self.shared.strategy;

        let mut options = ChannelOptions::named(self.shared.name.clone())
            .with_timeout(self.timeouts.rpc);
        if let Some(origin) = strategy.trust_origin(id) {
            options = options.with_expected_origin(origin);
        }
        if let Some(source) = strategy.source_context(id) {
            options = options.with_expected_source(source);
        }

        let channel = MessageChannel::new(
            Arc::new(StrategyEndpoint::new(strategy.clone(), id)),
            options,
        );
        let receiver = channel.clone();
        let subscription = strategy.on_receive(
            id,
            Arc::new(move |message: &InboundMessage| {
                receiver.receive(message);
            }),
        )?;

        let props = {
            let mut state = self.shared.state.lock();
            state.channel = Some(channel.clone());
            state.props.clone()
        };
        self.subscription = Some(subscription);

        if let Err(e) = channel.emit(PROPS_EVENT, props) {
            warn!("[{}] Failed to push props: {}", self.shared.name, e);
        }
        Ok(())
    }

    fn close_channel(&mut self) {
        self.subscription = None;
        if let Some(channel) = self.shared.take_channel() {
            channel.dispose();
        }
    }

    async fn detach(&mut self) -> Result<()> {
        let id = self.shared.id;
        match self.shared.status() {
            InstanceStatus::Mounted => {}
            InstanceStatus::Error => return self.shared.transition(InstanceStatus::Unmounted),
            status => {
                debug!("[{}] Nothing to detach in status {}", self.shared.name, status);
                return Ok(());
            }
        }

        self.shared.transition(InstanceStatus::Unmounting)?;
        self.close_channel();

        if self.shared.keep_alive {
            match self.shared.strategy.unmount(id).await {
                Ok(()) => {
                    self.shared.transition(InstanceStatus::Unmounted)?;
                    let context = self.shared.strategy.held_context(id);
                    self.registry
                        .add(id, self.shared.name.clone(), context, self.shared.priority);
                    self.shared.emit(LifecycleEvent::KeepAliveStart { id });
                    debug!("[{}] Retained", self.shared.name);
                    return Ok(());
                }
                Err(e) => {
                    warn!("[{}] Unmount failed, destroying instead: {}", self.shared.name, e);
                }
            }
        }

        if let Err(e) = self.shared.strategy.destroy(id).await {
            warn!("[{}] Destroy on detach failed: {}", self.shared.name, e);
        }
        self.shared.transition(InstanceStatus::Unmounted)
    }

    async fn reload(&mut self) -> Result<()> {
        let id = self.shared.id;
        let container = self
            .shared
            .state
            .lock()
            .container
            .clone()
            .ok_or(IsolationError::NotMounted(id))?;

        info!("[{}] Reloading", self.shared.name);
        if self.shared.status() == InstanceStatus::Mounted {
            self.shared.transition(InstanceStatus::Unmounting)?;
            self.close_channel();
            self.shared.transition(InstanceStatus::Unmounted)?;
        }
        self.registry.remove(id);
        if let Err(e) = self.shared.strategy.destroy(id).await {
            warn!("[{}] Destroy before reload failed: {}", self.shared.name, e);
        }

        self.load(container).await
    }

    async fn evict(&mut self) {
        let id = self.shared.id;
        let stale = self.shared.status() != InstanceStatus::Unmounted
            || !self.shared.strategy.is_retained(id)
            || self.registry.has(id);
        if stale {
            debug!("[{}] Ignoring stale eviction", self.shared.name);
            return;
        }

        if let Err(e) = self.shared.strategy.destroy(id).await {
            warn!("[{}] Destroy on eviction failed: {}", self.shared.name, e);
        }
        self.shared.emit(LifecycleEvent::Evicted { id });
        info!("[{}] Evicted from keep-alive", self.shared.name);
    }

    async fn destroy(&mut self) {
        let id = self.shared.id;
        if self.shared.status() == InstanceStatus::Mounted {
            let _ = self.shared.transition(InstanceStatus::Unmounting);
            self.close_channel();
            let _ = self.shared.transition(InstanceStatus::Unmounted);
        }
        self.close_channel();

        self.registry.remove(id);
        self.registry.forget(id);
        if let Err(e) = self.shared.strategy.destroy(id).await {
            warn!("[{}] Destroy failed: {}", self.shared.name, e);
        }

        let mut state = self.shared.state.lock();
        state.destroyed = true;
        state.container = None;
        state.last_active_at = Utc::now();
        debug!("[{}] Destroyed", self.shared.name);
    }
}
