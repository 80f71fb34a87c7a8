//! Execution context pooling.
//!
//! Creating an execution context is the most expensive step of `strict`
//! isolation, so contexts are created ahead of time and recycled. The pool is
//! a flat list of entries; `acquire` never waits.

use mosaic_core::config::PoolConfig;
use mosaic_core::error::{IsolationError, Result};
use mosaic_core::id::{ContextId, InstanceId};
use mosaic_core::traits::{ContextFactory, ExecutionContext};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// A pooled execution context.
#[derive(Clone)]
pub struct PooledContext {
    /// The context.
    context: Arc<dyn ExecutionContext>,

    /// Whether an instance currently holds the context.
    in_use: bool,

    /// The holding instance, set iff `in_use`.
    owner: Option<InstanceId>,

    /// When the context was created.
    created_at: Instant,

    /// When the context was last acquired or released.
    last_used_at: Instant,
}

impl PooledContext {
    fn new(context: Arc<dyn ExecutionContext>) -> Self {
        let now = Instant::now();
        Self {
            context,
            in_use: false,
            owner: None,
            created_at: now,
            last_used_at: now,
        }
    }

    fn claim(&mut self, owner: InstanceId) -> Arc<dyn ExecutionContext> {
        self.in_use = true;
        self.owner = Some(owner);
        self.last_used_at = Instant::now();
        self.context.clone()
    }

    /// Get the context.
    pub fn context(&self) -> &Arc<dyn ExecutionContext> {
        &self.context
    }

    /// Whether an instance holds the context.
    pub fn in_use(&self) -> bool {
        self.in_use
    }

    /// The holding instance.
    pub fn owner(&self) -> Option<InstanceId> {
        self.owner
    }

    /// When the context was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the context was last acquired or released.
    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }
}

impl std::fmt::Debug for PooledContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledContext")
            .field("context", &self.context.id())
            .field("in_use", &self.in_use)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Contexts currently pooled.
    pub total: usize,

    /// Contexts held by an instance.
    pub in_use: usize,

    /// Contexts available for reuse.
    pub idle: usize,

    /// Contexts created since the pool was built.
    pub created: u64,

    /// Idle contexts evicted to make room.
    pub evicted: u64,

    /// Contexts created beyond `max_size`.
    pub overflow: u64,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<PooledContext>,
    created: u64,
    evicted: u64,
    overflow: u64,
    maintenance_scheduled: bool,
    disposed: bool,
}

/// What `acquire` decided to do once no idle, reachable entry was found.
enum Plan {
    Create,
    Evict(usize),
    Overflow,
}

/// A pool of execution contexts.
///
/// Host calls that can re-enter (context creation, reset, destroy) are made
/// with the pool's lock released.
pub struct ContextPool {
    /// Creates new contexts.
    factory: Arc<dyn ContextFactory>,

    /// Pool sizing.
    config: PoolConfig,

    /// The entries and counters.
    state: Mutex<PoolState>,

    /// Handle to ourselves for deferred maintenance.
    this: Weak<ContextPool>,
}

impl ContextPool {
    /// Create a new pool and eagerly create `initial_size` contexts.
    ///
    /// # Arguments
    ///
    /// * `factory` - The host primitive that creates contexts.
    /// * `config` - Pool sizing.
    ///
    /// # Returns
    ///
    /// A new pool. Prewarm failures are logged; the pool is usable regardless.
    pub fn new(factory: Arc<dyn ContextFactory>, config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new_cyclic(|this| Self {
            factory,
            config,
            state: Mutex::new(PoolState::default()),
            this: this.clone(),
        });
        pool.prewarm();
        pool
    }

    /// Pool sizing.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Create idle contexts until the pool holds `initial_size`.
    ///
    /// # Returns
    ///
    /// The number of contexts created.
    pub fn prewarm(&self) -> usize {
        let mut created = 0;

        loop {
            {
                let state = self.state.lock();
                if state.disposed || state.entries.len() >= self.config.initial_size {
                    break;
                }
            }

            match self.factory.create_context() {
                Ok(context) => {
                    let mut state = self.state.lock();
                    if state.disposed {
                        drop(state);
                        context.destroy();
                        break;
                    }
                    trace!("Prewarmed context {}", context.id());
                    state.entries.push(PooledContext::new(context));
                    state.created += 1;
                    created += 1;
                }
                Err(e) => {
                    warn!("Failed to prewarm execution context: {}", e);
                    break;
                }
            }
        }

        created
    }

    /// Acquire a context for `owner`.
    ///
    /// Reuses the first idle, reachable entry. Otherwise creates a new entry
    /// while below `max_size`; at capacity evicts the least recently used idle
    /// entry and creates a replacement in its slot; and with nothing idle at
    /// capacity creates one anyway (soft overflow).
    ///
    /// # Arguments
    ///
    /// * `owner` - The instance that will hold the context.
    ///
    /// # Returns
    ///
    /// * `Ok(context)` - A context exclusively held by `owner`.
    /// * `Err` - If the pool was disposed or the host could not create one.
    pub fn acquire(&self, owner: InstanceId) -> Result<Arc<dyn ExecutionContext>> {
        let plan = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(IsolationError::PoolDisposed.into());
            }

            if let Some(entry) = state
                .entries
                .iter_mut()
                .find(|entry| !entry.in_use && entry.context.is_reachable())
            {
                let context = entry.claim(owner);
                debug!("Reusing pooled context {} for {}", context.id(), owner);
                return Ok(context);
            }

            if state.entries.len() < self.config.max_size {
                Plan::Create
            } else if let Some(index) = Self::least_recently_used_idle(&state.entries) {
                let victim = state.entries.remove(index);
                state.evicted += 1;
                drop(state);

                debug!(
                    "Evicting idle context {} to make room for {}",
                    victim.context.id(),
                    owner
                );
                victim.context.destroy();
                Plan::Evict(index)
            } else {
                Plan::Overflow
            }
        };

        let context = self.factory.create_context()?;

        let mut state = self.state.lock();
        if state.disposed {
            drop(state);
            context.destroy();
            return Err(IsolationError::PoolDisposed.into());
        }

        let mut entry = PooledContext::new(context);
        let context = entry.claim(owner);
        state.created += 1;

        match plan {
            Plan::Create => {
                state.entries.push(entry);
                debug!("Created pooled context {} for {}", context.id(), owner);
            }
            Plan::Evict(index) => {
                let index = index.min(state.entries.len());
                state.entries.insert(index, entry);
            }
            Plan::Overflow => {
                state.entries.push(entry);
                state.overflow += 1;
                warn!(
                    "Context pool over capacity ({} > {}), created {} for {}",
                    state.entries.len(),
                    self.config.max_size,
                    context.id(),
                    owner
                );
            }
        }

        Ok(context)
    }

    /// Smallest `last_used_at` among idle entries, first found on ties.
    fn least_recently_used_idle(entries: &[PooledContext]) -> Option<usize> {
        let mut best: Option<(usize, Instant)> = None;
        for (index, entry) in entries.iter().enumerate() {
            if entry.in_use {
                continue;
            }
            match best {
                Some((_, oldest)) if entry.last_used_at >= oldest => {}
                _ => best = Some((index, entry.last_used_at)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// Return a context to the idle set.
    ///
    /// The context is reset first. A failed reset is logged and the slot is
    /// still returned to the idle set. A maintenance pass is scheduled on the
    /// async runtime afterwards.
    pub fn release(&self, context: &Arc<dyn ExecutionContext>) {
        let id = context.id();

        if let Err(e) = context.reset() {
            warn!("Failed to reset context {} on release: {}", id, e);
        }

        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }

            match state.entries.iter_mut().find(|entry| entry.context.id() == id) {
                Some(entry) => {
                    entry.in_use = false;
                    entry.owner = None;
                    entry.last_used_at = Instant::now();
                    trace!("Released context {}", id);
                }
                None => {
                    warn!("Released context {} does not belong to the pool", id);
                    return;
                }
            }
        }

        self.schedule_maintenance();
    }

    /// Permanently discard a context.
    pub fn remove(&self, context: &Arc<dyn ExecutionContext>) {
        let id = context.id();
        let removed = {
            let mut state = self.state.lock();
            let before = state.entries.len();
            state.entries.retain(|entry| entry.context.id() != id);
            before != state.entries.len()
        };

        context.destroy();

        if removed {
            debug!("Removed context {} from the pool", id);
            self.schedule_maintenance();
        }
    }

    /// Run a maintenance pass on the async runtime after yielding.
    ///
    /// Passes are coalesced. Without a runtime the pass is skipped.
    fn schedule_maintenance(&self) {
        {
            let mut state = self.state.lock();
            if state.maintenance_scheduled || state.disposed {
                return;
            }
            state.maintenance_scheduled = true;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.state.lock().maintenance_scheduled = false;
                debug!("No async runtime, skipping pool maintenance");
                return;
            }
        };

        let pool = self.this.clone();
        handle.spawn(async move {
            tokio::task::yield_now().await;
            if let Some(pool) = pool.upgrade() {
                pool.state.lock().maintenance_scheduled = false;
                pool.replenish();
            }
        });
    }

    /// Trim surplus idle contexts above `max_size`, then top the pool back up
    /// to `initial_size`.
    ///
    /// # Returns
    ///
    /// The number of contexts created.
    pub fn replenish(&self) -> usize {
        let surplus: Vec<Arc<dyn ExecutionContext>> = {
            let mut state = self.state.lock();
            let mut surplus = Vec::new();
            while state.entries.len() > self.config.max_size {
                match Self::least_recently_used_idle(&state.entries) {
                    Some(index) => surplus.push(state.entries.remove(index).context),
                    None => break,
                }
            }
            surplus
        };

        for context in surplus {
            debug!("Trimming surplus context {}", context.id());
            context.destroy();
        }

        self.prewarm()
    }

    /// The instance holding a context.
    pub fn owner_of(&self, context: ContextId) -> Option<InstanceId> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|entry| entry.context.id() == context)
            .and_then(|entry| entry.owner)
    }

    /// Snapshot of the entries.
    pub fn entries(&self) -> Vec<PooledContext> {
        self.state.lock().entries.clone()
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let in_use = state.entries.iter().filter(|entry| entry.in_use).count();
        PoolStats {
            total: state.entries.len(),
            in_use,
            idle: state.entries.len() - in_use,
            created: state.created,
            evicted: state.evicted,
            overflow: state.overflow,
        }
    }

    /// Destroy every context. Later `acquire` calls fail.
    pub fn dispose(&self) {
        let entries = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.entries)
        };

        debug!("Disposing context pool with {} contexts", entries.len());
        for entry in entries {
            entry.context.destroy();
        }
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}
