//! Keep-alive registry.
//!
//! Detached instances that asked to be retained are parked here together with
//! the execution context they hold. The registry is bounded by `max_alive`;
//! when full, exactly one entry is evicted before a new one is inserted.

use mosaic_core::config::KeepAliveConfig;
use mosaic_core::id::InstanceId;
use mosaic_core::traits::ExecutionContext;
use mosaic_core::types::Priority;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error};

/// Invoked once for every evicted entry.
pub type EvictionCallback = Arc<dyn Fn(KeepAliveEntry) + Send + Sync>;

/// A retained instance.
#[derive(Clone)]
pub struct KeepAliveEntry {
    /// The retained instance.
    pub id: InstanceId,

    /// Display name of the instance.
    pub name: String,

    /// Retention priority.
    pub priority: Priority,

    /// Context held on behalf of the instance, if it has one.
    pub context: Option<Arc<dyn ExecutionContext>>,

    /// Last time the instance was added or visited.
    pub last_active_at: Instant,

    /// Number of recorded visits.
    pub visit_count: u32,

    /// When the instance entered the registry.
    pub retained_since: Instant,
}

impl std::fmt::Debug for KeepAliveEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("context", &self.context.as_ref().map(|c| c.id()))
            .field("visit_count", &self.visit_count)
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<KeepAliveEntry>,
    visits: HashMap<InstanceId, u32>,
    disposed: bool,
}

/// Bounded registry of retained instances.
pub struct KeepAliveRegistry {
    max_alive: usize,
    auto_promote_after: u32,
    state: Mutex<RegistryState>,
    on_evict: EvictionCallback,
}

impl KeepAliveRegistry {
    /// Create a registry whose evictions destroy the held context.
    pub fn new(max_alive: usize, config: &KeepAliveConfig) -> Self {
        Self::with_callback(
            max_alive,
            config,
            Arc::new(|entry: KeepAliveEntry| {
                if let Some(context) = entry.context {
                    context.destroy();
                }
            }),
        )
    }

    /// Create a registry with a custom eviction callback.
    pub fn with_callback(
        max_alive: usize,
        config: &KeepAliveConfig,
        on_evict: EvictionCallback,
    ) -> Self {
        Self {
            max_alive,
            auto_promote_after: config.auto_promote_after,
            state: Mutex::new(RegistryState::default()),
            on_evict,
        }
    }

    /// Maximum number of entries.
    pub fn max_alive(&self) -> usize {
        self.max_alive
    }

    /// Retain an instance.
    ///
    /// Re-adding a tracked instance refreshes its recency, visit count and
    /// context, keeps its priority and evicts nothing. Otherwise, at capacity,
    /// one victim is evicted first: lowest priority, then oldest activity,
    /// then list order.
    ///
    /// Returns the id of the evicted instance, if any.
    pub fn add(
        &self,
        id: InstanceId,
        name: impl Into<String>,
        context: Option<Arc<dyn ExecutionContext>>,
        priority: Priority,
    ) -> Option<InstanceId> {
        let now = Instant::now();

        let victim = {
            let mut state = self.state.lock();
            if state.disposed {
                return None;
            }

            let visits = state.visits.get(&id).copied().unwrap_or(0);

            if let Some(entry) = state.entries.iter_mut().find(|entry| entry.id == id) {
                entry.last_active_at = now;
                entry.visit_count = visits;
                entry.context = context;
                debug!("Refreshed keep-alive entry {}", id);
                return None;
            }

            let victim = if state.entries.len() >= self.max_alive {
                Self::select_victim(&state.entries).map(|index| state.entries.remove(index))
            } else {
                None
            };

            // Earned promotions survive restore cycles.
            let priority = if priority == Priority::Normal && visits >= self.auto_promote_after {
                Priority::High
            } else {
                priority
            };

            state.entries.push(KeepAliveEntry {
                id,
                name: name.into(),
                priority,
                context,
                last_active_at: now,
                visit_count: visits,
                retained_since: now,
            });
            debug!(
                "Retained {} with priority {:?} ({} of {})",
                id,
                priority,
                state.entries.len(),
                self.max_alive
            );

            victim
        };

        victim.map(|victim| {
            let victim_id = victim.id;
            debug!("Evicting keep-alive entry {} to admit {}", victim_id, id);
            self.evict(victim);
            victim_id
        })
    }

    /// Lowest priority, then oldest `last_active_at`, first found on ties.
    fn select_victim(entries: &[KeepAliveEntry]) -> Option<usize> {
        let mut best: Option<(usize, Priority, Instant)> = None;
        for (index, entry) in entries.iter().enumerate() {
            let better = match best {
                None => true,
                Some((_, priority, last_active_at)) => {
                    (entry.priority, entry.last_active_at) < (priority, last_active_at)
                }
            };
            if better {
                best = Some((index, entry.priority, entry.last_active_at));
            }
        }
        best.map(|(index, _, _)| index)
    }

    /// Run the eviction callback outside the lock, containing panics.
    fn evict(&self, entry: KeepAliveEntry) {
        let id = entry.id;
        let callback = self.on_evict.clone();
        if catch_unwind(AssertUnwindSafe(|| callback(entry))).is_err() {
            error!("Eviction callback panicked for instance {}", id);
        }
    }

    /// Record a visit of an instance.
    ///
    /// Visits are counted even while the instance is not retained. A tracked
    /// `Normal` entry reaching `auto_promote_after` visits becomes `High`.
    pub fn record_visit(&self, id: InstanceId) {
        let mut state = self.state.lock();
        let visits = {
            let count = state.visits.entry(id).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };

        let threshold = self.auto_promote_after;
        if let Some(entry) = state.entries.iter_mut().find(|entry| entry.id == id) {
            entry.visit_count = visits;
            entry.last_active_at = Instant::now();
            if entry.priority == Priority::Normal && visits >= threshold {
                entry.priority = Priority::High;
                debug!("Promoted {} to high priority after {} visits", id, visits);
            }
        }
    }

    /// Stop tracking an instance and hand its entry back.
    pub fn remove(&self, id: InstanceId) -> Option<KeepAliveEntry> {
        let mut state = self.state.lock();
        let index = state.entries.iter().position(|entry| entry.id == id)?;
        Some(state.entries.remove(index))
    }

    /// Whether an instance is retained.
    pub fn has(&self, id: InstanceId) -> bool {
        self.state.lock().entries.iter().any(|entry| entry.id == id)
    }

    /// Get a retained entry.
    pub fn get(&self, id: InstanceId) -> Option<KeepAliveEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    /// Change the priority of a retained entry. Lowering is allowed.
    pub fn set_priority(&self, id: InstanceId, priority: Priority) -> bool {
        let mut state = self.state.lock();
        match state.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.priority = priority;
                true
            }
            None => false,
        }
    }

    /// Entries by priority descending, most recently active first.
    pub fn list(&self) -> Vec<KeepAliveEntry> {
        let mut entries = self.state.lock().entries.clone();
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.last_active_at.cmp(&a.last_active_at))
        });
        entries
    }

    /// Visits recorded for an instance.
    pub fn visits(&self, id: InstanceId) -> u32 {
        self.state.lock().visits.get(&id).copied().unwrap_or(0)
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the visit history of an instance that will never come back.
    pub fn forget(&self, id: InstanceId) {
        self.state.lock().visits.remove(&id);
    }

    /// Evict every entry through the callback.
    pub fn dispose(&self) {
        let entries = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.visits.clear();
            std::mem::take(&mut state.entries)
        };

        debug!("Disposing keep-alive registry with {} entries", entries.len());
        for entry in entries {
            self.evict(entry);
        }
    }
}
