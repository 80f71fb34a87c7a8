//! # Mosaic Isolation
//!
//! `mosaic_isolation` mounts sub-applications into host containers at one of
//! four isolation levels and manages the resources that make this cheap.
//!
//! Key concepts:
//!
//! 1. **Isolation Strategies**: `none`, `light`, `strict` and `remote`, each
//!    behind the [`IsolationStrategy`] trait. Strategies keep per-instance
//!    state so an unmounted instance can be restored without reloading.
//!
//! 2. **Context Pool**: Pre-created execution contexts for `strict`
//!    isolation, recycled on release and bounded softly by `max_size`.
//!
//! 3. **Keep-Alive Registry**: Decides which detached instances stay
//!    resident, evicting by priority and then by recency.
//!
//! 4. **Host Services**: The host environment the strategies operate on,
//!    bundled in [`HostServices`].

pub mod host;
pub mod manager;
pub mod strategy;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use host::HostServices;
pub use manager::{
    ContextPool, EvictionCallback, KeepAliveEntry, KeepAliveRegistry, PoolStats, PooledContext,
};
pub use strategy::{
    IsolationStrategy, LightStrategy, LocalBus, MountTarget, NoneStrategy, RemoteStrategy,
    StrategyEndpoint, StrategySet, StrictStrategy,
};
