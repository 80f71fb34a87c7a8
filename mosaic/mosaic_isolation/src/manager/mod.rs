//! Shared resource management.
//!
//! The context pool amortizes creation of execution contexts for `strict`
//! isolation, and the keep-alive registry decides which detached instances
//! stay resident.

mod keep_alive;
mod pool;

pub use keep_alive::{EvictionCallback, KeepAliveEntry, KeepAliveRegistry};
pub use pool::{ContextPool, PoolStats, PooledContext};
