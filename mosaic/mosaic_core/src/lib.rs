//! # Mosaic Core
//!
//! `mosaic_core` provides the building blocks shared by every Mosaic crate:
//! error types, identifiers, the data model of embedded sub-applications and
//! the traits through which Mosaic drives its host environment.
//!
//! ## Core Principles
//!
//! 1. **Tiered Isolation**: A sub-application is embedded at one of four
//!    isolation levels (`none`, `light`, `strict`, `remote`), trading
//!    isolation strength against cost.
//!
//! 2. **Host Seams**: Execution contexts, content trees, script engines and
//!    timers belong to the host. Mosaic only sees them through the traits in
//!    [`traits`], so every strategy can be exercised with in-memory doubles.
//!
//! 3. **Message Passing**: Sub-applications in their own execution context
//!    are reached exclusively through JSON messages tagged with their sender
//!    and trust origin.
//!
//! ## Crate Structure
//!
//! - **config**: Framework configuration with defaults and validation
//! - **error**: Error types for all Mosaic components
//! - **id**: Strongly-typed identifier types
//! - **traits**: Host-environment interfaces
//! - **types**: Data structures used throughout the system
//! - **utils**: Logging setup
//! - **testing**: In-memory host doubles (feature `testing`)

pub mod config;
pub mod error;
pub mod id;
pub mod traits;
pub mod types;
pub mod utils;

#[cfg(feature = "testing")]
pub mod testing;

// Re-export key types and traits for convenience
pub use config::{FrameworkConfig, KeepAliveConfig, PoolConfig};
pub use error::{
    ConfigError, Error, IsolationError, LifecycleError, LoadError, Result, RpcError, ScriptError,
};
pub use id::{CallId, ContextId, Id, InstanceId};
pub use traits::{
    ContentContainer, ContentFetcher, ContextFactory, ExecutionContext, GlobalScope, OverlayHooks,
    ScopeAccess, ScriptHost, ScriptScope, TimerHandle, TimerHost, TimerKind,
};
pub use types::{
    validate_source, ContentNode, InboundMessage, InstanceStatus, IsolationLevel, Presentation,
    Priority, SandboxPolicy, ScriptBlock, ScriptSource,
};
pub use utils::{init_logging, LogLevel};
