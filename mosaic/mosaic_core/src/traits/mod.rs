//! Host-environment traits.
//!
//! Mosaic does not talk to a rendering engine directly. The host implements
//! these traits over whatever realizes execution contexts, content trees,
//! script engines and timers in its environment, and the isolation strategies
//! drive them.

pub mod content;
pub mod context;

pub use content::{
    ContentContainer, ContentFetcher, GlobalScope, ScopeAccess, ScriptHost, ScriptScope,
    TimerHandle, TimerHost, TimerKind,
};
pub use context::{ContextFactory, ExecutionContext, OverlayHooks};
