//! Isolated execution contexts.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use url::Url;

use crate::error::{LoadError, Result};
use crate::id::{ContextId, InstanceId};
use crate::types::{Presentation, SandboxPolicy};

/// A handle to one isolated execution context.
///
/// Contexts are expensive to create, which is why `strict` isolation draws
/// them from a pool. Every method except `load` must return promptly.
#[async_trait]
pub trait ExecutionContext: Send + Sync + fmt::Debug {
    /// Stable identity of the context, also used as the `source` of the
    /// messages it posts.
    fn id(&self) -> ContextId;

    /// Navigate to `source` and resolve once the navigation has completed.
    async fn load(&self, source: &Url) -> Result<(), LoadError>;

    /// Return the context to a blank, neutral state.
    fn reset(&self) -> Result<()>;

    /// Apply sandbox grants. Takes effect on the next navigation.
    fn apply_sandbox(&self, policy: &SandboxPolicy);

    /// Evaluate a script inside the context.
    fn inject_script(&self, script: &str) -> Result<()>;

    /// Post a JSON message into the context, restricted to `target_origin`.
    fn post_message(&self, data: Value, target_origin: &str) -> Result<()>;

    /// Change how the context is presented in the host layout.
    fn set_presentation(&self, presentation: Presentation);

    /// Whether the context can still be driven.
    fn is_reachable(&self) -> bool;

    /// Tear the context down. Must be idempotent.
    fn destroy(&self);
}

/// The host primitive that creates execution contexts.
pub trait ContextFactory: Send + Sync {
    /// Create a new context synchronously.
    fn create_context(&self) -> Result<Arc<dyn ExecutionContext>>;
}

/// Lifecycle hooks of the host's overlay handling.
pub trait OverlayHooks: Send + Sync {
    /// A context was promoted to full-viewport presentation.
    fn promotion_entered(&self, instance: InstanceId);

    /// A context went back to inline presentation.
    fn promotion_exited(&self, instance: InstanceId);
}
