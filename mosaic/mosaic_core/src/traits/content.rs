//! Content tree, script engine and timer seams.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{LoadError, ScriptError};
use crate::id::ContextId;
use crate::traits::context::ExecutionContext;
use crate::types::{ContentNode, ScriptBlock};

/// A node of the host's content tree that holds one sub-application.
pub trait ContentContainer: Send + Sync + fmt::Debug {
    /// Append a content node.
    fn append(&self, node: ContentNode);

    /// Remove every child this container holds.
    fn clear(&self);

    /// Attach a nested content boundary and return the container inside it.
    fn attach_boundary(&self) -> Arc<dyn ContentContainer>;

    /// Place an execution context into the layout.
    fn attach_context(&self, context: &Arc<dyn ExecutionContext>);

    /// Remove an execution context from the layout without destroying it.
    fn detach_context(&self, context: ContextId);

    /// Set the layout height in pixels.
    fn set_height(&self, height: u32);
}

/// Retrieves sub-application documents and external scripts.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Fetch the body at `url` as text.
    async fn fetch(&self, url: &Url) -> Result<String, LoadError>;
}

/// Read/write access to a script scope, as seen by embedded scripts.
pub trait ScopeAccess: Send + Sync {
    /// Read a global property.
    fn get(&self, name: &str) -> Option<Value>;

    /// Write a global property.
    fn set(&self, name: &str, value: Value);

    /// Register a timer or animation-frame callback.
    fn schedule(&self, kind: TimerKind, delay: Duration) -> TimerHandle;

    /// Cancel a previously registered timer.
    fn cancel(&self, handle: TimerHandle);
}

/// The scope an embedded script runs against.
#[derive(Clone, Copy)]
pub enum ScriptScope<'a> {
    /// The host's own execution context.
    Host,

    /// An intercepted scope private to one instance.
    Scoped(&'a dyn ScopeAccess),
}

impl fmt::Debug for ScriptScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "ScriptScope::Host"),
            Self::Scoped(_) => write!(f, "ScriptScope::Scoped"),
        }
    }
}

/// The host's script engine.
pub trait ScriptHost: Send + Sync {
    /// Run a script against `scope`.
    fn execute(&self, script: &ScriptBlock, scope: ScriptScope<'_>) -> Result<(), ScriptError>;
}

/// The host's global object.
pub trait GlobalScope: Send + Sync {
    /// Read a global property.
    fn get(&self, name: &str) -> Option<Value>;

    /// Write a global property.
    fn set(&self, name: &str, value: Value);
}

/// Kind of a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// One-shot timeout.
    Timeout,

    /// Repeating interval.
    Interval,

    /// Next animation frame.
    AnimationFrame,
}

/// Handle of a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerHandle(pub u64);

/// The host's timer facility.
pub trait TimerHost: Send + Sync {
    /// Schedule a callback.
    fn schedule(&self, kind: TimerKind, delay: Duration) -> TimerHandle;

    /// Cancel a scheduled callback. Unknown handles are ignored.
    fn cancel(&self, handle: TimerHandle);
}
