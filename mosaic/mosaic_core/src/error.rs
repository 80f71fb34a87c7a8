//! Error types for the Mosaic isolation framework.
//!
//! Errors are organized by subsystem, each with its own error type. The root
//! error type, `Error`, can wrap any of them so callers can handle failures
//! uniformly at the top level.

use crate::id::{ContextId, InstanceId};
use crate::types::InstanceStatus;
use thiserror::Error;

/// Root error type for Mosaic.
#[derive(Debug, Error)]
pub enum Error {
    /// Loading a sub-application failed
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// Cross-boundary RPC failed
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Isolation primitives failed
    #[error("Isolation error: {0}")]
    Isolation(#[from] IsolationError),

    /// Lifecycle state machine errors
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised while loading a sub-application into its container.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    /// The source could not be reached
    #[error("Source unreachable: {0}")]
    Unreachable(String),

    /// The fetch crossed a trust domain and was blocked
    #[error("Cross-origin fetch blocked: {0}")]
    Blocked(String),

    /// The load did not settle within the configured window
    #[error("Load timed out after {0}ms")]
    Timeout(u64),

    /// The source locator is not a usable URL
    #[error("Invalid source locator: {0}")]
    InvalidSource(String),

    /// An embedded script could not be retrieved
    #[error("Script failed: {0}")]
    Script(String),
}

/// Errors raised by the message channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// The remote side has no handler for the method
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// A local handler failed while serving a call
    #[error("Handler for '{method}' failed: {message}")]
    HandlerFailed {
        /// Method that was called
        method: String,
        /// Failure reported by the handler
        message: String,
    },

    /// The remote side answered with an error
    #[error("Remote error: {0}")]
    Remote(String),

    /// No response arrived within the timeout
    #[error("Call '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Method that was called
        method: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The channel has been disposed
    #[error("Channel disposed")]
    Disposed,

    /// A value could not be encoded or decoded
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The transport refused the message
    #[error("Transport failed: {0}")]
    Transport(String),
}

/// Errors related to isolation primitives.
#[derive(Debug, Error)]
pub enum IsolationError {
    /// The host could not create an execution context
    #[error("Failed to create execution context: {0}")]
    ContextCreationFailed(String),

    /// The pool was disposed
    #[error("Context pool has been disposed")]
    PoolDisposed,

    /// No mounted state exists for the instance
    #[error("Instance not mounted: {0}")]
    NotMounted(InstanceId),

    /// A context could not be reached
    #[error("Context unreachable: {0}")]
    ContextUnreachable(ContextId),

    /// The bridge script could not be injected
    #[error("Bridge injection failed: {0}")]
    BridgeInjection(String),
}

/// Errors raised by the instance lifecycle.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The requested transition is not allowed from the current status
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current status
        from: InstanceStatus,
        /// Requested status
        to: InstanceStatus,
    },

    /// The instance has been permanently destroyed
    #[error("Instance destroyed: {0}")]
    Destroyed(InstanceId),

    /// The lifecycle worker stopped before the operation completed
    #[error("Lifecycle queue closed for instance {0}")]
    QueueClosed(InstanceId),
}

/// Errors related to configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the configuration failed
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    /// Parsing the configuration failed
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    /// The configuration is invalid
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A script failure reported by the host's script engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ScriptError {
    /// Message reported by the script engine
    pub message: String,
}

impl ScriptError {
    /// Create a script error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

/// Result type alias for Mosaic operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
