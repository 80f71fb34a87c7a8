//! Lifecycle events published by instance controllers.

use mosaic_core::id::InstanceId;
use mosaic_core::types::InstanceStatus;
use serde::Serialize;

/// Capacity of each controller's event channel.
pub(crate) const EVENT_CAPACITY: usize = 64;

/// Something that happened to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The lifecycle status changed.
    StatusChanged {
        /// Instance
        id: InstanceId,
        /// Previous status
        from: InstanceStatus,
        /// New status
        to: InstanceStatus,
    },

    /// Loading or mounting failed.
    Error {
        /// Instance
        id: InstanceId,
        /// Failure description
        message: String,
    },

    /// The message channel is open.
    RpcReady {
        /// Instance
        id: InstanceId,
    },

    /// The instance was detached and retained.
    KeepAliveStart {
        /// Instance
        id: InstanceId,
    },

    /// A retained instance was attached again.
    KeepAliveRestore {
        /// Instance
        id: InstanceId,
    },

    /// A retained instance was evicted and its resources released.
    Evicted {
        /// Instance
        id: InstanceId,
    },
}

impl LifecycleEvent {
    /// The instance the event is about.
    pub fn instance(&self) -> InstanceId {
        match self {
            Self::StatusChanged { id, .. }
            | Self::Error { id, .. }
            | Self::RpcReady { id }
            | Self::KeepAliveStart { id }
            | Self::KeepAliveRestore { id }
            | Self::Evicted { id } => *id,
        }
    }

    /// Name of the matching event on the declarative element wrapper.
    pub fn dom_name(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "mosaic:status",
            Self::Error { .. } => "mosaic:error",
            Self::RpcReady { .. } => "mosaic:rpc-ready",
            Self::KeepAliveStart { .. } => "mosaic:keep-alive-start",
            Self::KeepAliveRestore { .. } => "mosaic:keep-alive-restore",
            Self::Evicted { .. } => "mosaic:evicted",
        }
    }
}
