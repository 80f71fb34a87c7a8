//! Instance lifecycle status and keep-alive priority.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Lifecycle status of an embedded sub-application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Created but never attached.
    Idle,

    /// Resolving the source and selecting resources.
    Loading,

    /// The strategy is attaching the sub-application.
    Mounting,

    /// Attached and reachable over its message channel.
    Mounted,

    /// Being detached from the host.
    Unmounting,

    /// Detached; possibly retained for a fast restore.
    Unmounted,

    /// Loading or mounting failed.
    Error,
}

impl InstanceStatus {
    /// Check whether the state machine allows moving to `next`.
    ///
    /// `Unmounted` only goes back to `Mounting` (restore) or `Loading` (full
    /// remount) through an explicit re-attach, and `Error` is only reachable
    /// from `Loading` or `Mounting`.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;

        matches!(
            (self, next),
            (Idle, Loading)
                | (Loading, Mounting)
                | (Loading, Error)
                | (Mounting, Mounted)
                | (Mounting, Error)
                | (Mounted, Unmounting)
                | (Unmounting, Unmounted)
                | (Unmounted, Mounting)
                | (Unmounted, Loading)
                | (Error, Loading)
                | (Error, Unmounted)
        )
    }

    /// Whether a mount is in flight.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Loading | Self::Mounting | Self::Unmounting)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Mounting => "mounting",
            Self::Mounted => "mounted",
            Self::Unmounting => "unmounting",
            Self::Unmounted => "unmounted",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Retention priority of a kept-alive instance.
///
/// Ordered so that `Low < Normal < High`; eviction picks the smallest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// First to be evicted. Only ever set explicitly.
    Low,

    /// Default priority.
    #[default]
    Normal,

    /// Frequently visited or pinned by the host.
    High,
}

impl FromStr for Priority {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(ConfigError::Invalid(format!("Unknown priority '{}'", other))),
        }
    }
}
