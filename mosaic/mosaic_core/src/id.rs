//! Strongly-typed identifiers.
//!
//! Each identifier type is a thin wrapper around a UUID with a phantom marker
//! so identifiers for different entities cannot be mixed up. Identifiers
//! serialize as plain UUID strings, which is what crosses the wire.
//!
//! # Examples
//!
//! ```
//! use mosaic_core::id::{ContextId, InstanceId};
//! use std::str::FromStr;
//!
//! let instance_id = InstanceId::new();
//! let context_id = ContextId::new();
//! assert_ne!(instance_id.to_string(), context_id.to_string());
//!
//! let id_str = "550e8400-e29b-41d4-a716-446655440000";
//! let instance_id = InstanceId::from_str(id_str).unwrap();
//! assert_eq!(instance_id.to_string(), id_str);
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use uuid::Uuid;

/// A type-safe identifier based on UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T> {
    uuid: Uuid,
    _marker: PhantomData<T>,
}

impl<T> Id<T> {
    /// Create a new random identifier.
    pub fn new() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// Create an identifier from a specific UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            _marker: PhantomData,
        }
    }

    /// Get the underlying UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Create a nil (all zeros) identifier.
    pub fn nil() -> Self {
        Self::from_uuid(Uuid::nil())
    }

    /// Check if this is a nil identifier.
    pub fn is_nil(&self) -> bool {
        self.uuid.is_nil()
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

impl<T> FromStr for Id<T> {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_uuid(Uuid::parse_str(s)?))
    }
}

impl<T> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.uuid.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Uuid::deserialize(deserializer).map(Self::from_uuid)
    }
}

/// Marker type for embedded sub-application instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceMarker;
/// Identifier for an embedded sub-application instance.
pub type InstanceId = Id<InstanceMarker>;

/// Marker type for isolated execution contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextMarker;
/// Identifier for an isolated execution context.
pub type ContextId = Id<ContextMarker>;

/// Marker type for RPC correlation ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallMarker;
/// Correlation id of an RPC message.
pub type CallId = Id<CallMarker>;
