//! Wire protocol of the message channel.
//!
//! Messages are JSON objects of the form
//! `{"__mosaic_rpc": true, "type": "call", "id": "<uuid>", ...}`. The marker
//! separates channel traffic from anything else a context may post.

use mosaic_core::error::RpcError;
use mosaic_core::id::CallId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol discriminator carried by every channel message.
pub const PROTOCOL_MARKER: &str = "__mosaic_rpc";

/// A channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RpcMessage {
    /// Invoke an exposed method.
    Call {
        /// Correlation id
        id: CallId,
        /// Method name
        method: String,
        /// Positional arguments
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Successful completion of a call.
    Result {
        /// Correlation id of the call
        id: CallId,
        /// Returned value
        #[serde(default)]
        value: Value,
    },

    /// Failed completion of a call.
    Error {
        /// Correlation id of the call
        id: CallId,
        /// Failure description
        message: String,
    },

    /// Fire-and-forget notification.
    Event {
        /// Message id
        id: CallId,
        /// Event name
        name: String,
        /// Event data
        #[serde(default)]
        payload: Value,
    },
}

impl RpcMessage {
    /// Correlation id of the message.
    pub fn id(&self) -> CallId {
        match self {
            Self::Call { id, .. }
            | Self::Result { id, .. }
            | Self::Error { id, .. }
            | Self::Event { id, .. } => *id,
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Event { .. } => "event",
        }
    }

    /// Encode into a marked JSON object.
    pub fn encode(&self) -> Result<Value, RpcError> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert(PROTOCOL_MARKER.to_string(), Value::Bool(true));
        }
        Ok(value)
    }

    /// Decode a JSON value, returning `None` for anything that is not a
    /// well-formed channel message.
    pub fn decode(data: &Value) -> Option<Self> {
        let object = data.as_object()?;
        if object.get(PROTOCOL_MARKER) != Some(&Value::Bool(true)) {
            return None;
        }
        serde_json::from_value(data.clone()).ok()
    }
}
