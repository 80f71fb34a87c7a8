//! Messages crossing an isolation boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::ContextId;

/// A message delivered by the host from an execution context.
///
/// `source` identifies the context that posted the message and `origin` is
/// the trust origin the host observed for it. Neither is taken from `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Context that posted the message.
    pub source: ContextId,

    /// Declared trust origin of the sender (`"null"` for opaque origins).
    pub origin: String,

    /// JSON payload.
    pub data: Value,
}

impl InboundMessage {
    /// Create a new inbound message.
    pub fn new(source: ContextId, origin: impl Into<String>, data: Value) -> Self {
        Self {
            source,
            origin: origin.into(),
            data,
        }
    }
}
