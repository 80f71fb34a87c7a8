//! # Mosaic Channel
//!
//! `mosaic_channel` carries typed request/response calls and fire-and-forget
//! events across an isolation boundary as plain JSON messages.
//!
//! Key concepts:
//!
//! 1. **Protocol**: A tagged JSON union (`call`, `result`, `error`, `event`)
//!    marked with a protocol discriminator so foreign messages are ignored.
//!
//! 2. **Message Hub**: The single entry point through which the host delivers
//!    inbound messages. Strategies subscribe to it per instance.
//!
//! 3. **Message Channel**: Correlates calls with responses, enforces call
//!    timeouts and drops messages from unexpected senders or origins.
//!
//! 4. **Trust Origins**: Helpers for deriving and comparing the origin a
//!    message is restricted to.

pub mod channel;
pub mod hub;
pub mod origin;
pub mod protocol;

pub use channel::{ChannelEndpoint, ChannelOptions, ListenerId, MessageChannel};
pub use hub::{InboundHandler, MessageHub, Subscription};
pub use origin::{origin_of, ANY_ORIGIN, LOCAL_ORIGIN, OPAQUE_ORIGIN};
pub use protocol::{RpcMessage, PROTOCOL_MARKER};
