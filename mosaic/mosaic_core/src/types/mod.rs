//! Data structures shared across the Mosaic crates.

pub mod content;
pub mod instance;
pub mod isolation;
pub mod message;

pub use content::{validate_source, ContentNode, ScriptBlock, ScriptSource, SOURCE_SCHEMES};
pub use instance::{InstanceStatus, Priority};
pub use isolation::{IsolationLevel, Presentation, SandboxPolicy};
pub use message::InboundMessage;
