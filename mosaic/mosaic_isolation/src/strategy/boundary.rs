//! Per-instance error boundary.
//!
//! Failures of code running inside the host's own execution context (the
//! `none` and `light` strategies) are attributed to the instance that caused
//! them and recorded, never propagated to the host.

use parking_lot::Mutex;
use std::fmt;
use tracing::error;

/// A failure captured by an [`ErrorBoundary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedError {
    /// What was running, e.g. a script URL or `inline script #2`.
    pub origin: String,

    /// Error message.
    pub message: String,
}

/// Collects failures of one instance.
#[derive(Debug)]
pub struct ErrorBoundary {
    instance: String,
    errors: Mutex<Vec<CapturedError>>,
}

impl ErrorBoundary {
    /// Create a boundary tagged with an instance name.
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Name the boundary is tagged with.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Record a failure.
    pub fn capture(&self, origin: impl Into<String>, err: impl fmt::Display) {
        let captured = CapturedError {
            origin: origin.into(),
            message: err.to_string(),
        };
        error!(
            instance = %self.instance,
            "Uncaught error in {}: {}",
            captured.origin,
            captured.message
        );
        self.errors.lock().push(captured);
    }

    /// Unwrap a result, recording the error and yielding `None` on failure.
    pub fn guard<T, E: fmt::Display>(
        &self,
        origin: impl Into<String>,
        result: Result<T, E>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.capture(origin, e);
                None
            }
        }
    }

    /// Failures recorded so far.
    pub fn errors(&self) -> Vec<CapturedError> {
        self.errors.lock().clone()
    }
}
