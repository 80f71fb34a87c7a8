//! Isolation levels and the sandbox policies they map to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// How strongly a sub-application is isolated from the host.
///
/// Levels are ordered from weakest to strongest isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Content attached directly into the host; scripts run in the host context.
    None,

    /// Nested content boundary plus an intercepted script scope.
    Light,

    /// Pooled execution context with an injected bridge, same trust origin.
    Strict,

    /// Fresh execution context with an opaque trust origin, messages only.
    Remote,
}

impl IsolationLevel {
    /// All levels, weakest first.
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::None,
        IsolationLevel::Light,
        IsolationLevel::Strict,
        IsolationLevel::Remote,
    ];

    /// Name used in configuration and wrapper attributes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Light => "light",
            Self::Strict => "strict",
            Self::Remote => "remote",
        }
    }
}

impl Default for IsolationLevel {
    fn default() -> Self {
        Self::Strict
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "light" => Ok(Self::Light),
            "strict" => Ok(Self::Strict),
            "remote" => Ok(Self::Remote),
            other => Err(ConfigError::Invalid(format!(
                "Unknown isolation level '{}'",
                other
            ))),
        }
    }
}

/// Presentation of an execution context inside the host layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presentation {
    /// Laid out inline inside its container.
    Inline,

    /// Temporarily promoted to cover the full viewport.
    FullViewport,
}

/// Sandbox grants applied to an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Scripts may run.
    pub allow_scripts: bool,

    /// The context keeps the trust origin of its source.
    pub allow_same_origin: bool,

    /// Forms may be submitted.
    pub allow_forms: bool,

    /// Popups may be opened.
    pub allow_popups: bool,

    /// Modal dialogs may be shown.
    pub allow_modals: bool,
}

impl SandboxPolicy {
    /// Grants used by `strict` isolation.
    pub fn same_origin() -> Self {
        Self {
            allow_scripts: true,
            allow_same_origin: true,
            allow_forms: true,
            allow_popups: true,
            allow_modals: true,
        }
    }

    /// Grants used by `remote` isolation: everything except same-origin.
    pub fn opaque() -> Self {
        Self {
            allow_same_origin: false,
            ..Self::same_origin()
        }
    }

    /// Render the policy as a space-separated token list.
    pub fn to_tokens(&self) -> String {
        let mut tokens = Vec::new();
        if self.allow_scripts {
            tokens.push("allow-scripts");
        }
        if self.allow_same_origin {
            tokens.push("allow-same-origin");
        }
        if self.allow_forms {
            tokens.push("allow-forms");
        }
        if self.allow_popups {
            tokens.push("allow-popups");
        }
        if self.allow_modals {
            tokens.push("allow-modals");
        }
        tokens.join(" ")
    }
}
