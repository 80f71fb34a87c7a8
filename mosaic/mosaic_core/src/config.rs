//! Framework configuration.
//!
//! Configuration is plain serde data with defaults for every field, so a
//! partial file only overrides what it names. Files ending in `.toml` are read
//! as TOML, anything else as JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ConfigError, Result};
use crate::types::IsolationLevel;

/// Execution context pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Contexts created eagerly and replenished toward.
    #[serde(default = "default_initial_size")]
    pub initial_size: usize,

    /// Soft upper bound on pooled contexts.
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Maximum number of kept-alive instances.
    #[serde(default = "default_max_alive")]
    pub max_alive: usize,
}

fn default_initial_size() -> usize {
    3
}

fn default_max_size() -> usize {
    10
}

fn default_max_alive() -> usize {
    5
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: default_initial_size(),
            max_size: default_max_size(),
            max_alive: default_max_alive(),
        }
    }
}

/// Keep-alive retention policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// Visits after which a `normal` entry is promoted to `high`.
    #[serde(default = "default_auto_promote_after")]
    pub auto_promote_after: u32,
}

fn default_auto_promote_after() -> u32 {
    3
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            auto_promote_after: default_auto_promote_after(),
        }
    }
}

/// Framework-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkConfig {
    /// Isolation level used when an instance does not name one.
    #[serde(default)]
    pub default_sandbox: IsolationLevel,

    /// Time allowed for a mount to settle.
    #[serde(default = "default_timeout_ms")]
    pub load_timeout_ms: u64,

    /// Default per-call RPC timeout.
    #[serde(default = "default_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Keep-alive policy.
    #[serde(default)]
    pub keep_alive: KeepAliveConfig,

    /// Log filter used by `init_logging`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            default_sandbox: IsolationLevel::default(),
            load_timeout_ms: default_timeout_ms(),
            rpc_timeout_ms: default_timeout_ms(),
            pool: PoolConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl FrameworkConfig {
    /// Load configuration from a file, or use defaults when `path` is `None`.
    ///
    /// A missing file is not an error: a warning is logged and defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());

                let content = std::fs::read_to_string(path).map_err(|e| {
                    ConfigError::LoadFailed(format!("{}: {}", path.display(), e))
                })?;

                if path.extension().and_then(|ext| ext.to_str()) == Some("toml") {
                    Self::from_toml_str(&content)?
                } else {
                    Self::from_json_str(&content)?
                }
            }
            Some(path) => {
                warn!("Configuration file not found: {}", path.display());
                Self::default()
            }
            None => {
                info!("No configuration file specified, using defaults");
                Self::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document.
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.load_timeout_ms == 0 {
            return Err(ConfigError::Invalid("Load timeout cannot be zero".to_string()).into());
        }

        if self.rpc_timeout_ms == 0 {
            return Err(ConfigError::Invalid("RPC timeout cannot be zero".to_string()).into());
        }

        if self.pool.max_size == 0 {
            return Err(ConfigError::Invalid("Pool max size cannot be zero".to_string()).into());
        }

        if self.pool.initial_size > self.pool.max_size {
            return Err(ConfigError::Invalid(format!(
                "Pool initial size {} exceeds max size {}",
                self.pool.initial_size, self.pool.max_size
            ))
            .into());
        }

        if self.pool.max_alive == 0 {
            return Err(ConfigError::Invalid("Max alive cannot be zero".to_string()).into());
        }

        if self.keep_alive.auto_promote_after == 0 {
            return Err(
                ConfigError::Invalid("Auto-promote threshold cannot be zero".to_string()).into(),
            );
        }

        Ok(())
    }

    /// Overlay every field of `other` that differs from the defaults.
    pub fn merge(&mut self, other: FrameworkConfig) {
        let defaults = FrameworkConfig::default();

        if other.default_sandbox != defaults.default_sandbox {
            self.default_sandbox = other.default_sandbox;
        }
        if other.load_timeout_ms != defaults.load_timeout_ms {
            self.load_timeout_ms = other.load_timeout_ms;
        }
        if other.rpc_timeout_ms != defaults.rpc_timeout_ms {
            self.rpc_timeout_ms = other.rpc_timeout_ms;
        }
        if other.pool.initial_size != defaults.pool.initial_size {
            self.pool.initial_size = other.pool.initial_size;
        }
        if other.pool.max_size != defaults.pool.max_size {
            self.pool.max_size = other.pool.max_size;
        }
        if other.pool.max_alive != defaults.pool.max_alive {
            self.pool.max_alive = other.pool.max_alive;
        }
        if other.keep_alive.auto_promote_after != defaults.keep_alive.auto_promote_after {
            self.keep_alive.auto_promote_after = other.keep_alive.auto_promote_after;
        }
        if other.log_level != defaults.log_level {
            self.log_level = other.log_level;
        }
    }

    /// Load timeout as a `Duration`.
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// RPC timeout as a `Duration`.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = FrameworkConfig::default();
        assert_eq!(config.default_sandbox, IsolationLevel::Strict);
        assert_eq!(config.load_timeout_ms, 10_000);
        assert_eq!(config.rpc_timeout_ms, 10_000);
        assert_eq!(config.pool.initial_size, 3);
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.pool.max_alive, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "default_sandbox": "light", "rpc_timeout_ms": 2500, "pool": {{ "max_size": 4 }} }}"#
        )
        .unwrap();

        let config = FrameworkConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.default_sandbox, IsolationLevel::Light);
        assert_eq!(config.rpc_timeout_ms, 2500);
        assert_eq!(config.pool.max_size, 4);
        // Untouched fields keep their defaults
        assert_eq!(config.pool.initial_size, 3);
        assert_eq!(config.load_timeout_ms, 10_000);
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "default_sandbox = \"remote\"").unwrap();
        writeln!(file, "[pool]").unwrap();
        writeln!(file, "initial_size = 1").unwrap();
        writeln!(file, "max_alive = 2").unwrap();

        let config = FrameworkConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.default_sandbox, IsolationLevel::Remote);
        assert_eq!(config.pool.initial_size, 1);
        assert_eq!(config.pool.max_alive, 2);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = FrameworkConfig::load(Some(Path::new("/nonexistent/mosaic.json"))).unwrap();
        assert_eq!(config, FrameworkConfig::default());
    }

    #[test]
    fn test_validation() {
        let mut config = FrameworkConfig::default();
        config.pool.initial_size = 11;
        assert!(config.validate().is_err());

        let mut config = FrameworkConfig::default();
        config.rpc_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = FrameworkConfig::default();
        config.pool.max_alive = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_config() {
        let mut base = FrameworkConfig::default();

        let mut override_config = FrameworkConfig::default();
        override_config.load_timeout_ms = 3000;
        override_config.pool.max_alive = 8;

        base.merge(override_config);

        assert_eq!(base.load_timeout_ms, 3000);
        assert_eq!(base.pool.max_alive, 8);
        assert_eq!(base.rpc_timeout_ms, 10_000);
    }
}
