//! Instance descriptions and snapshots.

use chrono::{DateTime, Utc};
use mosaic_core::error::{ConfigError, Result};
use mosaic_core::id::{ContextId, InstanceId};
use mosaic_core::types::{validate_source, InstanceStatus, IsolationLevel, Priority};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Everything needed to create an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Display name, also the storage namespace under `strict` isolation.
    pub name: String,

    /// Source locator.
    pub source: Url,

    /// Isolation level; the framework default when unset.
    #[serde(default)]
    pub isolation: Option<IsolationLevel>,

    /// Retain the instance when it is detached.
    #[serde(default)]
    pub keep_alive: bool,

    /// Keep-alive priority.
    #[serde(default)]
    pub priority: Priority,

    /// Input properties pushed to the sub-application.
    #[serde(default)]
    pub props: Value,
}

impl InstanceSpec {
    /// Describe an instance with default settings.
    pub fn new(name: impl Into<String>, source: Url) -> Self {
        Self {
            name: name.into(),
            source,
            isolation: None,
            keep_alive: false,
            priority: Priority::Normal,
            props: Value::Null,
        }
    }

    /// Set the isolation level.
    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    /// Enable keep-alive with a priority.
    pub fn with_keep_alive(mut self, priority: Priority) -> Self {
        self.keep_alive = true;
        self.priority = priority;
        self
    }

    /// Set the input properties.
    pub fn with_props(mut self, props: Value) -> Self {
        self.props = props;
        self
    }

    /// Build a spec from the attributes of the declarative element wrapper.
    ///
    /// `src` is required. `sandbox` names the isolation level, `keep-alive`
    /// is a boolean attribute whose value may name a priority, and `name`
    /// defaults to the source path.
    pub fn from_attributes<'a>(
        attributes: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self> {
        let mut source = None;
        let mut name = None;
        let mut isolation = None;
        let mut keep_alive = None;

        for (key, value) in attributes {
            match key {
                "src" => {
                    source = Some(Url::parse(value.trim()).map_err(|e| {
                        ConfigError::Invalid(format!("Invalid src '{}': {}", value, e))
                    })?)
                }
                "name" => name = Some(value.trim().to_string()),
                "sandbox" => isolation = Some(value.parse::<IsolationLevel>()?),
                "keep-alive" => {
                    keep_alive = Some(match value.trim() {
                        "" | "true" => Priority::Normal,
                        "false" => continue,
                        priority => priority.parse::<Priority>()?,
                    })
                }
                _ => {}
            }
        }

        let source =
            source.ok_or_else(|| ConfigError::Invalid("Missing src attribute".to_string()))?;
        validate_source(&source)?;
        let name = name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| source.path().to_string());

        let mut spec = InstanceSpec::new(name, source);
        spec.isolation = isolation;
        if let Some(priority) = keep_alive {
            spec = spec.with_keep_alive(priority);
        }
        Ok(spec)
    }
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSnapshot {
    /// Instance id
    pub id: InstanceId,

    /// Display name
    pub name: String,

    /// Source locator
    pub source: Url,

    /// Effective isolation level
    pub isolation: IsolationLevel,

    /// Lifecycle status
    pub status: InstanceStatus,

    /// Whether keep-alive is enabled
    pub keep_alive: bool,

    /// Keep-alive priority
    pub priority: Priority,

    /// Whether the instance is detached but retained
    pub retained: bool,

    /// Execution context held by the instance
    pub context: Option<ContextId>,

    /// Current input properties
    pub props: Value,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last lifecycle activity
    pub last_active_at: DateTime<Utc>,

    /// Whether the instance was destroyed
    pub destroyed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_core::error::{Error, LoadError};
    use serde_json::json;

    #[test]
    fn test_builder() {
        let spec = InstanceSpec::new("cart", Url::parse("https://shop.example.com/cart").unwrap())
            .with_isolation(IsolationLevel::Light)
            .with_keep_alive(Priority::High)
            .with_props(json!({ "currency": "EUR" }));

        assert_eq!(spec.isolation, Some(IsolationLevel::Light));
        assert!(spec.keep_alive);
        assert_eq!(spec.priority, Priority::High);
        assert_eq!(spec.props["currency"], "EUR");
    }

    #[test]
    fn test_from_attributes() {
        let spec = InstanceSpec::from_attributes([
            ("src", "https://widgets.example.com/weather/"),
            ("sandbox", "remote"),
            ("keep-alive", ""),
            ("class", "ignored"),
        ])
        .unwrap();

        assert_eq!(spec.name, "/weather/");
        assert_eq!(spec.isolation, Some(IsolationLevel::Remote));
        assert!(spec.keep_alive);
        assert_eq!(spec.priority, Priority::Normal);

        let spec = InstanceSpec::from_attributes([
            ("src", "https://widgets.example.com/"),
            ("name", "news"),
            ("keep-alive", "low"),
        ])
        .unwrap();
        assert_eq!(spec.name, "news");
        assert_eq!(spec.isolation, None);
        assert_eq!(spec.priority, Priority::Low);

        assert!(InstanceSpec::from_attributes([("sandbox", "strict")]).is_err());
        assert!(InstanceSpec::from_attributes([("src", "not a url")]).is_err());
        let err = InstanceSpec::from_attributes([("src", "javascript:alert(1)")]).unwrap_err();
        assert!(matches!(err, Error::Load(LoadError::InvalidSource(_))));
        assert!(
            InstanceSpec::from_attributes([("src", "https://a.example/"), ("sandbox", "iframe")])
                .is_err()
        );
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: InstanceSpec =
            serde_json::from_value(json!({ "name": "a", "source": "https://a.example/" })).unwrap();
        assert_eq!(spec.isolation, None);
        assert!(!spec.keep_alive);
        assert_eq!(spec.props, Value::Null);
    }
}
