//! Interfaces for collaborators that live outside Mosaic.
//!
//! Routing, response caching and style propagation are provided by the host
//! application. Mosaic only defines the shape it expects from them.

use async_trait::async_trait;
use mosaic_core::error::Result;
use mosaic_core::id::InstanceId;
use mosaic_core::types::IsolationLevel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

use crate::instance::InstanceSpec;

/// A route resolving to an embedded sub-application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTarget {
    /// Route path, also used as the instance name.
    pub path: String,

    /// Source locator of the sub-application.
    pub source: Url,

    /// Isolation level; the framework default when unset.
    #[serde(default)]
    pub isolation: Option<IsolationLevel>,

    /// Input properties.
    #[serde(default)]
    pub props: Value,
}

impl From<RouteTarget> for InstanceSpec {
    fn from(route: RouteTarget) -> Self {
        let mut spec = InstanceSpec::new(route.path, route.source).with_props(route.props);
        spec.isolation = route.isolation;
        spec
    }
}

/// Host-side navigation.
#[async_trait]
pub trait Navigator: Send + Sync {
    /// Navigate to `route`, adding a history entry.
    async fn push(&self, route: &RouteTarget) -> Result<()>;

    /// Navigate to `route`, replacing the current history entry.
    async fn replace(&self, route: &RouteTarget) -> Result<()>;
}

/// Response cache in front of sub-application sources.
#[async_trait]
pub trait CacheInterceptor: Send + Sync {
    /// Fetch and cache `urls` ahead of use.
    async fn precache(&self, urls: &[Url]) -> Result<()>;

    /// Drop every cached response.
    async fn clear_cache(&self) -> Result<()>;

    /// Drop the cached response for `url`.
    async fn evict(&self, url: &Url) -> Result<()>;
}

/// Pushes host style variables into an instance.
pub trait StyleSync: Send + Sync {
    /// Replace the variables visible to instance `id`.
    fn push_variables(&self, id: InstanceId, variables: &BTreeMap<String, String>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_into_spec() {
        let route = RouteTarget {
            path: "/orders".to_string(),
            source: Url::parse("https://orders.example.com/").unwrap(),
            isolation: Some(IsolationLevel::Remote),
            props: json!({ "page": 2 }),
        };

        let spec: InstanceSpec = route.into();
        assert_eq!(spec.name, "/orders");
        assert_eq!(spec.isolation, Some(IsolationLevel::Remote));
        assert_eq!(spec.props["page"], 2);
        assert!(!spec.keep_alive);
    }
}
