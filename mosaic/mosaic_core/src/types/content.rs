//! Content nodes and scripts handed to the host's content tree.
//!
//! Sub-application markup is never injected as raw text. It is parsed into
//! `ContentNode` values which the host materializes node by node, and its
//! scripts are extracted into `ScriptBlock`s executed through the host's
//! script engine.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::LoadError;

/// A node in the host's content tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentNode {
    /// An element with attributes and children.
    Element {
        /// Lower-case tag name.
        tag: String,
        /// Attributes in document order.
        attributes: Vec<(String, String)>,
        /// Child nodes.
        children: Vec<ContentNode>,
    },

    /// A text node.
    Text(String),

    /// A style sheet body.
    Style(String),
}

impl ContentNode {
    /// Create an element without attributes or children.
    pub fn element(tag: impl Into<String>) -> Self {
        Self::Element {
            tag: tag.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Tag name if this is an element.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }

    /// Look up an attribute value if this is an element.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        match self {
            Self::Element { attributes, .. } => attributes
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }

    /// Concatenated text of this node and its descendants.
    pub fn text_content(&self) -> String {
        match self {
            Self::Element { children, .. } => {
                children.iter().map(ContentNode::text_content).collect()
            }
            Self::Text(text) => text.clone(),
            Self::Style(_) => String::new(),
        }
    }
}

/// Where a script's code comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptSource {
    /// Code embedded in the document.
    Inline(String),

    /// Code that has to be fetched first.
    External(Url),
}

/// A script ready to be executed by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptBlock {
    /// Code to run.
    pub code: String,

    /// URL the code was fetched from, if it was external.
    pub url: Option<Url>,

    /// Whether the script is an ES module.
    pub module: bool,
}

impl ScriptBlock {
    /// Create an inline script block.
    pub fn inline(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            url: None,
            module: false,
        }
    }
}

/// URL schemes a sub-application may be loaded from.
pub const SOURCE_SCHEMES: &[&str] = &["http", "https"];

/// Reject source locators that cannot name a loadable document.
///
/// Only hierarchical `http`/`https` URLs with a host are accepted;
/// `javascript:`, `data:`, `blob:` and `file:` locators are refused.
pub fn validate_source(source: &Url) -> Result<(), LoadError> {
    if !SOURCE_SCHEMES.contains(&source.scheme()) {
        return Err(LoadError::InvalidSource(format!(
            "Unsupported scheme '{}' in {}",
            source.scheme(),
            source
        )));
    }
    if source.cannot_be_a_base() || source.host_str().map_or(true, str::is_empty) {
        return Err(LoadError::InvalidSource(format!("Missing host in {}", source)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_source() {
        for ok in ["https://apps.example.com/a/", "http://localhost:8080/index.html"] {
            assert!(validate_source(&Url::parse(ok).unwrap()).is_ok(), "{}", ok);
        }

        for bad in [
            "javascript:alert(document.cookie)",
            "data:text/html,<script>alert(1)</script>",
            "blob:https://apps.example.com/0d7c",
            "file:///etc/passwd",
            "about:blank",
        ] {
            assert!(
                matches!(
                    validate_source(&Url::parse(bad).unwrap()),
                    Err(LoadError::InvalidSource(_))
                ),
                "{}",
                bad
            );
        }
    }
}
