use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// An evaluation context: the identity and attributes a flag is evaluated against.
///
/// ```
/// # use flagpulse::Context;
/// let context = Context::new("user-key").with_attribute("plan", "enterprise");
/// assert_eq!(context.key(), "user-key");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    kind: String,
    key: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    attributes: HashMap<String, serde_json::Value>,
}

impl Context {
    /// Context kind used when none is specified.
    pub const DEFAULT_KIND: &'static str = "user";

    /// Create a context of the default kind.
    pub fn new(key: impl Into<String>) -> Context {
        Context::with_kind(Context::DEFAULT_KIND, key)
    }

    /// Create a context of a specific kind (e.g., "organization" or "device").
    pub fn with_kind(kind: impl Into<String>, key: impl Into<String>) -> Context {
        Context {
            kind: kind.into(),
            key: key.into(),
            attributes: HashMap::new(),
        }
    }

    /// Add or replace a custom attribute.
    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Context {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Context kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Context key, unique within its kind.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Custom attributes.
    pub fn attributes(&self) -> &HashMap<String, serde_json::Value> {
        &self.attributes
    }

    /// Key used to recognize the same context across events. Unlike `key()`, it is unique across
    /// kinds.
    pub(crate) fn canonical_key(&self) -> String {
        if self.kind == Context::DEFAULT_KIND {
            self.key.clone()
        } else {
            format!("{}:{}", self.kind, self.key)
        }
    }
}
