//! Store configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// How requests without a principal are scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnonymousAccess {
    /// Union of generalized permission sets.
    #[default]
    Generalized,
    /// No access at all.
    Deny,
}

/// Configuration for an [`ObjectStore`](crate::ObjectStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Class of the root manager instance.
    pub root_class: String,

    /// Identifier value of the root manager instance.
    pub root_identifier: String,

    /// Identifier field given to classes that declare none.
    pub default_identifier_field: String,

    /// Scope for anonymous principals.
    pub anonymous_access: AnonymousAccess,

    /// Deepest allowed placement below the root. None means unlimited.
    pub max_depth: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_class: "polariManager".to_string(),
            root_identifier: "root".to_string(),
            default_identifier_field: "polariId".to_string(),
            anonymous_access: AnonymousAccess::Generalized,
            max_depth: None,
        }
    }
}

impl StoreConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON; missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the root manager class.
    pub fn root_class(mut self, class_name: impl Into<String>) -> Self {
        self.root_class = class_name.into();
        self
    }

    /// Set the root manager identifier value.
    pub fn root_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.root_identifier = identifier.into();
        self
    }

    /// Set the default identifier field.
    pub fn default_identifier_field(mut self, field: impl Into<String>) -> Self {
        self.default_identifier_field = field.into();
        self
    }

    /// Set the anonymous access mode.
    pub fn anonymous_access(mut self, mode: AnonymousAccess) -> Self {
        self.anonymous_access = mode;
        self
    }

    /// Set the maximum placement depth.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }
}
