//! Principals and the directory that knows which users and groups exist.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An authenticated user and the groups they belong to.
///
/// Anonymous requests carry no principal at all (`Option<&Principal>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// User id.
    pub user_id: String,
    /// Group names.
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl Principal {
    /// Create a principal with no groups.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            groups: BTreeSet::new(),
        }
    }

    /// Add a group membership.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    /// Check group membership.
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

/// Source of truth for which users and groups exist.
pub trait PrincipalDirectory: Send + Sync {
    /// Check if a user exists.
    fn user_exists(&self, user_id: &str) -> bool;

    /// Check if a group exists.
    fn group_exists(&self, group: &str) -> bool;
}

/// Directory backed by in-memory sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryDirectory {
    #[serde(default)]
    users: BTreeSet<String>,
    #[serde(default)]
    groups: BTreeSet<String>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.users.insert(user_id.into());
        self
    }

    /// Add a group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }
}

impl PrincipalDirectory for InMemoryDirectory {
    fn user_exists(&self, user_id: &str) -> bool {
        self.users.contains(user_id)
    }

    fn group_exists(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}
