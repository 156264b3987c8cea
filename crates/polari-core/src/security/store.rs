//! In-memory permission set storage.

use super::permission_set::PermissionSet;
use super::principal::{Principal, PrincipalDirectory};
use crate::error::{Error, Result};
use crate::typing::TypingRegistry;
use dashmap::DashMap;
use tracing::info;

/// Permission sets keyed by name.
#[derive(Debug, Default)]
pub struct PermissionStore {
    sets: DashMap<String, PermissionSet>,
}

impl PermissionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and save a permission set, replacing one with the same name.
    ///
    /// The class must be registered, every mentioned field declared on it,
    /// and every assigned user and group known to `directory`.
    pub fn put(
        &self,
        set: PermissionSet,
        registry: &TypingRegistry,
        directory: &dyn PrincipalDirectory,
    ) -> Result<()> {
        if set.name.is_empty() {
            return Err(Error::validation("name", "permission set name must not be empty"));
        }
        let typing = registry.require(&set.api_object)?;
        if let Some(field) = set.mentioned_fields().iter().find(|f| !typing.declares(f)) {
            return Err(Error::validation(
                format!("{}.{}.{}", set.name, set.api_object, field),
                "field is not declared",
            ));
        }
        if let Some(user) = set
            .assigned_users
            .iter()
            .find(|u| !directory.user_exists(u))
        {
            return Err(Error::validation(
                format!("{}.assigned_users.{}", set.name, user),
                "unknown user",
            ));
        }
        if let Some(group) = set
            .assigned_user_groups
            .iter()
            .find(|g| !directory.group_exists(g))
        {
            return Err(Error::validation(
                format!("{}.assigned_user_groups.{}", set.name, group),
                "unknown group",
            ));
        }

        info!(
            name = %set.name,
            class = %set.api_object,
            generalized = set.is_generalized,
            "permission set stored"
        );
        self.sets.insert(set.name.clone(), set);
        Ok(())
    }

    /// Get a copy of a set by name.
    pub fn get(&self, name: &str) -> Option<PermissionSet> {
        self.sets.get(name).map(|s| s.value().clone())
    }

    /// Remove a set.
    pub fn remove(&self, name: &str) -> bool {
        self.sets.remove(name).is_some()
    }

    /// Number of stored sets.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Every set, ordered by name.
    pub fn all(&self) -> Vec<PermissionSet> {
        let mut sets: Vec<PermissionSet> = self.sets.iter().map(|s| s.value().clone()).collect();
        sets.sort_by(|a, b| a.name.cmp(&b.name));
        sets
    }

    /// Sets that apply to `principal`, ordered by name.
    pub fn applicable(&self, principal: Option<&Principal>) -> Vec<PermissionSet> {
        self.all()
            .into_iter()
            .filter(|s| s.applies_to(principal))
            .collect()
    }

    /// Sets granting anything on `class_name`, ordered by name.
    pub fn for_class(&self, class_name: &str) -> Vec<PermissionSet> {
        self.all()
            .into_iter()
            .filter(|s| s.api_object == class_name)
            .collect()
    }
}
