//! Declarative permission sets.

use super::principal::Principal;
use super::query_dict::{FieldScope, OpKind};
use crate::query::{AttributeFilter, InstanceScope};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A grant of operations on one class to users and groups.
///
/// An operation listed in `allow_all` covers every field; one listed in
/// `specific_fields` covers only those fields. The optional `filter`
/// narrows which instances the grant covers. Generalized sets apply to
/// every principal, including anonymous ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionSet {
    /// Unique name.
    pub name: String,
    /// Class the grant is about.
    pub api_object: String,
    /// Applies to everyone.
    #[serde(default)]
    pub is_generalized: bool,
    /// Users the set is assigned to.
    #[serde(default)]
    pub assigned_users: BTreeSet<String>,
    /// Groups the set is assigned to.
    #[serde(default)]
    pub assigned_user_groups: BTreeSet<String>,
    /// Operations granted on every field.
    #[serde(default)]
    pub allow_all: BTreeSet<OpKind>,
    /// Operations granted on specific fields only.
    #[serde(default)]
    pub specific_fields: BTreeMap<OpKind, BTreeSet<String>>,
    /// Instance filter; `None` covers every instance.
    #[serde(default)]
    pub filter: Option<AttributeFilter>,
}

impl PermissionSet {
    /// Create an empty set for a class.
    pub fn new(name: impl Into<String>, api_object: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_object: api_object.into(),
            is_generalized: false,
            assigned_users: BTreeSet::new(),
            assigned_user_groups: BTreeSet::new(),
            allow_all: BTreeSet::new(),
            specific_fields: BTreeMap::new(),
            filter: None,
        }
    }

    /// Make the set apply to every principal.
    pub fn generalized(mut self) -> Self {
        self.is_generalized = true;
        self
    }

    /// Assign to a user.
    pub fn assign_user(mut self, user_id: impl Into<String>) -> Self {
        self.assigned_users.insert(user_id.into());
        self
    }

    /// Assign to a group.
    pub fn assign_group(mut self, group: impl Into<String>) -> Self {
        self.assigned_user_groups.insert(group.into());
        self
    }

    /// Grant an operation on every field.
    pub fn allow(mut self, op: OpKind) -> Self {
        self.allow_all.insert(op);
        self
    }

    /// Grant an operation on specific fields.
    pub fn allow_fields<S: Into<String>>(
        mut self,
        op: OpKind,
        fields: impl IntoIterator<Item = S>,
    ) -> Self {
        self.specific_fields
            .entry(op)
            .or_default()
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Narrow the grant to matching instances.
    pub fn with_filter(mut self, filter: AttributeFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Check whether this set applies to `principal` (`None` is anonymous).
    pub fn applies_to(&self, principal: Option<&Principal>) -> bool {
        if self.is_generalized {
            return true;
        }
        match principal {
            None => false,
            Some(p) => {
                self.assigned_users.contains(&p.user_id)
                    || self.assigned_user_groups.iter().any(|g| p.in_group(g))
            }
        }
    }

    /// Granted operations with their field scopes.
    pub fn grants(&self) -> BTreeMap<OpKind, FieldScope> {
        let mut out = BTreeMap::new();
        for (op, fields) in &self.specific_fields {
            out.insert(*op, FieldScope::Fields(fields.clone()));
        }
        for op in &self.allow_all {
            out.insert(*op, FieldScope::All);
        }
        out
    }

    /// Instances the grant covers.
    pub fn instance_scope(&self) -> InstanceScope {
        match &self.filter {
            Some(filter) => InstanceScope::filtered(filter.clone()),
            None => InstanceScope::All,
        }
    }

    /// Every field name the set mentions.
    pub fn mentioned_fields(&self) -> BTreeSet<String> {
        let mut fields: BTreeSet<String> = self.specific_fields.values().flatten().cloned().collect();
        if let Some(filter) = &self.filter {
            fields.extend(crate::query::extract_filter_fields(filter));
        }
        fields
    }
}
