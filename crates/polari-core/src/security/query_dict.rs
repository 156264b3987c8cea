//! Operation kinds and the per-principal access and permission dicts.

use crate::query::InstanceScope;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The five CRUDE operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Create instances.
    #[serde(rename = "C")]
    Create,
    /// Read instances.
    #[serde(rename = "R")]
    Read,
    /// Update one instance.
    #[serde(rename = "U")]
    Update,
    /// Delete one instance.
    #[serde(rename = "D")]
    Delete,
    /// Fire an event on one instance.
    #[serde(rename = "E")]
    Event,
}

impl OpKind {
    /// All operation kinds in CRUDE order.
    pub const ALL: [OpKind; 5] = [
        OpKind::Create,
        OpKind::Read,
        OpKind::Update,
        OpKind::Delete,
        OpKind::Event,
    ];

    /// Single-letter code.
    pub fn letter(&self) -> &'static str {
        match self {
            OpKind::Create => "C",
            OpKind::Read => "R",
            OpKind::Update => "U",
            OpKind::Delete => "D",
            OpKind::Event => "E",
        }
    }

    /// Parse a single-letter code.
    pub fn from_letter(letter: &str) -> Option<Self> {
        OpKind::ALL.into_iter().find(|op| op.letter() == letter)
    }

    /// Whether the operation must target exactly one instance.
    pub fn is_singular(&self) -> bool {
        matches!(self, OpKind::Update | OpKind::Delete | OpKind::Event)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}

/// Which fields of a class a grant covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldScope {
    /// Every field.
    All,
    /// Only the listed fields.
    Fields(BTreeSet<String>),
}

impl FieldScope {
    /// Scope over the given fields.
    pub fn fields<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        FieldScope::Fields(fields.into_iter().map(Into::into).collect())
    }

    /// Widen this scope with another.
    pub fn union(&mut self, other: FieldScope) {
        match other {
            FieldScope::All => *self = FieldScope::All,
            FieldScope::Fields(theirs) => {
                if let FieldScope::Fields(mine) = self {
                    mine.extend(theirs);
                }
            }
        }
    }

    /// Check if a field is covered.
    pub fn allows(&self, field: &str) -> bool {
        match self {
            FieldScope::All => true,
            FieldScope::Fields(fields) => fields.contains(field),
        }
    }

    /// Keep only the covered fields.
    pub fn project(&self, fields: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        fields
            .iter()
            .filter(|(k, _)| self.allows(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Encode as `"*"` or a sorted field list.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldScope::All => serde_json::Value::String("*".into()),
            FieldScope::Fields(fields) => serde_json::json!(fields),
        }
    }
}

/// Per operation and class, the instances a principal may touch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessQueryDict(BTreeMap<OpKind, BTreeMap<String, InstanceScope>>);

impl AccessQueryDict {
    /// Create an empty dict (no access at all).
    pub fn new() -> Self {
        Self::default()
    }

    /// Union a scope into `op`/`class_name`.
    pub fn grant(&mut self, op: OpKind, class_name: impl Into<String>, scope: InstanceScope) {
        self.0
            .entry(op)
            .or_default()
            .entry(class_name.into())
            .and_modify(|existing| existing.union(scope.clone()))
            .or_insert(scope);
    }

    /// Scope for `op` on `class_name`, if granted.
    pub fn scope(&self, op: OpKind, class_name: &str) -> Option<&InstanceScope> {
        self.0.get(&op).and_then(|classes| classes.get(class_name))
    }

    /// Classes with any grant for `op`.
    pub fn classes(&self, op: OpKind) -> Vec<&str> {
        self.0
            .get(&op)
            .map(|classes| classes.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Check if nothing is granted.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }

    /// Iterate over `(op, class, scope)`.
    pub fn iter(&self) -> impl Iterator<Item = (OpKind, &str, &InstanceScope)> {
        self.0.iter().flat_map(|(op, classes)| {
            classes
                .iter()
                .map(move |(class, scope)| (*op, class.as_str(), scope))
        })
    }

    /// Encode as `{"R": {"Order": "*"}}`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for (op, classes) in &self.0 {
            let classes: serde_json::Map<String, serde_json::Value> = classes
                .iter()
                .map(|(class, scope)| (class.clone(), scope.to_json()))
                .collect();
            out.insert(op.letter().to_string(), serde_json::Value::Object(classes));
        }
        serde_json::Value::Object(out)
    }
}

/// Per operation and class, the fields a principal may touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionQueryDict(BTreeMap<OpKind, BTreeMap<String, FieldScope>>);

impl PermissionQueryDict {
    /// Create an empty dict.
    pub fn new() -> Self {
        Self::default()
    }

    /// Union a field scope into `op`/`class_name`.
    pub fn grant(&mut self, op: OpKind, class_name: impl Into<String>, scope: FieldScope) {
        self.0
            .entry(op)
            .or_default()
            .entry(class_name.into())
            .and_modify(|existing| existing.union(scope.clone()))
            .or_insert(scope);
    }

    /// Field scope for `op` on `class_name`, if granted.
    pub fn scope(&self, op: OpKind, class_name: &str) -> Option<&FieldScope> {
        self.0.get(&op).and_then(|classes| classes.get(class_name))
    }

    /// Check if nothing is granted.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }

    /// Encode as `{"R": {"Order": ["a", "b"]}}`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for (op, classes) in &self.0 {
            let classes: serde_json::Map<String, serde_json::Value> = classes
                .iter()
                .map(|(class, scope)| (class.clone(), scope.to_json()))
                .collect();
            out.insert(op.letter().to_string(), serde_json::Value::Object(classes));
        }
        serde_json::Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::AttributeFilter;

    #[test]
    fn test_op_letters() {
        for op in OpKind::ALL {
            assert_eq!(OpKind::from_letter(op.letter()), Some(op));
        }
        assert_eq!(OpKind::from_letter("X"), None);
        assert!(OpKind::Delete.is_singular());
        assert!(!OpKind::Read.is_singular());
    }

    #[test]
    fn test_field_scope_union() {
        let mut scope = FieldScope::fields(["a"]);
        scope.union(FieldScope::fields(["b"]));
        assert!(scope.allows("a") && scope.allows("b"));
        assert!(!scope.allows("c"));

        scope.union(FieldScope::All);
        assert!(scope.allows("c"));

        let mut all = FieldScope::All;
        all.union(FieldScope::fields(["x"]));
        assert_eq!(all, FieldScope::All);
    }

    #[test]
    fn test_access_dict_grant_unions() {
        let mut dict = AccessQueryDict::new();
        assert!(dict.is_empty());
        dict.grant(
            OpKind::Read,
            "Order",
            InstanceScope::filtered(AttributeFilter::new().eq("status", "open")),
        );
        dict.grant(OpKind::Read, "Order", InstanceScope::All);
        assert_eq!(dict.scope(OpKind::Read, "Order"), Some(&InstanceScope::All));
        assert!(dict.scope(OpKind::Update, "Order").is_none());
        assert_eq!(dict.to_json(), serde_json::json!({"R": {"Order": "*"}}));
    }

    #[test]
    fn test_permission_dict_json() {
        let mut dict = PermissionQueryDict::new();
        dict.grant(OpKind::Read, "Order", FieldScope::fields(["b"]));
        dict.grant(OpKind::Read, "Order", FieldScope::fields(["a"]));
        assert_eq!(dict.to_json(), serde_json::json!({"R": {"Order": ["a", "b"]}}));
    }
}
