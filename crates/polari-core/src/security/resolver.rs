//! CRUDE access resolution.
//!
//! Scopes come from the union of every applicable [`PermissionSet`]: an
//! operation is granted if any set grants it, and the covered instances and
//! fields are the union across those sets. Anonymous principals only see
//! generalized sets, or nothing when [`AnonymousAccess::Deny`] is configured.
//!
//! [`PermissionSet`]: super::PermissionSet

use super::principal::Principal;
use super::query_dict::{AccessQueryDict, FieldScope, OpKind, PermissionQueryDict};
use super::store::PermissionStore;
use crate::config::AnonymousAccess;
use crate::error::{Error, Result};
use crate::query::{extract_filter_fields, select_in_scope, AttributeFilter, InstanceScope};
use crate::tree::{InstanceHandle, ObjectTree};
use crate::typing::{ObjectTyping, TypingRegistry};
use std::collections::BTreeMap;
use tracing::debug;

/// Resolves what a principal may do, and on which instances.
pub struct AccessResolver<'a> {
    registry: &'a TypingRegistry,
    permissions: &'a PermissionStore,
    anonymous_access: AnonymousAccess,
}

impl<'a> AccessResolver<'a> {
    /// Create a resolver with generalized anonymous access.
    pub fn new(registry: &'a TypingRegistry, permissions: &'a PermissionStore) -> Self {
        Self {
            registry,
            permissions,
            anonymous_access: AnonymousAccess::default(),
        }
    }

    /// Set the anonymous access mode.
    pub fn with_anonymous_access(mut self, mode: AnonymousAccess) -> Self {
        self.anonymous_access = mode;
        self
    }

    /// Compute the principal's access and permission dicts.
    pub fn access_and_permission(
        &self,
        principal: Option<&Principal>,
    ) -> (AccessQueryDict, PermissionQueryDict) {
        let mut access = AccessQueryDict::new();
        let mut permission = PermissionQueryDict::new();
        if principal.is_none() && self.anonymous_access == AnonymousAccess::Deny {
            return (access, permission);
        }

        for set in self.permissions.applicable(principal) {
            let scope = set.instance_scope();
            for (op, fields) in set.grants() {
                access.grant(op, set.api_object.clone(), scope.clone());
                permission.grant(op, set.api_object.clone(), fields);
            }
        }
        debug!(
            principal = principal.map(|p| p.user_id.as_str()).unwrap_or("<anonymous>"),
            grants = access.iter().count(),
            "access resolved"
        );
        (access, permission)
    }

    /// Field scope the principal has for `op` on `class_name`.
    pub fn field_scope(
        &self,
        class_name: &str,
        op: OpKind,
        principal: Option<&Principal>,
    ) -> Option<FieldScope> {
        let (_, permission) = self.access_and_permission(principal);
        permission.scope(op, class_name).cloned()
    }

    /// Parse and validate a raw access dict such as
    /// `{"R": {"Order": {"status": {"EQUALS": "open"}}}}`.
    ///
    /// Operation keys must be one of C, R, U, D, E; classes must be registered;
    /// fields must be declared; conditions must be `*`, EQUALS, CONTAINS or IN.
    /// Errors name the offending segment, e.g. `R.Order.status.LIKE`.
    pub fn validate_access_dict(&self, raw: &serde_json::Value) -> Result<AccessQueryDict> {
        let ops = raw
            .as_object()
            .ok_or_else(|| Error::validation("$", "access dict must be an object"))?;

        let mut dict = AccessQueryDict::new();
        for (letter, classes) in ops {
            let op = OpKind::from_letter(letter).ok_or_else(|| {
                Error::validation(letter.clone(), "unknown operation, expected C, R, U, D or E")
            })?;
            let classes = classes.as_object().ok_or_else(|| {
                Error::validation(letter.clone(), "expected an object keyed by class name")
            })?;
            for (class_name, scope_json) in classes {
                let segment = format!("{}.{}", letter, class_name);
                let typing = self
                    .registry
                    .get(class_name)
                    .ok_or_else(|| Error::validation(segment.clone(), "class is not registered"))?;
                Self::check_declared(&typing, &segment, scope_json)?;
                let scope = InstanceScope::from_json(&segment, scope_json)?;
                dict.grant(op, class_name.clone(), scope);
            }
        }
        Ok(dict)
    }

    fn check_declared(typing: &ObjectTyping, segment: &str, json: &serde_json::Value) -> Result<()> {
        let filters: Vec<&serde_json::Value> = match json {
            serde_json::Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for (field, _) in filters.into_iter().filter_map(|f| f.as_object()).flatten() {
            if !typing.declares(field) {
                return Err(Error::validation(
                    format!("{}.{}", segment, field),
                    "field is not declared",
                ));
            }
        }
        Ok(())
    }

    /// Instances of `class_name` the principal may run `op` on that also match `requested`.
    ///
    /// Fails with [`Error::AccessDenied`] if `op` is not granted on the class.
    /// A Read filter may only name fields in the principal's Read field scope
    /// (identifier fields are always allowed); otherwise the denial names
    /// `Class.field`. An empty result is not an error.
    pub fn resolve_query(
        &self,
        tree: &ObjectTree,
        class_name: &str,
        op: OpKind,
        requested: &AttributeFilter,
        principal: Option<&Principal>,
    ) -> Result<BTreeMap<String, InstanceHandle>> {
        self.registry.require(class_name)?;
        let (access, _) = self.access_and_permission(principal);
        let scope = access
            .scope(op, class_name)
            .ok_or_else(|| Error::AccessDenied {
                class_name: class_name.to_string(),
                op: op.letter().to_string(),
            })?;
        if op == OpKind::Read {
            let filtered = extract_filter_fields(requested);
            self.check_fields(class_name, op, filtered.iter().map(String::as_str), principal)?;
        }
        let effective = scope.restrict(requested);
        let matches = select_in_scope(tree, class_name, &effective);
        debug!(class = class_name, %op, filter = %requested, matches = matches.len(), "query resolved");
        Ok(matches)
    }

    /// The single instance a U, D or E request targets.
    pub fn resolve_target(
        &self,
        tree: &ObjectTree,
        class_name: &str,
        op: OpKind,
        requested: &AttributeFilter,
        principal: Option<&Principal>,
    ) -> Result<InstanceHandle> {
        if !op.is_singular() {
            return Err(Error::validation(
                op.letter(),
                "only U, D and E operations target a single instance",
            ));
        }
        let matches = self.resolve_query(tree, class_name, op, requested, principal)?;
        let mut iter = matches.iter();
        match (iter.next(), iter.next()) {
            (None, _) => Err(Error::NotFound {
                class_name: class_name.to_string(),
                filter: requested.to_string(),
            }),
            (Some((_, handle)), None) => Ok(*handle),
            (Some(_), Some(_)) => Err(Error::AmbiguousTarget {
                class_name: class_name.to_string(),
                matches: matches.keys().cloned().collect(),
            }),
        }
    }

    /// Check that every field is within the principal's field scope for `op`.
    ///
    /// Identifier fields are always allowed on Create and Read.
    pub fn check_fields<'f>(
        &self,
        class_name: &str,
        op: OpKind,
        fields: impl IntoIterator<Item = &'f str>,
        principal: Option<&Principal>,
    ) -> Result<()> {
        let denied = |field: Option<&str>| Error::AccessDenied {
            class_name: match field {
                Some(field) => format!("{}.{}", class_name, field),
                None => class_name.to_string(),
            },
            op: op.letter().to_string(),
        };
        let scope = self
            .field_scope(class_name, op, principal)
            .ok_or_else(|| denied(None))?;
        let typing = self.registry.require(class_name)?;
        for field in fields {
            let exempt = matches!(op, OpKind::Create | OpKind::Read)
                && typing.is_identifier_field(field);
            if !exempt && !scope.allows(field) {
                return Err(denied(Some(field)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{InMemoryDirectory, PermissionSet};
    use crate::typing::ObjectTyping;
    use crate::value::Value;
    use std::sync::Arc;

    fn registry() -> TypingRegistry {
        let registry = TypingRegistry::default();
        registry
            .register(
                ObjectTyping::new("Order")
                    .with_identifier_fields(["orderId"])
                    .with_field("a")
                    .with_field("b")
                    .with_field("status"),
            )
            .unwrap();
        registry
    }

    fn store(registry: &TypingRegistry) -> PermissionStore {
        let dir = InMemoryDirectory::new()
            .with_user("alice")
            .with_user("bob")
            .with_group("staff");
        let store = PermissionStore::new();
        store
            .put(
                PermissionSet::new("set-a", "Order")
                    .assign_user("alice")
                    .allow_fields(OpKind::Read, ["a"]),
                registry,
                &dir,
            )
            .unwrap();
        store
            .put(
                PermissionSet::new("set-b", "Order")
                    .assign_group("staff")
                    .allow_fields(OpKind::Read, ["b"])
                    .allow_fields(OpKind::Update, ["status"]),
                registry,
                &dir,
            )
            .unwrap();
        store
            .put(
                PermissionSet::new("public", "Order")
                    .generalized()
                    .allow_fields(OpKind::Read, ["status"])
                    .with_filter(AttributeFilter::new().eq("status", "open")),
                registry,
                &dir,
            )
            .unwrap();
        store
    }

    #[test]
    fn test_field_scopes_union() {
        let registry = registry();
        let store = store(&registry);
        let resolver = AccessResolver::new(&registry, &store);

        let alice = Principal::new("alice").with_group("staff");
        let (_, permission) = resolver.access_and_permission(Some(&alice));
        let read = permission.scope(OpKind::Read, "Order").unwrap();
        assert!(read.allows("a"));
        assert!(read.allows("b"));
        assert!(read.allows("status"));
        assert!(permission.scope(OpKind::Update, "Order").is_some());
    }

    #[test]
    fn test_anonymous_gets_generalized_scope_only() {
        let registry = registry();
        let store = store(&registry);
        let resolver = AccessResolver::new(&registry, &store);

        let (access, permission) = resolver.access_and_permission(None);
        assert_eq!(
            access.scope(OpKind::Read, "Order"),
            Some(&InstanceScope::filtered(AttributeFilter::new().eq("status", "open")))
        );
        assert_eq!(
            permission.scope(OpKind::Read, "Order"),
            Some(&FieldScope::fields(["status"]))
        );
        assert!(access.scope(OpKind::Update, "Order").is_none());

        let deny = AccessResolver::new(&registry, &store).with_anonymous_access(AnonymousAccess::Deny);
        let (access, permission) = deny.access_and_permission(None);
        assert!(access.is_empty());
        assert!(permission.is_empty());
    }

    #[test]
    fn test_validate_access_dict() {
        let registry = registry();
        let store = PermissionStore::new();
        let resolver = AccessResolver::new(&registry, &store);

        let dict = resolver
            .validate_access_dict(&serde_json::json!({
                "R": {"Order": "*"},
                "U": {"Order": {"status": {"EQUALS": "open"}}}
            }))
            .unwrap();
        assert_eq!(dict.scope(OpKind::Read, "Order"), Some(&InstanceScope::All));
        assert!(dict.scope(OpKind::Update, "Order").is_some());

        let cases = [
            (serde_json::json!({"X": {"Order": "*"}}), "'X'"),
            (serde_json::json!({"R": {"Nope": "*"}}), "'R.Nope'"),
            (serde_json::json!({"R": {"Order": {"ghost": "*"}}}), "'R.Order.ghost'"),
            (
                serde_json::json!({"R": {"Order": [{"status": {"LIKE": "x"}}]}}),
                "'R.Order[0].status.LIKE'",
            ),
            (serde_json::json!(["R"]), "'$'"),
        ];
        for (raw, segment) in cases {
            let err = resolver.validate_access_dict(&raw).unwrap_err();
            assert!(
                err.to_string().contains(segment),
                "{} should name {}",
                err,
                segment
            );
        }
    }

    #[test]
    fn test_check_fields() {
        let registry = registry();
        let store = store(&registry);
        let resolver = AccessResolver::new(&registry, &store);
        let bob = Principal::new("bob").with_group("staff");

        resolver
            .check_fields("Order", OpKind::Update, ["status"], Some(&bob))
            .unwrap();
        let err = resolver
            .check_fields("Order", OpKind::Update, ["a"], Some(&bob))
            .unwrap_err();
        assert!(matches!(err, Error::AccessDenied { ref class_name, .. } if class_name == "Order.a"));
        let err = resolver
            .check_fields("Order", OpKind::Delete, ["a"], Some(&bob))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::AccessDenied);
    }

    #[test]
    fn test_read_filter_limited_to_field_scope() {
        let registry = registry();
        registry
            .register(ObjectTyping::new("Manager").manager_root().with_field("orders"))
            .unwrap();
        let registry = Arc::new(registry);
        let store = store(&registry);
        let resolver = AccessResolver::new(&registry, &store);
        let root = registry
            .create_instance("Manager", [("polariId".to_string(), Value::from("root"))].into())
            .unwrap();
        let mut tree = ObjectTree::new(registry.clone(), root).unwrap();
        let manager = tree.root_handle();
        for (id, secret) in [("A1", "x"), ("A2", "y")] {
            let order = tree
                .create_instance(
                    "Order",
                    [
                        ("orderId".to_string(), Value::from(id)),
                        ("b".to_string(), Value::from(secret)),
                    ]
                    .into(),
                )
                .unwrap();
            tree.collection(manager, "orders").unwrap().append(order).unwrap();
        }

        // alice may read field a only; filtering on b would reveal its values
        let alice = Principal::new("alice");
        let err = resolver
            .resolve_query(
                &tree,
                "Order",
                OpKind::Read,
                &AttributeFilter::new().eq("b", "x"),
                Some(&alice),
            )
            .unwrap_err();
        assert!(matches!(err, Error::AccessDenied { ref class_name, .. } if class_name == "Order.b"));

        let by_id = resolver
            .resolve_query(
                &tree,
                "Order",
                OpKind::Read,
                &AttributeFilter::new().eq("orderId", "A2"),
                Some(&alice),
            )
            .unwrap();
        assert_eq!(by_id.keys().collect::<Vec<_>>(), vec!["A2"]);

        let staff = Principal::new("bob").with_group("staff");
        let by_b = resolver
            .resolve_query(
                &tree,
                "Order",
                OpKind::Read,
                &AttributeFilter::new().eq("b", "x"),
                Some(&staff),
            )
            .unwrap();
        assert_eq!(by_b.keys().collect::<Vec<_>>(), vec!["A1"]);
    }
}
