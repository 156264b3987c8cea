//! Object store facade: the surface a transport layer talks to.
//!
//! The store owns the typing registry, the object tree, the permission
//! sets and the event handlers. Every mutation runs inside one critical
//! section on the tree; multi-step mutations are applied to the live tree
//! and undone from the tree's journal if any step fails.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::query::{select_by_attributes, AttributeFilter};
use crate::security::{
    AccessQueryDict, AccessResolver, FieldScope, InMemoryDirectory, OpKind, PermissionQueryDict,
    PermissionSet, PermissionStore, Principal, PrincipalDirectory,
};
use crate::tree::{Branch, DeleteOutcome, InstanceHandle, ObjectTree, Path};
use crate::typing::{Identifiers, ObjectTyping, TypingRegistry};
use crate::value::Value;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Handler invoked by [`ObjectStore::fire_event`] on the targeted instance.
pub type EventHandler = Arc<
    dyn Fn(&mut ObjectTree, InstanceHandle, &serde_json::Value) -> Result<serde_json::Value>
        + Send
        + Sync,
>;

/// In-memory object store.
pub struct ObjectStore {
    config: StoreConfig,
    registry: Arc<TypingRegistry>,
    tree: RwLock<ObjectTree>,
    permissions: PermissionStore,
    directory: Arc<dyn PrincipalDirectory>,
    handlers: DashMap<(String, String), EventHandler>,
}

impl ObjectStore {
    /// Create a store with its root manager and an empty principal directory.
    pub fn new(config: StoreConfig) -> Result<Self> {
        let registry = Arc::new(TypingRegistry::new(config.default_identifier_field.clone()));
        registry.register(ObjectTyping::new(config.root_class.clone()).manager_root())?;

        let mut params = BTreeMap::new();
        params.insert(
            config.default_identifier_field.clone(),
            Value::String(config.root_identifier.clone()),
        );
        let root = registry.create_instance(&config.root_class, params)?;
        let tree = ObjectTree::new(registry.clone(), root)?.with_max_depth(config.max_depth);

        info!(root = %config.root_class, "object store created");
        Ok(Self {
            config,
            registry,
            tree: RwLock::new(tree),
            permissions: PermissionStore::new(),
            directory: Arc::new(InMemoryDirectory::new()),
            handlers: DashMap::new(),
        })
    }

    /// Use another principal directory for permission set validation.
    pub fn with_directory(mut self, directory: Arc<dyn PrincipalDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Typing registry.
    pub fn registry(&self) -> &Arc<TypingRegistry> {
        &self.registry
    }

    /// Permission sets.
    pub fn permissions(&self) -> &PermissionStore {
        &self.permissions
    }

    /// Handle of the root manager instance.
    pub fn root_handle(&self) -> InstanceHandle {
        self.tree.read().root_handle()
    }

    /// Run a closure against the tree under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&ObjectTree) -> R) -> R {
        f(&self.tree.read())
    }

    /// Run a mutation under the write lock; on error the tree is restored.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut ObjectTree) -> Result<R>) -> Result<R> {
        let mut tree = self.tree.write();
        let result = tree.atomically(f);
        if let Err(err) = &result {
            warn!(error = %err, "mutation rolled back");
        }
        result
    }

    /// Resolver bound to this store's registry, permissions and anonymous mode.
    pub fn resolver(&self) -> AccessResolver<'_> {
        AccessResolver::new(&self.registry, &self.permissions)
            .with_anonymous_access(self.config.anonymous_access)
    }

    /// Register a class. The root manager gains a list field named after it.
    pub fn register_class(&self, typing: ObjectTyping) -> Result<()> {
        let class_name = typing.class_name.clone();
        self.registry.register(typing)?;
        self.registry
            .declare_field(&self.config.root_class, &class_name)?;
        Ok(())
    }

    /// Validate and store a permission set.
    pub fn put_permission_set(&self, set: PermissionSet) -> Result<()> {
        self.permissions
            .put(set, &self.registry, self.directory.as_ref())
    }

    /// Register the handler for `event` on `class_name`, replacing any previous one.
    pub fn register_event_handler(
        &self,
        class_name: impl Into<String>,
        event: impl Into<String>,
        handler: EventHandler,
    ) {
        self.handlers
            .insert((class_name.into(), event.into()), handler);
    }

    // ----- tree surface -----

    /// Canonical instances of a class matching `filter`, keyed by identifiers.
    pub fn get_list_of_instances_by_attributes(
        &self,
        class_name: &str,
        filter: &AttributeFilter,
    ) -> Result<BTreeMap<String, InstanceHandle>> {
        self.registry.require(class_name)?;
        Ok(select_by_attributes(&self.tree.read(), class_name, filter))
    }

    /// Serializable dict of instances of one class, optionally projected onto a field scope.
    ///
    /// References render as `{"class": ..., "id": ...}`.
    pub fn get_json_dict_for_class(
        &self,
        class_name: &str,
        instances: &[InstanceHandle],
        fields: Option<&FieldScope>,
    ) -> Result<serde_json::Value> {
        let tree = self.tree.read();
        Self::json_dict(&tree, class_name, instances, fields)
    }

    fn json_dict(
        tree: &ObjectTree,
        class_name: &str,
        instances: &[InstanceHandle],
        fields: Option<&FieldScope>,
    ) -> Result<serde_json::Value> {
        let mut out = serde_json::Map::new();
        for handle in instances {
            let instance = tree.get_instance(*handle)?;
            if instance.class_name != class_name {
                return Err(Error::validation(
                    handle.to_string(),
                    format!("instance is a '{}', not a '{}'", instance.class_name, class_name),
                ));
            }
            let projected = match fields {
                Some(scope) => scope.project(&instance.fields),
                None => instance.fields.clone(),
            };
            let body: serde_json::Map<String, serde_json::Value> = projected
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(tree, v)))
                .collect();
            out.insert(instance.identifiers.to_string(), serde_json::Value::Object(body));
        }
        Ok(serde_json::json!({ "class": class_name, "instances": out }))
    }

    /// Attach a branch under `path`.
    pub fn add_new_branch(&self, path: &Path, branch: Branch) -> Result<()> {
        self.transaction(|tree| tree.attach(path, branch))
    }

    /// Re-key an instance everywhere it is placed.
    pub fn replace_original_tuple(
        &self,
        class_name: &str,
        old_identifiers: &Identifiers,
        new_identifiers: Identifiers,
    ) -> Result<()> {
        self.transaction(|tree| {
            tree.replace_original_tuple(class_name, old_identifiers, new_identifiers)
        })
    }

    /// Delete the canonical node of `(class, identifiers)`.
    pub fn delete_tree_node(
        &self,
        class_name: &str,
        identifiers: &Identifiers,
    ) -> Result<DeleteOutcome> {
        self.transaction(|tree| tree.delete_tree_node(class_name, identifiers))
    }

    /// The principal's access and permission dicts.
    pub fn get_users_object_access_permissions(
        &self,
        principal: Option<&Principal>,
    ) -> (AccessQueryDict, PermissionQueryDict) {
        self.resolver().access_and_permission(principal)
    }

    // ----- CRUDE -----

    /// Create a batch of instances under the root manager, all or nothing.
    ///
    /// Every parameter must be within the principal's Create field scope and
    /// every new instance within its Create instance scope. An instance whose
    /// identifiers are already placed fails with [`Error::DuplicatePlacement`].
    pub fn create_instances(
        &self,
        class_name: &str,
        batch: Vec<BTreeMap<String, Value>>,
        principal: Option<&Principal>,
    ) -> Result<Vec<InstanceHandle>> {
        let resolver = self.resolver();
        for params in &batch {
            resolver.check_fields(
                class_name,
                OpKind::Create,
                params.keys().map(String::as_str),
                principal,
            )?;
        }
        let (access, _) = resolver.access_and_permission(principal);
        let scope = access
            .scope(OpKind::Create, class_name)
            .cloned()
            .ok_or_else(|| Error::AccessDenied {
                class_name: class_name.to_string(),
                op: OpKind::Create.letter().to_string(),
            })?;

        let count = batch.len();
        let created = self.transaction(|tree| {
            let root = tree.root_handle();
            let mut created = Vec::with_capacity(count);
            for params in batch {
                let handle = tree.create_instance(class_name, params)?;
                let instance = tree.get_instance(handle)?;
                if !scope.matches(&instance.fields) {
                    return Err(Error::AccessDenied {
                        class_name: class_name.to_string(),
                        op: OpKind::Create.letter().to_string(),
                    });
                }
                let identifiers = instance.identifiers.clone();
                if let Some(path) = tree.locate(class_name, &identifiers)? {
                    return Err(Error::DuplicatePlacement {
                        class_name: class_name.to_string(),
                        identifiers: identifiers.to_string(),
                        path: path.to_string(),
                    });
                }
                tree.collection(root, class_name)?.append(handle)?;
                created.push(handle);
            }
            Ok(created)
        })?;
        info!(class = class_name, count = created.len(), "instances created");
        Ok(created)
    }

    /// Instances the principal may read that match `filter`, projected onto
    /// the principal's Read field scope.
    pub fn read_instances(
        &self,
        class_name: &str,
        filter: &AttributeFilter,
        principal: Option<&Principal>,
    ) -> Result<serde_json::Value> {
        let resolver = self.resolver();
        let tree = self.tree.read();
        let matches = resolver.resolve_query(&tree, class_name, OpKind::Read, filter, principal)?;
        let fields = resolver.field_scope(class_name, OpKind::Read, principal);
        let handles: Vec<InstanceHandle> = matches.into_values().collect();
        Self::json_dict(&tree, class_name, &handles, fields.as_ref())
    }

    /// Update the single instance `filter` targets.
    pub fn update_instance(
        &self,
        class_name: &str,
        filter: &AttributeFilter,
        updates: BTreeMap<String, Value>,
        principal: Option<&Principal>,
    ) -> Result<InstanceHandle> {
        let resolver = self.resolver();
        resolver.check_fields(
            class_name,
            OpKind::Update,
            updates.keys().map(String::as_str),
            principal,
        )?;
        self.transaction(|tree| {
            let target = resolver.resolve_target(tree, class_name, OpKind::Update, filter, principal)?;
            for (field, value) in updates {
                tree.assign_field(target, &field, value)?;
            }
            Ok(target)
        })
    }

    /// Delete the single instance `filter` targets.
    pub fn delete_instance(
        &self,
        class_name: &str,
        filter: &AttributeFilter,
        principal: Option<&Principal>,
    ) -> Result<DeleteOutcome> {
        let resolver = self.resolver();
        self.transaction(|tree| {
            let target = resolver.resolve_target(tree, class_name, OpKind::Delete, filter, principal)?;
            let identifiers = tree.get_instance(target)?.identifiers.clone();
            tree.delete_tree_node(class_name, &identifiers)
        })
    }

    /// Run the `event` handler on the single instance `filter` targets.
    pub fn fire_event(
        &self,
        class_name: &str,
        event: &str,
        filter: &AttributeFilter,
        payload: &serde_json::Value,
        principal: Option<&Principal>,
    ) -> Result<serde_json::Value> {
        let handler = self
            .handlers
            .get(&(class_name.to_string(), event.to_string()))
            .map(|h| h.value().clone())
            .ok_or_else(|| {
                Error::validation(format!("{}.{}", class_name, event), "no handler for event")
            })?;
        let resolver = self.resolver();
        self.transaction(|tree| {
            let target = resolver.resolve_target(tree, class_name, OpKind::Event, filter, principal)?;
            info!(class = class_name, event, target = %target, "event fired");
            handler(tree, target, payload)
        })
    }
}

fn value_to_json(tree: &ObjectTree, value: &Value) -> serde_json::Value {
    match value {
        Value::Ref(handle) => match tree.instance(*handle) {
            Some(target) => serde_json::json!({
                "class": target.class_name,
                "id": target.identifiers.to_string(),
            }),
            None => serde_json::Value::Null,
        },
        Value::List(items) => {
            serde_json::Value::Array(items.iter().map(|v| value_to_json(tree, v)).collect())
        }
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(tree, v)))
                .collect(),
        ),
        other => serde_json::to_value(other).unwrap_or(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn store() -> ObjectStore {
        let directory = InMemoryDirectory::new().with_user("alice").with_group("staff");
        let store = ObjectStore::new(StoreConfig::default())
            .unwrap()
            .with_directory(Arc::new(directory));
        store
            .register_class(
                ObjectTyping::new("Order")
                    .with_identifier_fields(["orderId"])
                    .with_default("status", "open")
                    .with_field("total"),
            )
            .unwrap();
        store
            .put_permission_set(
                PermissionSet::new("staff", "Order")
                    .assign_group("staff")
                    .allow(OpKind::Create)
                    .allow(OpKind::Read)
                    .allow_fields(OpKind::Update, ["status"])
                    .allow(OpKind::Delete)
                    .allow(OpKind::Event),
            )
            .unwrap();
        store
    }

    fn staff() -> Principal {
        Principal::new("alice").with_group("staff")
    }

    fn order(id: &str) -> BTreeMap<String, Value> {
        [("orderId".to_string(), Value::from(id))].into()
    }

    #[test]
    fn test_new_creates_root() {
        let store = ObjectStore::new(StoreConfig::default()).unwrap();
        let root = store.root_handle();
        let path = store.read(|t| t.path_of(root).unwrap().unwrap());
        assert_eq!(path.to_string(), "/polariManager:root");
    }

    #[test]
    fn test_create_and_read() {
        let store = store();
        let created = store
            .create_instances("Order", vec![order("A1"), order("A2")], Some(&staff()))
            .unwrap();
        assert_eq!(created.len(), 2);

        let json = store
            .read_instances("Order", &AttributeFilter::new().eq("orderId", "A2"), Some(&staff()))
            .unwrap();
        assert_eq!(json["instances"]["A2"]["status"], "open");
        assert!(json["instances"].get("A1").is_none());
    }

    #[test]
    fn test_create_batch_is_atomic() {
        let store = store();
        let mut bad = order("A2");
        bad.insert("bogus".to_string(), Value::Int(1));
        // A1 is placed before the undeclared parameter fails; it must not survive
        let err = store
            .create_instances("Order", vec![order("A1"), bad], Some(&staff()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(store
            .get_list_of_instances_by_attributes("Order", &AttributeFilter::new())
            .unwrap()
            .is_empty());

        let err = store
            .create_instances("Order", vec![order("A1"), order("A1")], Some(&staff()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicatePlacement);
        assert!(store
            .get_list_of_instances_by_attributes("Order", &AttributeFilter::new())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_create_denied_for_anonymous() {
        let store = store();
        let err = store
            .create_instances("Order", vec![order("A1")], None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[test]
    fn test_update_respects_field_scope() {
        let store = store();
        store
            .create_instances("Order", vec![order("A1")], Some(&staff()))
            .unwrap();
        let target = AttributeFilter::new().eq("orderId", "A1");

        store
            .update_instance(
                "Order",
                &target,
                [("status".to_string(), Value::from("shipped"))].into(),
                Some(&staff()),
            )
            .unwrap();
        let shipped = store
            .get_list_of_instances_by_attributes("Order", &AttributeFilter::new().eq("status", "shipped"))
            .unwrap();
        assert_eq!(shipped.len(), 1);

        let err = store
            .update_instance(
                "Order",
                &target,
                [("total".to_string(), Value::Int(5))].into(),
                Some(&staff()),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[test]
    fn test_delete_instance() {
        let store = store();
        store
            .create_instances("Order", vec![order("A1")], Some(&staff()))
            .unwrap();
        let outcome = store
            .delete_instance("Order", &AttributeFilter::new().eq("orderId", "A1"), Some(&staff()))
            .unwrap();
        assert_eq!(outcome.deleted_ids(), vec!["A1"]);
        // the root manager's list no longer holds the reference
        let root = store.root_handle();
        let orders = store.read(|t| t.instance(root).unwrap().get("Order").cloned());
        assert_eq!(orders, Some(Value::List(vec![])));
    }

    #[test]
    fn test_fire_event() {
        let store = store();
        store
            .create_instances("Order", vec![order("A1")], Some(&staff()))
            .unwrap();
        store.register_event_handler(
            "Order",
            "close",
            Arc::new(
                |tree: &mut ObjectTree,
                 target: InstanceHandle,
                 payload: &serde_json::Value|
                 -> Result<serde_json::Value> {
                    let reason = payload["reason"].as_str().unwrap_or("none").to_string();
                    tree.assign_field(target, "status", "closed")?;
                    Ok(serde_json::json!({ "closed": true, "reason": reason }))
                },
            ),
        );

        let out = store
            .fire_event(
                "Order",
                "close",
                &AttributeFilter::new().eq("orderId", "A1"),
                &serde_json::json!({"reason": "paid"}),
                Some(&staff()),
            )
            .unwrap();
        assert_eq!(out["reason"], "paid");

        let err = store
            .fire_event("Order", "reopen", &AttributeFilter::new(), &serde_json::Value::Null, Some(&staff()))
            .unwrap_err();
        assert!(err.to_string().contains("Order.reopen"));
    }

    #[test]
    fn test_json_dict_projection() {
        let store = store();
        let created = store
            .create_instances("Order", vec![order("A1")], Some(&staff()))
            .unwrap();
        let json = store
            .get_json_dict_for_class("Order", &created, Some(&FieldScope::fields(["status"])))
            .unwrap();
        assert_eq!(json["class"], "Order");
        assert_eq!(json["instances"]["A1"], serde_json::json!({"status": "open"}));

        let err = store
            .get_json_dict_for_class("polariManager", &created, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
