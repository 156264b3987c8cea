//! Integration tests for permission sets and CRUDE access resolution.

use polari_core::{
    AnonymousAccess, AttributeFilter, ErrorKind, FieldScope, InMemoryDirectory, InstanceScope,
    ObjectStore, ObjectTyping, OpKind, PermissionSet, Principal, StoreConfig, Value,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn setup_store(config: StoreConfig) -> ObjectStore {
    let directory = InMemoryDirectory::new()
        .with_user("alice")
        .with_user("bob")
        .with_group("staff")
        .with_group("audit");
    let store = ObjectStore::new(config)
        .unwrap()
        .with_directory(Arc::new(directory));
    store
        .register_class(
            ObjectTyping::new("Order")
                .with_identifier_fields(["orderId"])
                .with_field("a")
                .with_field("b")
                .with_field("region")
                .with_default("status", "open"),
        )
        .unwrap();
    store
}

fn order(id: &str, region: &str) -> BTreeMap<String, Value> {
    [
        ("orderId".to_string(), Value::from(id)),
        ("region".to_string(), Value::from(region)),
    ]
    .into()
}

/// Seed orders through an all-powerful admin set.
fn seed(store: &ObjectStore, orders: Vec<BTreeMap<String, Value>>) {
    store
        .put_permission_set(
            PermissionSet::new("admin", "Order")
                .assign_user("bob")
                .allow(OpKind::Create),
        )
        .unwrap();
    store
        .create_instances("Order", orders, Some(&Principal::new("bob")))
        .unwrap();
}

#[test]
fn test_permission_union_across_sets() {
    let store = setup_store(StoreConfig::default());
    store
        .put_permission_set(
            PermissionSet::new("read-a", "Order")
                .assign_group("staff")
                .allow_fields(OpKind::Read, ["a"]),
        )
        .unwrap();
    store
        .put_permission_set(
            PermissionSet::new("read-b", "Order")
                .assign_group("audit")
                .allow_fields(OpKind::Read, ["b"]),
        )
        .unwrap();

    let alice = Principal::new("alice").with_group("staff").with_group("audit");
    let (access, permission) = store.get_users_object_access_permissions(Some(&alice));
    assert_eq!(access.scope(OpKind::Read, "Order"), Some(&InstanceScope::All));
    assert_eq!(
        permission.scope(OpKind::Read, "Order"),
        Some(&FieldScope::fields(["a", "b"]))
    );
    assert!(access.scope(OpKind::Update, "Order").is_none());

    let staff_only = Principal::new("alice").with_group("staff");
    let (_, permission) = store.get_users_object_access_permissions(Some(&staff_only));
    assert_eq!(
        permission.scope(OpKind::Read, "Order"),
        Some(&FieldScope::fields(["a"]))
    );
}

#[test]
fn test_anonymous_gets_generalized_scope_only() {
    let store = setup_store(StoreConfig::default());
    let public = AttributeFilter::new().eq("region", "eu");
    store
        .put_permission_set(
            PermissionSet::new("public-eu", "Order")
                .generalized()
                .allow(OpKind::Read)
                .with_filter(public.clone()),
        )
        .unwrap();
    store
        .put_permission_set(
            PermissionSet::new("staff-all", "Order")
                .assign_group("staff")
                .allow(OpKind::Read),
        )
        .unwrap();

    let (access, _) = store.get_users_object_access_permissions(None);
    assert_eq!(
        access.scope(OpKind::Read, "Order"),
        Some(&InstanceScope::filtered(public))
    );
    assert_ne!(access.to_json()["R"]["Order"], "*");

    let staff = Principal::new("alice").with_group("staff");
    let (access, _) = store.get_users_object_access_permissions(Some(&staff));
    assert_eq!(access.scope(OpKind::Read, "Order"), Some(&InstanceScope::All));
}

#[test]
fn test_anonymous_denied_by_config() {
    let store = setup_store(StoreConfig::default().anonymous_access(AnonymousAccess::Deny));
    store
        .put_permission_set(
            PermissionSet::new("public", "Order")
                .generalized()
                .allow(OpKind::Read),
        )
        .unwrap();

    let (access, permission) = store.get_users_object_access_permissions(None);
    assert!(access.is_empty());
    assert!(permission.is_empty());

    let err = store
        .read_instances("Order", &AttributeFilter::new(), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
}

#[test]
fn test_read_is_strict_intersection() {
    let store = setup_store(StoreConfig::default());
    seed(&store, vec![order("A1", "eu"), order("A2", "us"), order("A3", "eu")]);
    store
        .put_permission_set(
            PermissionSet::new("eu-read", "Order")
                .assign_user("alice")
                .allow_fields(OpKind::Read, ["region"])
                .with_filter(AttributeFilter::new().eq("region", "eu")),
        )
        .unwrap();
    let alice = Principal::new("alice");

    let json = store
        .read_instances("Order", &AttributeFilter::new(), Some(&alice))
        .unwrap();
    let ids: Vec<&String> = json["instances"].as_object().unwrap().keys().collect();
    assert_eq!(ids, vec!["A1", "A3"]);
    assert_eq!(json["instances"]["A1"], serde_json::json!({"region": "eu"}));

    let json = store
        .read_instances("Order", &AttributeFilter::new().eq("orderId", "A2"), Some(&alice))
        .unwrap();
    assert!(json["instances"].as_object().unwrap().is_empty());
}

#[test]
fn test_target_resolution_counts() {
    let store = setup_store(StoreConfig::default());
    seed(&store, vec![order("A1", "eu"), order("A2", "eu"), order("A3", "us")]);
    store
        .put_permission_set(
            PermissionSet::new("editor", "Order")
                .assign_user("alice")
                .allow_fields(OpKind::Update, ["status"])
                .allow(OpKind::Delete),
        )
        .unwrap();
    let alice = Principal::new("alice");
    let shipped = || -> BTreeMap<String, Value> {
        [("status".to_string(), Value::from("shipped"))].into()
    };

    let err = store
        .update_instance(
            "Order",
            &AttributeFilter::new().eq("orderId", "Z9"),
            shipped(),
            Some(&alice),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = store
        .update_instance(
            "Order",
            &AttributeFilter::new().eq("region", "eu"),
            shipped(),
            Some(&alice),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AmbiguousTarget);

    store
        .update_instance(
            "Order",
            &AttributeFilter::new().eq("region", "us"),
            shipped(),
            Some(&alice),
        )
        .unwrap();
    let found = store
        .get_list_of_instances_by_attributes("Order", &AttributeFilter::new().eq("status", "shipped"))
        .unwrap();
    assert_eq!(found.keys().collect::<Vec<_>>(), vec!["A3"]);

    let outcome = store
        .delete_instance("Order", &AttributeFilter::new().eq("orderId", "A1"), Some(&alice))
        .unwrap();
    assert_eq!(outcome.deleted_ids(), vec!["A1"]);
}

#[test]
fn test_create_checks_field_and_instance_scope() {
    let store = setup_store(StoreConfig::default());
    store
        .put_permission_set(
            PermissionSet::new("eu-create", "Order")
                .assign_user("alice")
                .allow_fields(OpKind::Create, ["region"])
                .with_filter(AttributeFilter::new().eq("region", "eu")),
        )
        .unwrap();
    let alice = Principal::new("alice");

    store
        .create_instances("Order", vec![order("A1", "eu")], Some(&alice))
        .unwrap();

    let err = store
        .create_instances("Order", vec![order("A2", "us")], Some(&alice))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);

    let mut with_a = order("A3", "eu");
    with_a.insert("a".to_string(), Value::Int(1));
    let err = store
        .create_instances("Order", vec![with_a], Some(&alice))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
    assert!(err.to_string().contains("Order.a"));
}

#[test]
fn test_permission_set_validation() {
    let store = setup_store(StoreConfig::default());
    let err = store
        .put_permission_set(PermissionSet::new("ghost", "Order").assign_user("carol"))
        .unwrap_err();
    assert!(err.to_string().contains("unknown user"));

    let err = store
        .put_permission_set(
            PermissionSet::new("bad-field", "Order")
                .assign_user("alice")
                .allow_fields(OpKind::Read, ["nope"]),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = store
        .put_permission_set(PermissionSet::new("bad-class", "Invoice").generalized())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unknown);
}

#[test]
fn test_validate_access_dict_names_segment() {
    let store = setup_store(StoreConfig::default());
    let resolver = store.resolver();

    let dict = resolver
        .validate_access_dict(&serde_json::json!({
            "R": {"Order": {"region": {"EQUALS": "eu"}}},
            "D": {"Order": "*"}
        }))
        .unwrap();
    assert_eq!(dict.scope(OpKind::Delete, "Order"), Some(&InstanceScope::All));
    assert_eq!(
        dict.scope(OpKind::Read, "Order"),
        Some(&InstanceScope::filtered(AttributeFilter::new().eq("region", "eu")))
    );

    let err = resolver
        .validate_access_dict(&serde_json::json!({"X": {}}))
        .unwrap_err();
    assert!(err.to_string().contains("'X'"));

    let err = resolver
        .validate_access_dict(&serde_json::json!({"R": {"Order": {"color": "*"}}}))
        .unwrap_err();
    assert!(err.to_string().contains("R.Order.color"));
}
