//! Registry of class typings.

use super::object_typing::{ObjectTyping, ReferenceCardinality};
use crate::error::{Error, Result};
use crate::tree::Instance;
use crate::value::Value;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Registry of [`ObjectTyping`]s keyed by class name.
///
/// Typings are registered once and live for as long as the registry. The
/// only mutation after registration is [`TypingRegistry::record_reference`],
/// which grows reference metadata and never shrinks it.
#[derive(Debug)]
pub struct TypingRegistry {
    typings: RwLock<BTreeMap<String, ObjectTyping>>,
    default_identifier_field: String,
}

impl TypingRegistry {
    /// Create an empty registry.
    ///
    /// Typings registered without identifier fields get `default_identifier_field`.
    pub fn new(default_identifier_field: impl Into<String>) -> Self {
        Self {
            typings: RwLock::new(BTreeMap::new()),
            default_identifier_field: default_identifier_field.into(),
        }
    }

    /// Register a class typing.
    pub fn register(&self, mut typing: ObjectTyping) -> Result<()> {
        if typing.class_name.is_empty() {
            return Err(Error::validation("class_name", "class name must not be empty"));
        }
        if typing.identifier_fields.is_empty() {
            typing = typing.with_identifier_fields([self.default_identifier_field.clone()]);
        }
        if let Some(field) = typing
            .required_params
            .iter()
            .chain(typing.default_params.keys())
            .chain(typing.identifier_fields.iter())
            .find(|f| !typing.declares(f))
        {
            return Err(Error::validation(
                format!("{}.{}", typing.class_name, field),
                "field is used but not declared",
            ));
        }

        let mut typings = self.typings.write();
        if typings.contains_key(&typing.class_name) {
            return Err(Error::validation(
                typing.class_name.clone(),
                "class is already registered",
            ));
        }
        if typing.capabilities.is_manager_root {
            if let Some(existing) = typings.values().find(|t| t.capabilities.is_manager_root) {
                return Err(Error::validation(
                    typing.class_name.clone(),
                    format!("'{}' is already the manager root", existing.class_name),
                ));
            }
        }
        info!(class = %typing.class_name, fields = typing.declared_fields.len(), "registered class");
        typings.insert(typing.class_name.clone(), typing);
        Ok(())
    }

    /// Get a copy of a class typing.
    pub fn get(&self, class_name: &str) -> Option<ObjectTyping> {
        self.typings.read().get(class_name).cloned()
    }

    /// Get a class typing or fail with [`Error::UnknownClass`].
    pub fn require(&self, class_name: &str) -> Result<ObjectTyping> {
        self.get(class_name)
            .ok_or_else(|| Error::UnknownClass(class_name.to_string()))
    }

    /// Run a closure against a class typing without cloning it.
    pub fn with_typing<R>(&self, class_name: &str, f: impl FnOnce(&ObjectTyping) -> R) -> Result<R> {
        let typings = self.typings.read();
        typings
            .get(class_name)
            .map(f)
            .ok_or_else(|| Error::UnknownClass(class_name.to_string()))
    }

    /// Check if a class is registered.
    pub fn contains(&self, class_name: &str) -> bool {
        self.typings.read().contains_key(class_name)
    }

    /// List registered class names in order.
    pub fn list_classes(&self) -> Vec<String> {
        self.typings.read().keys().cloned().collect()
    }

    /// The default identifier field name.
    pub fn default_identifier_field(&self) -> &str {
        &self.default_identifier_field
    }

    /// Record a reference from `owner_class.field` to `target_class`.
    ///
    /// First-seen policy: unknown fields are added, known fields only upgrade
    /// their cardinality. Returns `true` if the typing changed.
    pub fn record_reference(
        &self,
        owner_class: &str,
        field: &str,
        target_class: &str,
        cardinality: ReferenceCardinality,
    ) -> Result<bool> {
        let mut typings = self.typings.write();
        let typing = typings
            .get_mut(owner_class)
            .ok_or_else(|| Error::UnknownClass(owner_class.to_string()))?;
        let changed = typing.record_reference(field, target_class, cardinality);
        if changed {
            debug!(owner = owner_class, field, target = target_class, ?cardinality, "reference field recorded");
        }
        Ok(changed)
    }

    /// Declare an extra field on a registered class. Returns `true` if it was new.
    pub fn declare_field(&self, class_name: &str, field: &str) -> Result<bool> {
        let mut typings = self.typings.write();
        let typing = typings
            .get_mut(class_name)
            .ok_or_else(|| Error::UnknownClass(class_name.to_string()))?;
        if typing.declares(field) {
            return Ok(false);
        }
        typing.declared_fields.push(field.to_string());
        Ok(true)
    }

    /// Validate creation parameters and build an unplaced instance.
    pub fn create_instance(
        &self,
        class_name: &str,
        params: BTreeMap<String, Value>,
    ) -> Result<Instance> {
        self.with_typing(class_name, |typing| {
            let fields = typing.prepare_params(params)?;
            let identifiers = typing.identifiers_of(&fields)?;
            Ok(Instance::new(class_name, identifiers, fields))
        })?
    }
}

impl Default for TypingRegistry {
    fn default() -> Self {
        Self::new("polariId")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typing::Identifiers;

    fn registry() -> TypingRegistry {
        let registry = TypingRegistry::default();
        registry
            .register(
                ObjectTyping::new("Order")
                    .with_identifier_fields(["orderId"])
                    .with_required("orderId")
                    .with_default("status", "open"),
            )
            .unwrap();
        registry
            .register(ObjectTyping::new("Note").with_field("text"))
            .unwrap();
        registry
    }

    #[test]
    fn test_register_and_get() {
        let registry = registry();
        assert!(registry.contains("Order"));
        assert_eq!(registry.list_classes(), vec!["Note", "Order"]);

        let note = registry.get("Note").unwrap();
        assert_eq!(note.identifier_fields, vec!["polariId"]);
        assert!(note.declares("polariId"));
        assert!(registry.get("Missing").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = registry();
        let err = registry.register(ObjectTyping::new("Order")).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_single_manager_root() {
        let registry = TypingRegistry::default();
        registry
            .register(ObjectTyping::new("Manager").manager_root())
            .unwrap();
        assert!(registry
            .register(ObjectTyping::new("OtherManager").manager_root())
            .is_err());
    }

    #[test]
    fn test_create_instance() {
        let registry = registry();
        let mut params = BTreeMap::new();
        params.insert("orderId".to_string(), Value::from("A1"));

        let instance = registry.create_instance("Order", params).unwrap();
        assert_eq!(instance.class_name, "Order");
        assert_eq!(instance.identifiers, Identifiers::single("orderId", "A1"));
        assert_eq!(instance.fields.get("status"), Some(&Value::from("open")));

        assert!(matches!(
            registry.create_instance("Order", BTreeMap::new()),
            Err(Error::IdentifierIncomplete { .. })
        ));
        assert!(matches!(
            registry.create_instance("Nope", BTreeMap::new()),
            Err(Error::UnknownClass(_))
        ));
    }

    #[test]
    fn test_declare_field() {
        let registry = registry();
        assert!(registry.declare_field("Note", "author").unwrap());
        assert!(!registry.declare_field("Note", "author").unwrap());
        assert!(registry.get("Note").unwrap().declares("author"));
        assert!(registry.declare_field("Nope", "x").is_err());
    }

    #[test]
    fn test_record_reference() {
        let registry = registry();
        assert!(registry
            .record_reference("Order", "notes", "Note", ReferenceCardinality::Multi)
            .unwrap());
        assert!(!registry
            .record_reference("Order", "notes", "Note", ReferenceCardinality::Scalar)
            .unwrap());
        let order = registry.get("Order").unwrap();
        assert_eq!(
            order.reference_field("notes").unwrap().cardinality,
            ReferenceCardinality::Multi
        );
    }
}
