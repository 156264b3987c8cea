//! Class typing definitions.

use super::identifiers::Identifiers;
use crate::error::{Error, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Cardinality of a reference field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceCardinality {
    /// Field holds at most one reference.
    Scalar,
    /// Field holds a sequence of references.
    Multi,
}

/// A field known to hold references to other tracked instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceField {
    /// Cardinality; only ever upgraded from `Scalar` to `Multi`.
    pub cardinality: ReferenceCardinality,
    /// Classes seen through this field.
    pub target_classes: BTreeSet<String>,
}

/// Structural capabilities of a class inside the object tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCapabilities {
    /// Instances of this class sit at the tree root.
    pub is_manager_root: bool,
    /// Instances of this class get their own branch when referenced.
    pub is_tree_attachable: bool,
}

impl Default for TypeCapabilities {
    fn default() -> Self {
        Self {
            is_manager_root: false,
            is_tree_attachable: true,
        }
    }
}

/// Typing metadata for a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectTyping {
    /// Class name (unique within the registry).
    pub class_name: String,
    /// Identifier fields, in key order.
    #[serde(default)]
    pub identifier_fields: Vec<String>,
    /// Parameters that must be supplied on creation.
    #[serde(default)]
    pub required_params: Vec<String>,
    /// Defaults applied to omitted parameters.
    #[serde(default)]
    pub default_params: BTreeMap<String, Value>,
    /// Declared field names, ordered and unique.
    #[serde(default)]
    pub declared_fields: Vec<String>,
    /// Reference fields by name.
    #[serde(default)]
    pub reference_fields: BTreeMap<String, ReferenceField>,
    /// Tree capabilities.
    #[serde(default)]
    pub capabilities: TypeCapabilities,
}

impl ObjectTyping {
    /// Create a typing with no fields.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            identifier_fields: Vec::new(),
            required_params: Vec::new(),
            default_params: BTreeMap::new(),
            declared_fields: Vec::new(),
            reference_fields: BTreeMap::new(),
            capabilities: TypeCapabilities::default(),
        }
    }

    /// Set the identifier fields (declared implicitly).
    pub fn with_identifier_fields<S: Into<String>>(
        mut self,
        fields: impl IntoIterator<Item = S>,
    ) -> Self {
        self.identifier_fields = fields.into_iter().map(Into::into).collect();
        for field in self.identifier_fields.clone() {
            self.declare(&field);
        }
        self
    }

    /// Declare a field.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.declare(&field.into());
        self
    }

    /// Declare a required creation parameter.
    pub fn with_required(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.declare(&field);
        if !self.required_params.contains(&field) {
            self.required_params.push(field);
        }
        self
    }

    /// Declare a field with a default value.
    pub fn with_default(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let field = field.into();
        self.declare(&field);
        self.default_params.insert(field, value.into());
        self
    }

    /// Declare a reference field up front.
    pub fn with_reference(
        mut self,
        field: impl Into<String>,
        target: impl Into<String>,
        cardinality: ReferenceCardinality,
    ) -> Self {
        let field = field.into();
        self.declare(&field);
        self.record_reference(&field, &target.into(), cardinality);
        self
    }

    /// Mark this class as the tree's root manager.
    pub fn manager_root(mut self) -> Self {
        self.capabilities.is_manager_root = true;
        self
    }

    /// Instances of this class are embedded values rather than tree branches.
    pub fn not_tree_attachable(mut self) -> Self {
        self.capabilities.is_tree_attachable = false;
        self
    }

    fn declare(&mut self, field: &str) {
        if !self.declared_fields.iter().any(|f| f == field) {
            self.declared_fields.push(field.to_string());
        }
    }

    /// Check if a field is declared.
    pub fn declares(&self, field: &str) -> bool {
        self.declared_fields.iter().any(|f| f == field)
    }

    /// Check if a field is part of the identifier.
    pub fn is_identifier_field(&self, field: &str) -> bool {
        self.identifier_fields.iter().any(|f| f == field)
    }

    /// Get a reference field definition.
    pub fn reference_field(&self, field: &str) -> Option<&ReferenceField> {
        self.reference_fields.get(field)
    }

    /// Record that `field` references `target`.
    ///
    /// Unknown fields are added with the given cardinality. Known fields only
    /// ever upgrade from `Scalar` to `Multi`. Returns `true` if anything changed.
    pub fn record_reference(
        &mut self,
        field: &str,
        target: &str,
        cardinality: ReferenceCardinality,
    ) -> bool {
        match self.reference_fields.get_mut(field) {
            Some(existing) => {
                let mut changed = existing.target_classes.insert(target.to_string());
                if cardinality > existing.cardinality {
                    existing.cardinality = cardinality;
                    changed = true;
                }
                changed
            }
            None => {
                let mut target_classes = BTreeSet::new();
                target_classes.insert(target.to_string());
                self.reference_fields.insert(
                    field.to_string(),
                    ReferenceField {
                        cardinality,
                        target_classes,
                    },
                );
                true
            }
        }
    }

    /// Extract the identifier tuple from field values.
    pub fn identifiers_of(&self, fields: &BTreeMap<String, Value>) -> Result<Identifiers> {
        let mut ids = Identifiers::new();
        let mut missing = Vec::new();
        for field in &self.identifier_fields {
            match fields.get(field).and_then(Value::render_key) {
                Some(rendered) => ids = ids.with(field.clone(), rendered),
                None => missing.push(field.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::IdentifierIncomplete {
                class_name: self.class_name.clone(),
                missing,
            });
        }
        Ok(ids)
    }

    /// Check whether an identifier tuple names every identifier field.
    pub fn is_complete(&self, ids: &Identifiers) -> bool {
        self.identifier_fields.iter().all(|f| ids.get(f).is_some())
    }

    /// Reorder a complete tuple into declaration order.
    ///
    /// `None` if a field is missing or the tuple names a non-identifier field.
    pub fn canonical_identifiers(&self, ids: &Identifiers) -> Option<Identifiers> {
        if ids.len() != self.identifier_fields.len() {
            return None;
        }
        let mut out = Identifiers::new();
        for field in &self.identifier_fields {
            out = out.with(field.clone(), ids.get(field)?);
        }
        Some(out)
    }

    /// Validate creation parameters and fill in defaults.
    pub fn prepare_params(
        &self,
        mut params: BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>> {
        if let Some(unknown) = params.keys().find(|k| !self.declares(k)) {
            return Err(Error::validation(
                format!("{}.{}", self.class_name, unknown),
                "parameter is not a declared field",
            ));
        }
        for (field, default) in &self.default_params {
            params
                .entry(field.clone())
                .or_insert_with(|| default.clone());
        }
        if let Some(missing) = self
            .required_params
            .iter()
            .find(|p| !params.contains_key(*p) && !self.is_identifier_field(p))
        {
            return Err(Error::validation(
                format!("{}.{}", self.class_name, missing),
                "required parameter missing",
            ));
        }
        self.identifiers_of(&params)?;
        Ok(params)
    }
}
