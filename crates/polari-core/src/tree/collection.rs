//! Tracked collections: sequence fields that keep the tree in sync on append.

use super::instance::InstanceHandle;
use super::object_tree::ObjectTree;
use crate::error::{Error, Result};
use crate::typing::ReferenceCardinality;
use crate::value::Value;
use std::collections::BTreeSet;
use tracing::warn;

/// A sequence field bound to `(owner, field)`.
///
/// Only [`append`](Self::append) and [`extend`](Self::extend) touch the tree.
/// [`set`](Self::set) and [`remove`](Self::remove) change the sequence only;
/// instances they drop or add keep whatever placement they already had.
#[derive(Debug)]
pub struct TrackedCollection<'t> {
    tree: &'t mut ObjectTree,
    owner: InstanceHandle,
    field: String,
}

impl<'t> TrackedCollection<'t> {
    /// Owner instance.
    pub fn owner(&self) -> InstanceHandle {
        self.owner
    }

    /// Field name.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Append a value, placing any referenced instances first.
    ///
    /// Primitive values are appended directly. For references the owner
    /// field is recorded on the typing, each referenced instance is routed
    /// through the tree's placement rules and the canonical reference is
    /// appended. If placement fails the tree is left as it was and nothing
    /// is appended.
    pub fn append(&mut self, value: impl Into<Value>) -> Result<()> {
        self.extend([value.into()])
    }

    /// Append several values as one unit.
    pub fn extend(&mut self, values: impl IntoIterator<Item = Value>) -> Result<()> {
        let values: Vec<Value> = values.into_iter().collect();
        let (owner, field) = (self.owner, self.field.clone());
        if values.iter().all(Value::is_primitive) {
            self.tree.sequence_mut(owner, &field)?.extend(values);
            return Ok(());
        }

        let result = self.tree.atomically(|tree| {
            let placed = place_all(tree, owner, &field, values)?;
            tree.sequence_mut(owner, &field)?.extend(placed);
            Ok(())
        });
        if let Err(err) = &result {
            warn!(owner = %owner, field = %field, error = %err, "append rolled back");
        }
        result
    }

    /// Replace the element at `index`. No tree side effects.
    pub fn set(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        let field = self.field.clone();
        let items = self.items_mut()?;
        let len = items.len();
        let slot = items
            .get_mut(index)
            .ok_or_else(|| Error::validation(field, format!("index {} out of range for length {}", index, len)))?;
        *slot = value.into();
        Ok(())
    }

    /// Remove and return the element at `index`. No tree side effects.
    pub fn remove(&mut self, index: usize) -> Result<Value> {
        let field = self.field.clone();
        let items = self.items_mut()?;
        if index >= items.len() {
            return Err(Error::validation(
                field,
                format!("index {} out of range for length {}", index, items.len()),
            ));
        }
        Ok(items.remove(index))
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.values().len()
    }

    /// Check if the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }

    /// Element at `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values().get(index)
    }

    /// All elements.
    pub fn values(&self) -> &[Value] {
        self.tree
            .instance(self.owner)
            .and_then(|i| i.get(&self.field))
            .and_then(Value::as_list)
            .unwrap_or(&[])
    }

    fn items_mut(&mut self) -> Result<&mut Vec<Value>> {
        self.tree.sequence_mut(self.owner, &self.field)
    }
}

/// Place each value in turn. A twin merged away by an earlier value is
/// rewritten to its canonical handle before later values are placed.
fn place_all(
    tree: &mut ObjectTree,
    owner: InstanceHandle,
    field: &str,
    values: Vec<Value>,
) -> Result<Vec<Value>> {
    let mut merged: Vec<(InstanceHandle, InstanceHandle)> = Vec::new();
    let mut placed = Vec::with_capacity(values.len());
    for mut value in values {
        for (from, to) in &merged {
            value.replace_ref(*from, *to);
        }
        let before = value.referenced_handles();
        let after = tree.place_value(owner, field, value, ReferenceCardinality::Multi)?;
        merged.extend(
            before
                .into_iter()
                .zip(after.referenced_handles())
                .filter(|(from, to)| from != to),
        );
        placed.push(after);
    }
    Ok(placed)
}

impl ObjectTree {
    /// Bind a tracked collection to `owner.field`.
    ///
    /// The field must be declared on the owner's class and must be unset,
    /// null or a list.
    pub fn collection(&mut self, owner: InstanceHandle, field: &str) -> Result<TrackedCollection<'_>> {
        let class_name = self.get_instance(owner)?.class_name.clone();
        let declared = self.registry().with_typing(&class_name, |t| t.declares(field))?;
        if !declared {
            return Err(Error::validation(
                format!("{}.{}", class_name, field),
                "field is not declared",
            ));
        }
        match self.get_instance(owner)?.get(field) {
            None | Some(Value::Null) | Some(Value::List(_)) => {}
            Some(_) => {
                return Err(Error::validation(
                    format!("{}.{}", class_name, field),
                    "field does not hold a sequence",
                ))
            }
        }
        Ok(TrackedCollection {
            tree: self,
            owner,
            field: field.to_string(),
        })
    }

    /// Assign a scalar field, placing a referenced instance like an append would.
    ///
    /// Assigning an identifier field re-keys the instance in every branch
    /// that mentions it and fails with [`Error::DuplicatePlacement`] if the
    /// new key is taken.
    pub fn assign_field(
        &mut self,
        owner: InstanceHandle,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let value = value.into();
        let class_name = self.get_instance(owner)?.class_name.clone();
        let typing = self.registry().require(&class_name)?;
        if !typing.declares(field) {
            return Err(Error::validation(
                format!("{}.{}", class_name, field),
                "field is not declared",
            ));
        }

        if typing.is_identifier_field(field) {
            let mut fields = self.get_instance(owner)?.fields.clone();
            fields.insert(field.to_string(), value.clone());
            let identifiers = typing.identifiers_of(&fields)?;
            self.rekey(owner, identifiers)?;
            self.get_instance_mut(owner)?
                .fields
                .insert(field.to_string(), value);
            return Ok(());
        }

        if value.is_primitive() {
            self.get_instance_mut(owner)?
                .fields
                .insert(field.to_string(), value);
            return Ok(());
        }

        let cardinality = match value {
            Value::Ref(_) => ReferenceCardinality::Scalar,
            _ => ReferenceCardinality::Multi,
        };
        let result = self.atomically(|tree| {
            let placed = tree.place_value(owner, field, value, cardinality)?;
            tree.get_instance_mut(owner)?
                .fields
                .insert(field.to_string(), placed);
            Ok(())
        });
        if let Err(err) = &result {
            warn!(owner = %owner, field, error = %err, "assignment rolled back");
        }
        result
    }

    /// The list held by `owner.field`, created if the field is unset or null.
    pub(crate) fn sequence_mut(&mut self, owner: InstanceHandle, field: &str) -> Result<&mut Vec<Value>> {
        let instance = self.get_instance_mut(owner)?;
        let segment = format!("{}.{}", instance.class_name, field);
        let slot = instance
            .fields
            .entry(field.to_string())
            .or_insert(Value::Null);
        if slot.is_null() {
            *slot = Value::List(Vec::new());
        }
        match slot {
            Value::List(items) => Ok(items),
            _ => Err(Error::validation(segment, "field does not hold a sequence")),
        }
    }

    /// Place every instance `value` references and rewrite it to canonical handles.
    pub(crate) fn place_value(
        &mut self,
        owner: InstanceHandle,
        field: &str,
        mut value: Value,
        cardinality: ReferenceCardinality,
    ) -> Result<Value> {
        let mut seen = BTreeSet::new();
        for handle in value.referenced_handles() {
            if !seen.insert(handle) {
                continue;
            }
            let (canonical, _) = self.place(owner, field, handle, cardinality)?;
            if canonical != handle {
                value.replace_ref(handle, canonical);
            }
        }
        Ok(value)
    }
}
