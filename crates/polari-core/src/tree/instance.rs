//! Tracked instances and the arena that owns them.

use crate::typing::Identifiers;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable handle to an instance in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceHandle(usize);

impl InstanceHandle {
    /// Wrap a raw slot index.
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Raw slot index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A typed object tracked by the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// Class name.
    pub class_name: String,
    /// Identifier tuple.
    pub identifiers: Identifiers,
    /// Field values, including identifier fields.
    pub fields: BTreeMap<String, Value>,
    /// Root manager owning this instance's branch, if placed.
    pub manager: Option<InstanceHandle>,
    /// Instance owning the parent branch, if placed below the root.
    pub parent: Option<InstanceHandle>,
}

impl Instance {
    /// Create an unplaced instance.
    pub fn new(
        class_name: impl Into<String>,
        identifiers: Identifiers,
        fields: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            identifiers,
            fields,
            manager: None,
            parent: None,
        }
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Slot arena for instances.
///
/// Handles are never reused, so a stale handle resolves to `None` instead of
/// to an unrelated instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceArena {
    slots: Vec<Option<Instance>>,
}

impl InstanceArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an instance and return its handle.
    pub fn insert(&mut self, instance: Instance) -> InstanceHandle {
        self.slots.push(Some(instance));
        InstanceHandle(self.slots.len() - 1)
    }

    /// Get an instance.
    pub fn get(&self, handle: InstanceHandle) -> Option<&Instance> {
        self.slots.get(handle.0).and_then(Option::as_ref)
    }

    /// Get an instance mutably.
    pub fn get_mut(&mut self, handle: InstanceHandle) -> Option<&mut Instance> {
        self.slots.get_mut(handle.0).and_then(Option::as_mut)
    }

    /// Remove an instance.
    pub fn remove(&mut self, handle: InstanceHandle) -> Option<Instance> {
        self.slots.get_mut(handle.0).and_then(Option::take)
    }

    /// Check if a handle is live.
    pub fn contains(&self, handle: InstanceHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Iterate over live instances.
    pub fn iter(&self) -> impl Iterator<Item = (InstanceHandle, &Instance)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|inst| (InstanceHandle(i), inst)))
    }

    /// Iterate mutably over live instances.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (InstanceHandle, &mut Instance)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|inst| (InstanceHandle(i), inst)))
    }

    /// Number of slots ever allocated, live or not.
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Drop every slot at or past `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
    }

    /// Put a saved slot value back. Slots past the end are ignored.
    pub(crate) fn restore(&mut self, handle: InstanceHandle, instance: Option<Instance>) {
        if let Some(slot) = self.slots.get_mut(handle.0) {
            *slot = instance;
        }
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Check if the arena holds no live instance.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
