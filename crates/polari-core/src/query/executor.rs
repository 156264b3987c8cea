//! Instance selection over the object tree.

use super::filter::{AttributeFilter, FilterEvaluator, InstanceScope};
use crate::tree::{InstanceHandle, ObjectTree};
use std::collections::BTreeMap;

/// Canonical instances of `class_name` matching `filter`, keyed by rendered identifiers.
pub fn select_by_attributes(
    tree: &ObjectTree,
    class_name: &str,
    filter: &AttributeFilter,
) -> BTreeMap<String, InstanceHandle> {
    select_in_scope(tree, class_name, &InstanceScope::filtered(filter.clone()))
}

/// Canonical instances of `class_name` inside `scope`, keyed by rendered identifiers.
pub fn select_in_scope(
    tree: &ObjectTree,
    class_name: &str,
    scope: &InstanceScope,
) -> BTreeMap<String, InstanceHandle> {
    tree.instances_of_class(class_name)
        .into_iter()
        .filter_map(|handle| tree.instance(handle).map(|i| (handle, i)))
        .filter(|(_, instance)| scope.matches(&instance.fields))
        .map(|(handle, instance)| (instance.identifiers.to_string(), handle))
        .collect()
}

/// Count matches without collecting them.
pub fn count_matching(tree: &ObjectTree, class_name: &str, filter: &AttributeFilter) -> usize {
    tree.instances_of_class(class_name)
        .into_iter()
        .filter_map(|handle| tree.instance(handle))
        .filter(|instance| FilterEvaluator::evaluate(filter, &instance.fields))
        .count()
}
