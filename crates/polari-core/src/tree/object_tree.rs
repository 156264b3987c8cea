//! Dedup'd hierarchical placement of instances under a root manager.
//!
//! Every placed instance has exactly one owning node. Further placements of
//! the same `(class, identifiers)` become back-reference nodes that resolve
//! to the owner. The owner is the shallowest placement; at equal depth the
//! placement found first in depth-first, left-to-right order wins.
//!
//! Owners are indexed by key and every placement is indexed by instance, so
//! lookups and re-ranking do not walk the whole tree. Mutations are recorded
//! in an undo journal while an [`ObjectTree::atomically`] scope is open.

use super::instance::{Instance, InstanceArena, InstanceHandle};
use super::journal::Frame;
use super::path::{Branch, NodeId, Path, Payload, TreeNode};
use crate::error::{Error, Result};
use crate::typing::{Identifiers, ReferenceCardinality, TypingRegistry};
use crate::value::Value;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `(class, identifiers)` key of a tree branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TreeKey {
    /// Class name.
    pub class_name: String,
    /// Identifier tuple.
    pub identifiers: Identifiers,
}

impl fmt::Display for TreeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class_name, self.identifiers)
    }
}

/// Result of deleting a tree node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteOutcome {
    /// Instances removed from the tree and the arena.
    pub deleted: Vec<TreeKey>,
    /// Instances that survived because a back-reference was promoted.
    pub migrated: Vec<TreeKey>,
}

impl DeleteOutcome {
    /// Rendered identifiers of deleted instances.
    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.iter().map(|k| k.identifiers.to_string()).collect()
    }

    /// Rendered identifiers of promoted instances.
    pub fn migrated_ids(&self) -> Vec<String> {
        self.migrated.iter().map(|k| k.identifiers.to_string()).collect()
    }
}

/// What happened when an instance was routed into the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementOutcome {
    /// A new owning branch was created.
    Attached,
    /// Ownership moved to the new placement; the old one is now a back-reference.
    Migrated,
    /// A back-reference was added; ownership stayed put.
    Referenced,
    /// The instance was already placed here.
    Unchanged,
    /// The owner is not placed yet; placement happens when it is.
    Deferred,
    /// The class is not tree-attachable; the value is kept inline.
    Embedded,
}

/// How the owner of a field is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OwnerKind {
    ManagerRoot,
    Nested,
}

/// Depth, then child positions from the root. Smaller ranks own.
type Rank = (usize, Vec<usize>);

/// The object tree: an instance arena plus a node arena.
#[derive(Debug, Clone)]
pub struct ObjectTree {
    registry: Arc<TypingRegistry>,
    instances: InstanceArena,
    nodes: Vec<Option<TreeNode>>,
    root: NodeId,
    root_handle: InstanceHandle,
    owners: HashMap<InstanceHandle, NodeId>,
    keys: HashMap<TreeKey, InstanceHandle>,
    placements: HashMap<InstanceHandle, Vec<NodeId>>,
    journal: Vec<Frame>,
    max_depth: Option<usize>,
}

impl ObjectTree {
    /// Create a tree rooted at a manager-root instance.
    pub fn new(registry: Arc<TypingRegistry>, root: Instance) -> Result<Self> {
        let is_root = registry.with_typing(&root.class_name, |t| t.capabilities.is_manager_root)?;
        if !is_root {
            return Err(Error::validation(
                root.class_name.clone(),
                "root instance class is not a manager root",
            ));
        }

        let class_name = root.class_name.clone();
        let identifiers = root.identifiers.clone();
        let mut instances = InstanceArena::new();
        let root_handle = instances.insert(root);
        let root_node = TreeNode {
            branch: Branch::owned(class_name.clone(), identifiers.clone(), root_handle),
            parent: None,
            children: Vec::new(),
        };

        let mut tree = Self {
            registry,
            instances,
            nodes: vec![Some(root_node)],
            root: NodeId(0),
            root_handle,
            owners: HashMap::new(),
            keys: HashMap::new(),
            placements: HashMap::new(),
            journal: Vec::new(),
            max_depth: None,
        };
        tree.owners.insert(root_handle, NodeId(0));
        tree.placements.insert(root_handle, vec![NodeId(0)]);
        let key = tree.tree_key(&class_name, &identifiers);
        tree.keys.insert(key, root_handle);
        Ok(tree)
    }

    /// Limit how deep branches may be placed.
    pub fn with_max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// The typing registry this tree validates against.
    pub fn registry(&self) -> &Arc<TypingRegistry> {
        &self.registry
    }

    /// Handle of the root manager instance.
    pub fn root_handle(&self) -> InstanceHandle {
        self.root_handle
    }

    /// Path of the root node.
    pub fn root_path(&self) -> Result<Path> {
        self.path_of_node(self.root)
    }

    /// Run `f` as one unit: if it fails, every tree change it made is undone.
    ///
    /// Scopes nest; a committed inner scope is still undone if an outer one
    /// fails. Reference fields recorded on the typing registry are kept.
    pub fn atomically<R>(&mut self, f: impl FnOnce(&mut ObjectTree) -> Result<R>) -> Result<R> {
        self.journal
            .push(Frame::new(self.nodes.len(), self.instances.slot_count()));
        let result = f(self);
        let frame = match self.journal.pop() {
            Some(frame) => frame,
            None => return result,
        };
        match result {
            Ok(out) => {
                if let Some(outer) = self.journal.last_mut() {
                    outer.absorb(frame);
                }
                Ok(out)
            }
            Err(err) => {
                self.rollback(frame);
                Err(err)
            }
        }
    }

    /// Add an unplaced instance to the arena.
    ///
    /// A complete identifier tuple is reordered into declaration order.
    pub fn insert_instance(&mut self, mut instance: Instance) -> Result<InstanceHandle> {
        if !self.registry.contains(&instance.class_name) {
            return Err(Error::UnknownClass(instance.class_name));
        }
        let canonical = self.registry.with_typing(&instance.class_name, |t| {
            t.canonical_identifiers(&instance.identifiers)
        })?;
        if let Some(identifiers) = canonical {
            instance.identifiers = identifiers;
        }
        Ok(self.instances.insert(instance))
    }

    /// Create an unplaced instance through the registry's creation rules.
    pub fn create_instance(
        &mut self,
        class_name: &str,
        params: BTreeMap<String, Value>,
    ) -> Result<InstanceHandle> {
        let instance = self.registry.create_instance(class_name, params)?;
        Ok(self.instances.insert(instance))
    }

    /// Get an instance.
    pub fn instance(&self, handle: InstanceHandle) -> Option<&Instance> {
        self.instances.get(handle)
    }

    /// Get an instance or fail with [`Error::UnknownInstance`].
    pub fn get_instance(&self, handle: InstanceHandle) -> Result<&Instance> {
        self.instances
            .get(handle)
            .ok_or(Error::UnknownInstance(handle.index()))
    }

    pub(crate) fn get_instance_mut(&mut self, handle: InstanceHandle) -> Result<&mut Instance> {
        self.touch_instance(handle);
        self.instances
            .get_mut(handle)
            .ok_or(Error::UnknownInstance(handle.index()))
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Find the canonical path of `(class, identifiers)`.
    ///
    /// A complete identifier tuple is an index lookup. A partial one is
    /// matched against every owner, and fails with
    /// [`Error::AmbiguousPlacement`] if more than one owner matches.
    pub fn locate(&self, class_name: &str, identifiers: &Identifiers) -> Result<Option<Path>> {
        match self.locate_node(class_name, identifiers)? {
            Some(id) => Ok(Some(self.path_of_node(id)?)),
            None => Ok(None),
        }
    }

    /// Find the canonical instance handle of `(class, identifiers)`.
    pub fn locate_handle(
        &self,
        class_name: &str,
        identifiers: &Identifiers,
    ) -> Result<Option<InstanceHandle>> {
        match self.locate_node(class_name, identifiers)? {
            Some(id) => Ok(Some(self.node(id)?.branch.payload.handle())),
            None => Ok(None),
        }
    }

    /// Owning path of an instance, if placed.
    pub fn path_of(&self, handle: InstanceHandle) -> Result<Option<Path>> {
        match self.owners.get(&handle) {
            Some(id) => Ok(Some(self.path_of_node(*id)?)),
            None => Ok(None),
        }
    }

    /// Paths of every back-reference to an instance, in depth-first order.
    pub fn references_of(&self, handle: InstanceHandle) -> Result<Vec<Path>> {
        self.placements_of(handle)?
            .into_iter()
            .filter(|id| self.owners.get(&handle) != Some(id))
            .map(|id| self.path_of_node(id))
            .collect()
    }

    /// Payload at a path.
    pub fn payload_at(&self, path: &Path) -> Result<Payload> {
        let id = self.resolve_path(path)?;
        Ok(self.node(id)?.branch.payload)
    }

    /// Instance a path leads to, following back-references.
    pub fn resolve(&self, path: &Path) -> Result<InstanceHandle> {
        Ok(self.payload_at(path)?.handle())
    }

    /// Canonical instances of a class in depth-first order.
    pub fn instances_of_class(&self, class_name: &str) -> Vec<InstanceHandle> {
        self.dfs_order()
            .into_iter()
            .filter_map(|id| self.node(id).ok())
            .filter(|n| n.branch.payload.is_owner() && n.branch.class_name == class_name)
            .map(|n| n.branch.payload.handle())
            .collect()
    }

    /// Every owning node as `(path, handle)` in depth-first order.
    pub fn canonical_nodes(&self) -> Result<Vec<(Path, InstanceHandle)>> {
        let mut out = Vec::new();
        for id in self.dfs_order() {
            let node = self.node(id)?;
            if let Payload::Instance(handle) = node.branch.payload {
                out.push((self.path_of_node(id)?, handle));
            }
        }
        Ok(out)
    }

    /// Add a new owning branch (or back-reference) under `parent_path`.
    ///
    /// An owning branch requires the instance to be unplaced and no other
    /// owner for its `(class, identifiers)`; otherwise this fails with
    /// [`Error::DuplicatePlacement`].
    pub fn attach(&mut self, parent_path: &Path, branch: Branch) -> Result<()> {
        let parent = self.resolve_path(parent_path)?;
        self.attach_under(parent, branch).map(|_| ())
    }

    /// Move ownership of `handle` from `old_path` to a branch under `new_parent_path`.
    ///
    /// The old node becomes a back-reference; descendants move with the owner.
    pub fn migrate(
        &mut self,
        old_path: &Path,
        new_parent_path: &Path,
        handle: InstanceHandle,
    ) -> Result<()> {
        let old = self.resolve_path(old_path)?;
        if self.node(old)?.branch.payload != Payload::Instance(handle) {
            return Err(Error::validation(
                old_path.to_string(),
                format!("path does not own instance {}", handle),
            ));
        }
        let new_parent = self.resolve_path(new_parent_path)?;
        if self.is_within(new_parent, old)? {
            return Err(Error::validation(
                new_parent_path.to_string(),
                "cannot migrate an instance below itself",
            ));
        }
        let target = self.reference_slot(new_parent, old)?;
        self.move_ownership(old, target)?;
        self.settle(target, None)
    }

    /// Remove the owning node of `(class, identifiers)`.
    ///
    /// If a back-reference exists outside the removed subtree, the best one
    /// (shallowest, then first depth-first) is promoted to owner and the
    /// instance is reported as migrated. Otherwise the instance is deleted,
    /// its owned descendants are handled the same way, and references to it
    /// are removed from the tree and from every instance's fields.
    pub fn delete_tree_node(
        &mut self,
        class_name: &str,
        identifiers: &Identifiers,
    ) -> Result<DeleteOutcome> {
        let node = self
            .locate_node(class_name, identifiers)?
            .ok_or_else(|| Error::NotFound {
                class_name: class_name.to_string(),
                filter: identifiers.to_string(),
            })?;
        if node == self.root {
            return Err(Error::validation(
                class_name,
                "the manager root cannot be deleted",
            ));
        }

        let mut outcome = DeleteOutcome::default();
        self.delete_owned(node, node, &mut outcome)?;
        info!(
            class = class_name,
            identifiers = %identifiers,
            deleted = outcome.deleted.len(),
            migrated = outcome.migrated.len(),
            "tree node deleted"
        );
        Ok(outcome)
    }

    /// Re-key an instance in every branch tuple that mentions it.
    ///
    /// Changed identifier fields keep the value type they had when the new
    /// rendering parses as that type, so `7` stays an integer.
    pub fn replace_original_tuple(
        &mut self,
        class_name: &str,
        old_identifiers: &Identifiers,
        new_identifiers: Identifiers,
    ) -> Result<()> {
        let typing = self.registry.require(class_name)?;
        if let Some((field, _)) = new_identifiers
            .iter()
            .find(|(f, _)| !typing.is_identifier_field(f))
        {
            return Err(Error::validation(
                format!("{}.{}", class_name, field),
                "not an identifier field",
            ));
        }
        if !typing.is_complete(&new_identifiers) {
            return Err(Error::IdentifierIncomplete {
                class_name: class_name.to_string(),
                missing: typing
                    .identifier_fields
                    .iter()
                    .filter(|f| new_identifiers.get(f).is_none())
                    .cloned()
                    .collect(),
            });
        }
        let handle = self
            .locate_handle(class_name, old_identifiers)?
            .ok_or_else(|| Error::NotFound {
                class_name: class_name.to_string(),
                filter: old_identifiers.to_string(),
            })?;

        self.rekey(handle, new_identifiers.clone())?;
        let instance = self.get_instance_mut(handle)?;
        for (field, rendered) in new_identifiers.iter() {
            let current = instance.fields.get(field);
            if current.and_then(Value::render_key).as_deref() != Some(rendered) {
                let value = retyped(current, rendered);
                instance.fields.insert(field.to_string(), value);
            }
        }
        Ok(())
    }

    /// Dump the tree as nested JSON.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        self.node_json(self.root)
    }

    fn node_json(&self, id: NodeId) -> Result<serde_json::Value> {
        let node = self.node(id)?;
        let mut out = serde_json::Map::new();
        out.insert("class".into(), node.branch.class_name.clone().into());
        out.insert("id".into(), node.branch.identifiers.to_string().into());
        match node.branch.payload {
            Payload::Instance(_) => {
                let children = node
                    .children
                    .iter()
                    .map(|c| self.node_json(*c))
                    .collect::<Result<Vec<_>>>()?;
                if !children.is_empty() {
                    out.insert("children".into(), children.into());
                }
            }
            Payload::Reference(handle) => {
                let target = self
                    .path_of(handle)?
                    .map(|p| p.to_string())
                    .unwrap_or_default();
                out.insert("ref".into(), target.into());
            }
        }
        Ok(serde_json::Value::Object(out))
    }

    // ----- placement policy -----

    /// Route `value` into the tree as referenced by `owner.field`.
    ///
    /// Returns the canonical handle for `(class, identifiers)` of `value`
    /// together with what happened. An unplaced twin of an already placed
    /// key is merged into the canonical instance and leaves the arena.
    pub(crate) fn place(
        &mut self,
        owner: InstanceHandle,
        field: &str,
        value: InstanceHandle,
        cardinality: ReferenceCardinality,
    ) -> Result<(InstanceHandle, PlacementOutcome)> {
        let (value_class, fields) = {
            let instance = self.get_instance(value)?;
            (instance.class_name.clone(), instance.fields.clone())
        };
        let typing = self.registry.require(&value_class)?;
        if !typing.capabilities.is_tree_attachable {
            return Ok((value, PlacementOutcome::Embedded));
        }

        let owner_class = self.get_instance(owner)?.class_name.clone();
        self.registry
            .record_reference(&owner_class, field, &value_class, cardinality)?;

        let identifiers = typing.identifiers_of(&fields)?;
        let parent = match self.attachment_point(owner)? {
            Some(parent) => parent,
            None => return Ok((value, PlacementOutcome::Deferred)),
        };

        let owner_node = match self.locate_node(&value_class, &identifiers)? {
            Some(node) => node,
            None => {
                let branch = Branch::owned(value_class, identifiers, value).via(field);
                self.attach_under(parent, branch)?;
                self.cascade(value)?;
                return Ok((value, PlacementOutcome::Attached));
            }
        };

        let canonical = self.node(owner_node)?.branch.payload.handle();
        let outcome = if self.node(owner_node)?.parent == Some(parent)
            || self.child_with(parent, &value_class, &identifiers)?.is_some()
        {
            PlacementOutcome::Unchanged
        } else {
            let reference = Branch::reference(value_class, identifiers, canonical).via(field);
            let reference = self.attach_under(parent, reference)?;
            if self.outranks(reference, owner_node)? {
                self.move_ownership(owner_node, reference)?;
                self.settle(reference, None)?;
                PlacementOutcome::Migrated
            } else {
                PlacementOutcome::Referenced
            }
        };
        if canonical != value {
            self.merge_duplicate(value, canonical)?;
        }
        Ok((canonical, outcome))
    }

    /// Place every instance a newly owned instance already references.
    fn cascade(&mut self, handle: InstanceHandle) -> Result<()> {
        let fields: Vec<String> = self
            .get_instance(handle)?
            .fields
            .iter()
            .filter(|(_, v)| !v.is_primitive())
            .map(|(k, _)| k.clone())
            .collect();

        for field in fields {
            // re-read: merging a twin rewrites references held by this instance
            let value = match self.get_instance(handle)?.fields.get(&field) {
                Some(value) => value.clone(),
                None => continue,
            };
            let cardinality = match value {
                Value::Ref(_) => ReferenceCardinality::Scalar,
                _ => ReferenceCardinality::Multi,
            };
            let mut seen = BTreeSet::new();
            for target in value.referenced_handles() {
                if !seen.insert(target) {
                    continue;
                }
                let (canonical, _) = self.place(handle, &field, target, cardinality)?;
                if canonical != target {
                    if let Some(slot) = self.get_instance_mut(handle)?.fields.get_mut(&field) {
                        slot.replace_ref(target, canonical);
                    }
                }
            }
        }
        Ok(())
    }

    /// Fold an unplaced twin into the canonical instance for its key.
    ///
    /// Field references to the twin are rewritten to the canonical handle
    /// and the twin leaves the arena; its own field values are dropped.
    fn merge_duplicate(&mut self, duplicate: InstanceHandle, canonical: InstanceHandle) -> Result<()> {
        if self.owners.contains_key(&duplicate) || self.placements.contains_key(&duplicate) {
            return Ok(());
        }
        let holders: Vec<InstanceHandle> = self
            .instances
            .iter()
            .filter(|(_, instance)| {
                instance
                    .fields
                    .values()
                    .any(|v| v.referenced_handles().contains(&duplicate))
            })
            .map(|(handle, _)| handle)
            .collect();
        for holder in holders {
            for value in self.get_instance_mut(holder)?.fields.values_mut() {
                value.replace_ref(duplicate, canonical);
            }
        }
        self.touch_instance(duplicate);
        self.instances.remove(duplicate);
        debug!(duplicate = %duplicate, canonical = %canonical, "duplicate instance merged");
        Ok(())
    }

    pub(crate) fn classify_owner(&self, owner: InstanceHandle) -> Result<OwnerKind> {
        let class_name = &self.get_instance(owner)?.class_name;
        let is_root = self
            .registry
            .with_typing(class_name, |t| t.capabilities.is_manager_root)?;
        Ok(if is_root {
            OwnerKind::ManagerRoot
        } else {
            OwnerKind::Nested
        })
    }

    /// Node new branches for `owner` hang off, or `None` if the owner is unplaced.
    fn attachment_point(&self, owner: InstanceHandle) -> Result<Option<NodeId>> {
        match self.classify_owner(owner)? {
            OwnerKind::ManagerRoot if owner == self.root_handle => Ok(Some(self.root)),
            OwnerKind::ManagerRoot => Err(Error::validation(
                owner.to_string(),
                "manager root instance does not belong to this tree",
            )),
            OwnerKind::Nested => Ok(self.owners.get(&owner).copied()),
        }
    }

    /// Whether `candidate` should own instead of `incumbent`.
    fn outranks(&self, candidate: NodeId, incumbent: NodeId) -> Result<bool> {
        Ok(self.rank(candidate)? < self.rank(incumbent)?)
    }

    fn rank(&self, id: NodeId) -> Result<Rank> {
        let key = self.order_key(id)?;
        Ok((key.len(), key))
    }

    /// Best-ranked placement of `handle`, ignoring placements inside `avoid`.
    fn best_placement(&self, handle: InstanceHandle, avoid: Option<NodeId>) -> Result<Option<NodeId>> {
        let mut best: Option<(Rank, NodeId)> = None;
        for id in self.placements.get(&handle).into_iter().flatten() {
            if let Some(avoid) = avoid {
                if self.is_within(*id, avoid)? {
                    continue;
                }
            }
            let rank = self.rank(*id)?;
            if best.as_ref().map_or(true, |(r, _)| rank < *r) {
                best = Some((rank, *id));
            }
        }
        Ok(best.map(|(_, id)| id))
    }

    /// Re-rank every instance placed at or below `top` against all of its
    /// placements tree-wide, moving ownership to the best one.
    ///
    /// Subtrees that move are settled in turn. Owners inside `avoid` are
    /// left alone and placements inside it never win.
    fn settle(&mut self, top: NodeId, avoid: Option<NodeId>) -> Result<()> {
        let mut budget = self.nodes.len().saturating_mul(2);
        let mut pending = vec![top];
        while let Some(start) = pending.pop() {
            if !self.is_live(start) {
                continue;
            }
            let mut promotion = None;
            for id in self.dfs_from(start) {
                let handle = self.node(id)?.branch.payload.handle();
                let owner = self.owner_node(handle)?;
                if let Some(avoid) = avoid {
                    if self.is_within(owner, avoid)? {
                        continue;
                    }
                }
                match self.best_placement(handle, avoid)? {
                    Some(best) if best != owner => {
                        promotion = Some((owner, best));
                        break;
                    }
                    _ => {}
                }
            }
            let (owner, best) = match promotion {
                Some(promotion) => promotion,
                None => continue,
            };
            if budget == 0 {
                warn!(node = top.0, "ownership did not settle");
                return Ok(());
            }
            budget -= 1;
            self.move_ownership(owner, best)?;
            pending.push(start);
            pending.push(best);
        }
        Ok(())
    }

    /// Swap ownership from one node to another; children follow the owner.
    fn move_ownership(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        let handle = self.node(from)?.branch.payload.handle();
        let children = std::mem::take(&mut self.node_mut(from)?.children);
        for child in &children {
            self.node_mut(*child)?.parent = Some(to);
        }
        {
            let to_node = self.node_mut(to)?;
            to_node.children.extend(children);
            to_node.branch.payload = Payload::Instance(handle);
        }
        self.node_mut(from)?.branch.payload = Payload::Reference(handle);
        self.set_owner(handle, Some(to));

        if let Some(parent) = self.node(to)?.parent {
            let parent_handle = self.node(parent)?.branch.payload.handle();
            self.set_back_pointers(handle, parent_handle)?;
        }
        debug!(
            instance = %handle,
            from = %self.path_of_node(from)?,
            to = %self.path_of_node(to)?,
            "ownership migrated"
        );
        Ok(())
    }

    fn set_back_pointers(&mut self, handle: InstanceHandle, parent: InstanceHandle) -> Result<()> {
        let root = self.root_handle;
        let instance = self.get_instance_mut(handle)?;
        instance.manager = Some(root);
        instance.parent = Some(parent);
        Ok(())
    }

    // ----- node arena -----

    fn node(&self, id: NodeId) -> Result<&TreeNode> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::InvalidPath(format!("dangling node {}", id.0)))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut TreeNode> {
        self.touch_node(id);
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::InvalidPath(format!("dangling node {}", id.0)))
    }

    fn is_live(&self, id: NodeId) -> bool {
        self.nodes.get(id.0).is_some_and(Option::is_some)
    }

    fn owner_node(&self, handle: InstanceHandle) -> Result<NodeId> {
        self.owners
            .get(&handle)
            .copied()
            .ok_or(Error::UnknownInstance(handle.index()))
    }

    fn attach_under(&mut self, parent: NodeId, branch: Branch) -> Result<NodeId> {
        let parent_handle = match self.node(parent)?.branch.payload {
            Payload::Instance(handle) => handle,
            Payload::Reference(_) => {
                return Err(Error::validation(
                    self.path_of_node(parent)?.to_string(),
                    "branches can only be attached under an owning node",
                ))
            }
        };
        if let Some(max_depth) = self.max_depth {
            if self.depth_of(parent)? + 1 > max_depth {
                return Err(Error::validation(
                    self.path_of_node(parent)?.to_string(),
                    format!("placement would exceed max depth {}", max_depth),
                ));
            }
        }
        if let Some(existing) = self.child_with(parent, &branch.class_name, &branch.identifiers)? {
            return Err(self.duplicate(&branch, existing)?);
        }

        let handle = branch.payload.handle();
        let instance = self.get_instance(handle)?;
        if instance.class_name != branch.class_name || instance.identifiers != branch.identifiers {
            return Err(Error::validation(
                branch.segment().to_string(),
                format!("branch tuple does not match instance {}", handle),
            ));
        }
        match branch.payload {
            Payload::Instance(_) => {
                if let Some(owner) = self.owners.get(&handle).copied() {
                    return Err(self.duplicate(&branch, owner)?);
                }
                if let Some(owner) = self.locate_node(&branch.class_name, &branch.identifiers)? {
                    return Err(self.duplicate(&branch, owner)?);
                }
            }
            Payload::Reference(_) => {
                if !self.owners.contains_key(&handle) {
                    return Err(Error::validation(
                        branch.segment().to_string(),
                        "back-reference target is not placed",
                    ));
                }
            }
        }

        let id = NodeId(self.nodes.len());
        let payload = branch.payload;
        let key = self.tree_key(&branch.class_name, &branch.identifiers);
        self.nodes.push(Some(TreeNode {
            branch,
            parent: Some(parent),
            children: Vec::new(),
        }));
        self.node_mut(parent)?.children.push(id);
        self.add_placement(handle, id);
        if let Payload::Instance(handle) = payload {
            self.set_owner(handle, Some(id));
            self.set_key(key, Some(handle));
            self.set_back_pointers(handle, parent_handle)?;
            debug!(instance = %handle, path = %self.path_of_node(id)?, "branch attached");
        }
        Ok(id)
    }

    /// Existing back-reference for `owner`'s instance under `parent`, or a new one.
    fn reference_slot(&mut self, parent: NodeId, owner: NodeId) -> Result<NodeId> {
        let branch = self.node(owner)?.branch.clone();
        let handle = branch.payload.handle();
        if let Some(existing) = self.child_with(parent, &branch.class_name, &branch.identifiers)? {
            if self.node(existing)?.branch.payload == Payload::Reference(handle) {
                return Ok(existing);
            }
            return Err(self.duplicate(&branch, existing)?);
        }
        let reference = Branch::reference(branch.class_name, branch.identifiers, handle);
        self.attach_under(parent, reference)
    }

    fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            self.touch_node(current);
            let node = match self.nodes.get_mut(current.0).and_then(Option::take) {
                Some(node) => node,
                None => continue,
            };
            if current == id {
                if let Some(parent) = node.parent {
                    self.node_mut(parent)?.children.retain(|c| *c != id);
                }
            }
            let handle = node.branch.payload.handle();
            self.drop_placement(handle, current);
            if node.branch.payload.is_owner() && self.owners.get(&handle) == Some(&current) {
                self.set_owner(handle, None);
                let key = self.tree_key(&node.branch.class_name, &node.branch.identifiers);
                if self.keys.get(&key) == Some(&handle) {
                    self.set_key(key, None);
                }
            }
            stack.extend(node.children);
        }
        Ok(())
    }

    fn delete_owned(
        &mut self,
        node: NodeId,
        doomed: NodeId,
        outcome: &mut DeleteOutcome,
    ) -> Result<()> {
        let branch = self.node(node)?.branch.clone();
        let handle = branch.payload.handle();
        let key = TreeKey {
            class_name: branch.class_name.clone(),
            identifiers: branch.identifiers.clone(),
        };
        self.unlink_from_parent_field(node)?;

        let mut survivor: Option<(Rank, NodeId)> = None;
        for candidate in self.placements_of(handle)? {
            if candidate == node || self.is_within(candidate, doomed)? {
                continue;
            }
            let rank = self.rank(candidate)?;
            if survivor.as_ref().map_or(true, |(best, _)| rank < *best) {
                survivor = Some((rank, candidate));
            }
        }

        if let Some((_, survivor)) = survivor {
            self.move_ownership(node, survivor)?;
            self.remove_node(node)?;
            self.settle(survivor, Some(doomed))?;
            outcome.migrated.push(key);
            return Ok(());
        }

        let children = self.node(node)?.children.clone();
        for child in children {
            // an earlier sibling's deletion may have taken this node with it
            if !self.is_live(child) {
                continue;
            }
            if self.node(child)?.branch.payload.is_owner() {
                self.delete_owned(child, doomed, outcome)?;
            } else {
                self.remove_node(child)?;
            }
        }
        self.remove_node(node)?;
        for reference in self.placements_of(handle)? {
            self.remove_node(reference)?;
        }
        if self.owners.contains_key(&handle) {
            self.set_owner(handle, None);
        }
        self.touch_instance(handle);
        self.instances.remove(handle);
        let holders: Vec<InstanceHandle> = self
            .instances
            .iter()
            .filter(|(_, instance)| {
                instance
                    .fields
                    .values()
                    .any(|v| v.referenced_handles().contains(&handle))
            })
            .map(|(h, _)| h)
            .collect();
        for holder in holders {
            for value in self.get_instance_mut(holder)?.fields.values_mut() {
                value.strip_ref(handle);
            }
        }
        outcome.deleted.push(key);
        Ok(())
    }

    /// Drop the parent's field reference that produced this branch.
    fn unlink_from_parent_field(&mut self, node: NodeId) -> Result<()> {
        let (parent, field, handle) = {
            let n = self.node(node)?;
            match (n.parent, n.branch.via_field.clone()) {
                (Some(parent), Some(field)) => (parent, field, n.branch.payload.handle()),
                _ => return Ok(()),
            }
        };
        let parent_handle = self.node(parent)?.branch.payload.handle();
        if let Ok(instance) = self.get_instance_mut(parent_handle) {
            if let Some(value) = instance.fields.get_mut(&field) {
                value.strip_ref(handle);
            }
        }
        Ok(())
    }

    pub(crate) fn rekey(&mut self, handle: InstanceHandle, identifiers: Identifiers) -> Result<()> {
        let class_name = self.get_instance(handle)?.class_name.clone();
        let identifiers = self
            .registry
            .with_typing(&class_name, |t| t.canonical_identifiers(&identifiers))?
            .unwrap_or(identifiers);
        if let Some(existing) = self.locate_node(&class_name, &identifiers)? {
            if self.node(existing)?.branch.payload.handle() != handle {
                let branch = Branch::owned(class_name, identifiers, handle);
                return Err(self.duplicate(&branch, existing)?);
            }
        }
        let placements = self.placements_of(handle)?;
        for placement in &placements {
            if let Some(parent) = self.node(*placement)?.parent {
                if let Some(clash) = self.child_with(parent, &class_name, &identifiers)? {
                    if clash != *placement {
                        let branch = Branch::reference(class_name, identifiers, handle);
                        return Err(self.duplicate(&branch, clash)?);
                    }
                }
            }
        }

        if self.owners.contains_key(&handle) {
            let old_identifiers = self.get_instance(handle)?.identifiers.clone();
            let old_key = self.tree_key(&class_name, &old_identifiers);
            if self.keys.get(&old_key) == Some(&handle) {
                self.set_key(old_key, None);
            }
            let new_key = self.tree_key(&class_name, &identifiers);
            self.set_key(new_key, Some(handle));
        }
        for placement in placements {
            self.node_mut(placement)?.branch.identifiers = identifiers.clone();
        }
        self.get_instance_mut(handle)?.identifiers = identifiers;
        Ok(())
    }

    fn duplicate(&self, branch: &Branch, existing: NodeId) -> Result<Error> {
        Ok(Error::DuplicatePlacement {
            class_name: branch.class_name.clone(),
            identifiers: branch.identifiers.to_string(),
            path: self.path_of_node(existing)?.to_string(),
        })
    }

    // ----- indices and journal -----

    fn tree_key(&self, class_name: &str, identifiers: &Identifiers) -> TreeKey {
        let identifiers = self
            .registry
            .with_typing(class_name, |t| t.canonical_identifiers(identifiers))
            .ok()
            .flatten()
            .unwrap_or_else(|| identifiers.clone());
        TreeKey {
            class_name: class_name.to_string(),
            identifiers,
        }
    }

    fn set_owner(&mut self, handle: InstanceHandle, owner: Option<NodeId>) {
        if let Some(frame) = self.journal.last_mut() {
            if !frame.owners.contains_key(&handle) {
                frame.owners.insert(handle, self.owners.get(&handle).copied());
            }
        }
        match owner {
            Some(id) => self.owners.insert(handle, id),
            None => self.owners.remove(&handle),
        };
    }

    fn set_key(&mut self, key: TreeKey, handle: Option<InstanceHandle>) {
        if let Some(frame) = self.journal.last_mut() {
            if !frame.keys.contains_key(&key) {
                frame.keys.insert(key.clone(), self.keys.get(&key).copied());
            }
        }
        match handle {
            Some(handle) => self.keys.insert(key, handle),
            None => self.keys.remove(&key),
        };
    }

    fn add_placement(&mut self, handle: InstanceHandle, id: NodeId) {
        self.touch_placements(handle);
        self.placements.entry(handle).or_default().push(id);
    }

    fn drop_placement(&mut self, handle: InstanceHandle, id: NodeId) {
        self.touch_placements(handle);
        if let Some(ids) = self.placements.get_mut(&handle) {
            ids.retain(|p| *p != id);
            if ids.is_empty() {
                self.placements.remove(&handle);
            }
        }
    }

    fn touch_placements(&mut self, handle: InstanceHandle) {
        if let Some(frame) = self.journal.last_mut() {
            if !frame.placements.contains_key(&handle) {
                let saved = self.placements.get(&handle).cloned().unwrap_or_default();
                frame.placements.insert(handle, saved);
            }
        }
    }

    fn touch_node(&mut self, id: NodeId) {
        if let Some(frame) = self.journal.last_mut() {
            if id.0 < frame.node_len && !frame.nodes.contains_key(&id) {
                frame.nodes.insert(id, self.nodes.get(id.0).cloned().flatten());
            }
        }
    }

    fn touch_instance(&mut self, handle: InstanceHandle) {
        if let Some(frame) = self.journal.last_mut() {
            if handle.index() < frame.instance_len && !frame.instances.contains_key(&handle) {
                frame.instances.insert(handle, self.instances.get(handle).cloned());
            }
        }
    }

    fn rollback(&mut self, frame: Frame) {
        self.nodes.truncate(frame.node_len);
        for (id, node) in frame.nodes {
            if let Some(slot) = self.nodes.get_mut(id.0) {
                *slot = node;
            }
        }
        self.instances.truncate(frame.instance_len);
        for (handle, instance) in frame.instances {
            self.instances.restore(handle, instance);
        }
        for (handle, owner) in frame.owners {
            match owner {
                Some(id) => self.owners.insert(handle, id),
                None => self.owners.remove(&handle),
            };
        }
        for (key, handle) in frame.keys {
            match handle {
                Some(handle) => self.keys.insert(key, handle),
                None => self.keys.remove(&key),
            };
        }
        for (handle, ids) in frame.placements {
            if ids.is_empty() {
                self.placements.remove(&handle);
            } else {
                self.placements.insert(handle, ids);
            }
        }
        debug!(nodes = self.nodes.len(), "tree changes rolled back");
    }

    // ----- traversal -----

    fn locate_node(&self, class_name: &str, identifiers: &Identifiers) -> Result<Option<NodeId>> {
        let exact = self
            .registry
            .with_typing(class_name, |t| t.canonical_identifiers(identifiers))
            .ok()
            .flatten();
        if let Some(identifiers) = exact {
            let key = TreeKey {
                class_name: class_name.to_string(),
                identifiers,
            };
            return Ok(self.keys.get(&key).and_then(|h| self.owners.get(h)).copied());
        }

        let mut matches = Vec::new();
        for id in self.owners.values() {
            let node = self.node(*id)?;
            if node.branch.class_name == class_name && node.branch.identifiers.matches(identifiers) {
                matches.push((self.order_key(*id)?, *id));
            }
        }
        matches.sort();
        match matches.as_slice() {
            [] => Ok(None),
            [(_, only)] => Ok(Some(*only)),
            many => Err(Error::AmbiguousPlacement {
                class_name: class_name.to_string(),
                identifiers: identifiers.to_string(),
                matches: many
                    .iter()
                    .map(|(_, id)| self.path_of_node(*id).map(|p| p.to_string()))
                    .collect::<Result<Vec<_>>>()?,
            }),
        }
    }

    fn resolve_path(&self, path: &Path) -> Result<NodeId> {
        let invalid = || Error::InvalidPath(path.to_string());
        let mut segments = path.segments().iter();
        let first = segments.next().ok_or_else(invalid)?;
        if self.node(self.root)?.branch.segment() != *first {
            return Err(invalid());
        }
        let mut current = self.root;
        for segment in segments {
            current = self
                .child_with(current, &segment.class_name, &segment.identifiers)?
                .ok_or_else(invalid)?;
        }
        Ok(current)
    }

    fn child_with(
        &self,
        parent: NodeId,
        class_name: &str,
        identifiers: &Identifiers,
    ) -> Result<Option<NodeId>> {
        for child in &self.node(parent)?.children {
            let node = self.node(*child)?;
            if node.branch.class_name == class_name && node.branch.identifiers == *identifiers {
                return Ok(Some(*child));
            }
        }
        Ok(None)
    }

    fn path_of_node(&self, id: NodeId) -> Result<Path> {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(n) = current {
            let node = self.node(n)?;
            segments.push(node.branch.segment());
            current = node.parent;
        }
        segments.reverse();
        Ok(Path::new(segments))
    }

    /// Child positions from the root down to `id`.
    ///
    /// Keys compare in depth-first, left-to-right order: an ancestor's key
    /// is a prefix of its descendants' keys.
    fn order_key(&self, id: NodeId) -> Result<Vec<usize>> {
        let mut key = Vec::new();
        let mut current = id;
        while let Some(parent) = self.node(current)?.parent {
            let position = self
                .node(parent)?
                .children
                .iter()
                .position(|c| *c == current)
                .ok_or_else(|| Error::InvalidPath(format!("node {} is detached", current.0)))?;
            key.push(position);
            current = parent;
        }
        key.reverse();
        Ok(key)
    }

    fn depth_of(&self, id: NodeId) -> Result<usize> {
        let mut depth = 0;
        let mut current = self.node(id)?.parent;
        while let Some(parent) = current {
            depth += 1;
            current = self.node(parent)?.parent;
        }
        Ok(depth)
    }

    fn is_within(&self, id: NodeId, ancestor: NodeId) -> Result<bool> {
        let mut current = Some(id);
        while let Some(n) = current {
            if n == ancestor {
                return Ok(true);
            }
            current = self.node(n)?.parent;
        }
        Ok(false)
    }

    /// Every node carrying `handle`, in depth-first order.
    fn placements_of(&self, handle: InstanceHandle) -> Result<Vec<NodeId>> {
        let mut ranked = self
            .placements
            .get(&handle)
            .into_iter()
            .flatten()
            .map(|id| -> Result<(Vec<usize>, NodeId)> { Ok((self.order_key(*id)?, *id)) })
            .collect::<Result<Vec<_>>>()?;
        ranked.sort();
        Ok(ranked.into_iter().map(|(_, id)| id).collect())
    }

    fn dfs_order(&self) -> Vec<NodeId> {
        self.dfs_from(self.root)
    }

    fn dfs_from(&self, start: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(id.0).and_then(Option::as_ref) {
                order.push(id);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        order
    }
}

/// A rendered identifier as a value of the same type as `current`, if it parses.
fn retyped(current: Option<&Value>, rendered: &str) -> Value {
    let parsed = match current {
        Some(Value::Int(_)) => rendered.parse().ok().map(Value::Int),
        Some(Value::Float(_)) => rendered.parse().ok().map(Value::Float),
        Some(Value::Bool(_)) => rendered.parse().ok().map(Value::Bool),
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::String(rendered.to_string()))
}
