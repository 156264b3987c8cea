//! Paths, branches and tree nodes.

use super::instance::InstanceHandle;
use crate::typing::Identifiers;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a node in the tree's node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

/// One `(class, identifiers)` step of a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSegment {
    /// Class name of the branch.
    pub class_name: String,
    /// Identifiers of the branch.
    pub identifiers: Identifiers,
}

impl PathSegment {
    /// Create a segment.
    pub fn new(class_name: impl Into<String>, identifiers: Identifiers) -> Self {
        Self {
            class_name: class_name.into(),
            identifiers,
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class_name, self.identifiers)
    }
}

/// Ordered list of segments from the tree root to a node.
///
/// A path addresses a placement, not an instance: one instance can have an
/// owning path and several reference paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path(Vec<PathSegment>);

impl Path {
    /// Create a path from segments.
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    /// Segments from the root.
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Depth below the root; the root path has depth 0.
    pub fn depth(&self) -> usize {
        self.0.len().saturating_sub(1)
    }

    /// Last segment.
    pub fn last(&self) -> Option<&PathSegment> {
        self.0.last()
    }

    /// Path of the parent node.
    pub fn parent(&self) -> Option<Path> {
        if self.0.len() <= 1 {
            return None;
        }
        Some(Path(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Extend with one more segment.
    pub fn child(&self, segment: PathSegment) -> Path {
        let mut segments = self.0.clone();
        segments.push(segment);
        Path(segments)
    }

    /// Check whether `self` is `other` or lies below it.
    pub fn starts_with(&self, other: &Path) -> bool {
        self.0.starts_with(&other.0)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

/// What a tree node holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// The node owns the instance.
    Instance(InstanceHandle),
    /// The node points at the instance's owning path without owning it.
    Reference(InstanceHandle),
}

impl Payload {
    /// Handle of the instance this payload concerns.
    pub fn handle(&self) -> InstanceHandle {
        match self {
            Payload::Instance(h) | Payload::Reference(h) => *h,
        }
    }

    /// Check if this is an owning payload.
    pub fn is_owner(&self) -> bool {
        matches!(self, Payload::Instance(_))
    }
}

/// A `(class, identifiers, payload)` tuple placed in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Class name.
    pub class_name: String,
    /// Identifier tuple.
    pub identifiers: Identifiers,
    /// Owned instance or back-reference.
    pub payload: Payload,
    /// Field on the parent instance this branch was placed through.
    pub via_field: Option<String>,
}

impl Branch {
    /// Create an owning branch.
    pub fn owned(class_name: impl Into<String>, identifiers: Identifiers, handle: InstanceHandle) -> Self {
        Self {
            class_name: class_name.into(),
            identifiers,
            payload: Payload::Instance(handle),
            via_field: None,
        }
    }

    /// Create a back-reference branch.
    pub fn reference(
        class_name: impl Into<String>,
        identifiers: Identifiers,
        handle: InstanceHandle,
    ) -> Self {
        Self {
            class_name: class_name.into(),
            identifiers,
            payload: Payload::Reference(handle),
            via_field: None,
        }
    }

    /// Record the parent field this branch hangs off.
    pub fn via(mut self, field: impl Into<String>) -> Self {
        self.via_field = Some(field.into());
        self
    }

    /// Path segment for this branch.
    pub fn segment(&self) -> PathSegment {
        PathSegment::new(self.class_name.clone(), self.identifiers.clone())
    }
}

/// A node in the tree's node arena.
#[derive(Debug, Clone)]
pub(crate) struct TreeNode {
    pub(crate) branch: Branch,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
}
