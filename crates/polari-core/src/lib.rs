//! Polari Core - in-memory object graph store with CRUDE access control.
//!
//! Instances of registered classes are placed into a dedup'd object tree
//! under a single root manager. Each `(class, identifiers)` pair has exactly
//! one owning branch; every other placement is a back-reference to it.
//! Access to instances is scoped per principal by declarative permission
//! sets, resolved into per-operation access and permission dicts.

pub mod config;
pub mod error;
pub mod query;
pub mod security;
pub mod store;
pub mod tree;
pub mod typing;
pub mod value;

pub use config::{AnonymousAccess, StoreConfig};
pub use error::{Error, ErrorKind, Result};
pub use query::{AttributeFilter, Condition, FilterEvaluator, InstanceScope};
pub use security::{
    AccessQueryDict, AccessResolver, FieldScope, InMemoryDirectory, OpKind, PermissionQueryDict,
    PermissionSet, PermissionStore, Principal, PrincipalDirectory,
};
pub use store::{EventHandler, ObjectStore};
pub use tree::{
    Branch, DeleteOutcome, Instance, InstanceArena, InstanceHandle, NodeId, ObjectTree, Path,
    PathSegment, Payload, PlacementOutcome, TrackedCollection, TreeKey,
};
pub use typing::{
    Identifiers, ObjectTyping, ReferenceCardinality, ReferenceField, TypeCapabilities,
    TypingRegistry,
};
pub use value::Value;
