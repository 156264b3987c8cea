//! Object tree: instance arena, placement and tracked collections.

mod collection;
mod instance;
mod journal;
mod object_tree;
mod path;

pub use collection::TrackedCollection;
pub use instance::{Instance, InstanceArena, InstanceHandle};
pub use object_tree::{DeleteOutcome, ObjectTree, PlacementOutcome, TreeKey};
pub use path::{Branch, NodeId, Path, PathSegment, Payload};
