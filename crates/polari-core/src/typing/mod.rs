//! Per-class typing metadata for tracked instances.
//!
//! The registry stores, for every class: identifier fields, required and
//! default creation parameters, declared fields, reference cardinality, and
//! tree capabilities. It is constructed explicitly and shared by `Arc`.

mod identifiers;
mod object_typing;
mod registry;

pub use identifiers::Identifiers;
pub use object_typing::{ObjectTyping, ReferenceCardinality, ReferenceField, TypeCapabilities};
pub use registry::TypingRegistry;
