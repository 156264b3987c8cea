//! Core error types.

use thiserror::Error;

/// Flat error discriminant for the transport layer.
///
/// Mapping a kind onto a user-facing status code is the caller's job; the
/// core only reports which class of failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input or a violated schema rule.
    Validation,
    /// The principal has no grant for the operation.
    AccessDenied,
    /// A singular operation matched no instance.
    NotFound,
    /// A singular operation matched more than one instance.
    AmbiguousTarget,
    /// A branch already exists at the requested placement.
    DuplicatePlacement,
    /// A partial identifier set matched several canonical nodes.
    AmbiguousPlacement,
    /// An instance is missing one or more identifier fields.
    IdentifierIncomplete,
    /// Referenced class, instance, or path does not exist.
    Unknown,
    /// JSON encoding or decoding failed.
    Serialization,
}

/// Core object store errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Validation failed for the named segment.
    #[error("validation error at '{segment}': {reason}")]
    Validation {
        /// Offending segment (class, field, dict key, parameter...).
        segment: String,
        /// Human readable reason.
        reason: String,
    },

    /// The principal is not allowed to run the operation on the class.
    #[error("access denied: operation '{op}' on '{class_name}'")]
    AccessDenied {
        /// Target class.
        class_name: String,
        /// Operation letter (C, R, U, D or E).
        op: String,
    },

    /// No instance matched a singular target filter.
    #[error("no '{class_name}' instance matches {filter}")]
    NotFound {
        /// Target class.
        class_name: String,
        /// Rendered filter.
        filter: String,
    },

    /// More than one instance matched a singular target filter.
    #[error("target filter on '{class_name}' is ambiguous: {matches:?}")]
    AmbiguousTarget {
        /// Target class.
        class_name: String,
        /// Identifiers of every matching instance.
        matches: Vec<String>,
    },

    /// A branch already occupies the requested placement.
    #[error("duplicate placement of {class_name}:{identifiers} at {path}")]
    DuplicatePlacement {
        /// Class of the branch.
        class_name: String,
        /// Identifiers of the branch.
        identifiers: String,
        /// Rendered path of the existing placement.
        path: String,
    },

    /// A partial identifier set matched more than one canonical node.
    #[error("ambiguous identifier {class_name}:{identifiers} matches {matches:?}")]
    AmbiguousPlacement {
        /// Class searched for.
        class_name: String,
        /// Partial identifiers that were given.
        identifiers: String,
        /// Rendered paths of the competing nodes.
        matches: Vec<String>,
    },

    /// Identifier fields are missing or null.
    #[error("identifier incomplete for '{class_name}': missing {missing:?}")]
    IdentifierIncomplete {
        /// Class of the instance.
        class_name: String,
        /// Identifier fields without a usable value.
        missing: Vec<String>,
    },

    /// The class has no registered typing.
    #[error("unknown class '{0}'")]
    UnknownClass(String),

    /// The instance handle does not refer to a live instance.
    #[error("unknown instance handle {0}")]
    UnknownInstance(usize),

    /// The path does not address a node in the tree.
    #[error("invalid path {0}")]
    InvalidPath(String),

    /// JSON encoding/decoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build a validation error for a segment.
    pub fn validation(segment: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            segment: segment.into(),
            reason: reason.into(),
        }
    }

    /// Get the flat kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::AccessDenied { .. } => ErrorKind::AccessDenied,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AmbiguousTarget { .. } => ErrorKind::AmbiguousTarget,
            Error::DuplicatePlacement { .. } => ErrorKind::DuplicatePlacement,
            Error::AmbiguousPlacement { .. } => ErrorKind::AmbiguousPlacement,
            Error::IdentifierIncomplete { .. } => ErrorKind::IdentifierIncomplete,
            Error::UnknownClass(_) | Error::UnknownInstance(_) | Error::InvalidPath(_) => {
                ErrorKind::Unknown
            }
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::validation("R.Order.status", "unknown field");
        assert!(err.to_string().contains("R.Order.status"));
        assert!(err.to_string().contains("unknown field"));

        let err = Error::IdentifierIncomplete {
            class_name: "Order".to_string(),
            missing: vec!["orderId".to_string()],
        };
        assert!(err.to_string().contains("Order"));
        assert!(err.to_string().contains("orderId"));
    }

    #[test]
    fn test_error_kind() {
        let err = Error::AccessDenied {
            class_name: "Order".into(),
            op: "R".into(),
        };
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert_eq!(Error::UnknownClass("X".into()).kind(), ErrorKind::Unknown);
        assert_eq!(Error::InvalidPath("/".into()).kind(), ErrorKind::Unknown);
    }
}
