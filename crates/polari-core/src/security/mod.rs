//! Permission sets and CRUDE access resolution.
//!
//! # Security Model
//!
//! Access is granted declaratively through [`PermissionSet`]s, each naming
//! one class, the operations it grants (on all or on specific fields), an
//! optional instance filter, and the users and groups it is assigned to.
//! The [`AccessResolver`] unions every set that applies to a principal into
//! an [`AccessQueryDict`] (which instances) and a [`PermissionQueryDict`]
//! (which fields), per operation and class.
//!
//! # Example
//!
//! ```ignore
//! use polari_core::security::{AccessResolver, OpKind, PermissionSet, Principal};
//!
//! store.put(
//!     PermissionSet::new("staff-read", "Order")
//!         .assign_group("staff")
//!         .allow(OpKind::Read),
//!     &registry,
//!     &directory,
//! )?;
//!
//! let resolver = AccessResolver::new(&registry, &store);
//! let staff = Principal::new("alice").with_group("staff");
//! let (access, _) = resolver.access_and_permission(Some(&staff));
//! assert!(access.scope(OpKind::Read, "Order").is_some());
//! ```

pub mod permission_set;
pub mod principal;
pub mod query_dict;
pub mod resolver;
pub mod store;

pub use permission_set::PermissionSet;
pub use principal::{InMemoryDirectory, Principal, PrincipalDirectory};
pub use query_dict::{AccessQueryDict, FieldScope, OpKind, PermissionQueryDict};
pub use resolver::AccessResolver;
pub use store::PermissionStore;
