//! Attribute filters and instance selection.

pub mod executor;
pub mod filter;

pub use executor::{count_matching, select_by_attributes, select_in_scope};
pub use filter::{extract_filter_fields, AttributeFilter, Condition, FilterEvaluator, InstanceScope};
