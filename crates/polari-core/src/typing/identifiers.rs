//! Identifier tuples.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An ordered `(field, value)` identifier tuple.
///
/// A complete tuple holds every identifier field declared by the class;
/// a partial tuple (used for lookups) holds a subset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifiers(Vec<(String, String)>);

impl Identifiers {
    /// Create an empty identifier tuple.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a single-key identifier tuple.
    pub fn single(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self(vec![(field.into(), value.into())])
    }

    /// Create from pairs, keeping their order.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Add a key, replacing any previous value for the same field.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        let field = field.into();
        let value = value.into();
        match self.0.iter_mut().find(|(f, _)| *f == field) {
            Some(slot) => slot.1 = value,
            None => self.0.push((field, value)),
        }
        self
    }

    /// Get the value of an identifier field.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over `(field, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(f, v)| (f.as_str(), v.as_str()))
    }

    /// Number of keys present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if no key is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check whether every key in `partial` is present here with the same value.
    pub fn matches(&self, partial: &Identifiers) -> bool {
        partial.iter().all(|(f, v)| self.get(f) == Some(v))
    }
}

impl fmt::Display for Identifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [(_, value)] = self.0.as_slice() {
            return write!(f, "{}", value);
        }
        let rendered: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", rendered.join(","))
    }
}
