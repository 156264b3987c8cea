//! Runtime values stored on instances and used in filters.

use crate::tree::InstanceHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A field value on an instance.
///
/// Everything except [`Value::Ref`] is a plain value type. The set of
/// variants is closed: a value that contains no `Ref` anywhere is primitive
/// and never interacts with the object tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered list of values.
    List(Vec<Value>),
    /// String-keyed map of values.
    Map(BTreeMap<String, Value>),
    /// Reference to a tracked instance.
    Ref(InstanceHandle),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this value contains no instance reference at any depth.
    pub fn is_primitive(&self) -> bool {
        match self {
            Value::Ref(_) => false,
            Value::List(items) => items.iter().all(Value::is_primitive),
            Value::Map(entries) => entries.values().all(Value::is_primitive),
            _ => true,
        }
    }

    /// Try to get as an instance handle.
    pub fn as_ref_handle(&self) -> Option<InstanceHandle> {
        match self {
            Value::Ref(handle) => Some(*handle),
            _ => None,
        }
    }

    /// Try to get as string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as a list.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Render a scalar as an identifier key.
    ///
    /// Returns `None` for null, containers and references, which can never
    /// serve as identifier values.
    pub fn render_key(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Null | Value::List(_) | Value::Map(_) | Value::Ref(_) => None,
        }
    }

    /// Collect every instance handle referenced by this value, in order.
    pub fn referenced_handles(&self) -> Vec<InstanceHandle> {
        let mut out = Vec::new();
        self.collect_handles(&mut out);
        out
    }

    fn collect_handles(&self, out: &mut Vec<InstanceHandle>) {
        match self {
            Value::Ref(handle) => out.push(*handle),
            Value::List(items) => items.iter().for_each(|v| v.collect_handles(out)),
            Value::Map(entries) => entries.values().for_each(|v| v.collect_handles(out)),
            _ => {}
        }
    }

    /// Remove every reference to `handle`, returning whether anything changed.
    pub(crate) fn strip_ref(&mut self, handle: InstanceHandle) -> bool {
        match self {
            Value::Ref(h) if *h == handle => {
                *self = Value::Null;
                true
            }
            Value::List(items) => {
                let before = items.len();
                items.retain(|v| v.as_ref_handle() != Some(handle));
                let mut changed = items.len() != before;
                for item in items.iter_mut() {
                    changed |= item.strip_ref(handle);
                }
                changed
            }
            Value::Map(entries) => {
                let mut changed = false;
                for item in entries.values_mut() {
                    changed |= item.strip_ref(handle);
                }
                changed
            }
            _ => false,
        }
    }

    /// Replace every reference to `from` with a reference to `to`.
    pub(crate) fn replace_ref(&mut self, from: InstanceHandle, to: InstanceHandle) {
        match self {
            Value::Ref(h) if *h == from => *h = to,
            Value::List(items) => items.iter_mut().for_each(|v| v.replace_ref(from, to)),
            Value::Map(entries) => entries.values_mut().for_each(|v| v.replace_ref(from, to)),
            _ => {}
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<InstanceHandle> for Value {
    fn from(handle: InstanceHandle) -> Self {
        Value::Ref(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_classification() {
        assert!(Value::Null.is_primitive());
        assert!(Value::from("a").is_primitive());
        assert!(Value::List(vec![Value::Int(1), Value::Bool(true)]).is_primitive());
        assert!(!Value::Ref(InstanceHandle::new(3)).is_primitive());
        assert!(!Value::List(vec![Value::Int(1), Value::Ref(InstanceHandle::new(0))]).is_primitive());

        let mut nested = BTreeMap::new();
        nested.insert("x".to_string(), Value::List(vec![Value::Ref(InstanceHandle::new(1))]));
        assert!(!Value::Map(nested).is_primitive());
    }

    #[test]
    fn test_render_key() {
        assert_eq!(Value::from("A1").render_key(), Some("A1".to_string()));
        assert_eq!(Value::Int(7).render_key(), Some("7".to_string()));
        assert_eq!(Value::Null.render_key(), None);
        assert_eq!(Value::List(vec![]).render_key(), None);
    }

    #[test]
    fn test_strip_ref() {
        let a = InstanceHandle::new(1);
        let b = InstanceHandle::new(2);
        let mut v = Value::List(vec![Value::Ref(a), Value::Ref(b), Value::Int(3)]);
        assert!(v.strip_ref(a));
        assert_eq!(v, Value::List(vec![Value::Ref(b), Value::Int(3)]));
        assert!(!v.strip_ref(a));

        let mut scalar = Value::Ref(b);
        assert!(scalar.strip_ref(b));
        assert!(scalar.is_null());
    }

    #[test]
    fn test_from_json() {
        let json = serde_json::json!({"id": "A1", "qty": 2, "tags": ["x", "y"], "ok": true});
        match Value::from(json) {
            Value::Map(m) => {
                assert_eq!(m.get("id"), Some(&Value::from("A1")));
                assert_eq!(m.get("qty"), Some(&Value::Int(2)));
                assert_eq!(m.get("ok"), Some(&Value::Bool(true)));
            }
            other => panic!("expected map, got {:?}", other),
        }
    }
}
