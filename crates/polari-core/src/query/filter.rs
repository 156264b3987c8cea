//! Attribute filters and their evaluation against instance fields.

use crate::error::{Error, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A condition on a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `*`: any value, including a missing field.
    Any,
    /// Field equals the value.
    Equals(Value),
    /// Field is a list holding the value, or a string containing it.
    Contains(Value),
    /// Field equals one of the values.
    In(Vec<Value>),
}

impl Condition {
    /// Condition keyword as used in access dicts.
    pub fn keyword(&self) -> &'static str {
        match self {
            Condition::Any => "*",
            Condition::Equals(_) => "EQUALS",
            Condition::Contains(_) => "CONTAINS",
            Condition::In(_) => "IN",
        }
    }

    /// Encode as access-dict JSON.
    pub fn to_json(&self) -> serde_json::Value {
        let json = |v: &Value| serde_json::to_value(v).unwrap_or(serde_json::Value::Null);
        match self {
            Condition::Any => serde_json::Value::String("*".into()),
            Condition::Equals(v) => serde_json::json!({ "EQUALS": json(v) }),
            Condition::Contains(v) => serde_json::json!({ "CONTAINS": json(v) }),
            Condition::In(vs) => {
                serde_json::json!({ "IN": vs.iter().map(json).collect::<Vec<_>>() })
            }
        }
    }

    /// Parse `"*"` or a single-key `{"EQUALS"|"CONTAINS"|"IN": operand}` object.
    ///
    /// `segment` names the position in the enclosing document for errors.
    pub fn from_json(segment: &str, json: &serde_json::Value) -> Result<Condition> {
        let map = match json {
            serde_json::Value::String(s) if s == "*" => return Ok(Condition::Any),
            serde_json::Value::Object(map) if map.len() == 1 => map,
            _ => {
                return Err(Error::validation(
                    segment,
                    "condition must be \"*\" or a single-key object",
                ))
            }
        };
        let Some((keyword, operand)) = map.iter().next() else {
            return Err(Error::validation(segment, "empty condition"));
        };
        let segment = format!("{}.{}", segment, keyword);
        match (keyword.as_str(), operand) {
            ("EQUALS", v) => Ok(Condition::Equals(Value::from(v.clone()))),
            ("CONTAINS", v) => Ok(Condition::Contains(Value::from(v.clone()))),
            ("IN", serde_json::Value::Array(items)) => Ok(Condition::In(
                items.iter().cloned().map(Value::from).collect(),
            )),
            ("IN", _) => Err(Error::validation(segment, "IN expects a list")),
            _ => Err(Error::validation(
                segment,
                "unknown condition, expected *, EQUALS, CONTAINS or IN",
            )),
        }
    }
}

/// A conjunction of field conditions.
///
/// The empty filter matches every instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub struct AttributeFilter {
    conditions: Vec<(String, Condition)>,
}

impl AttributeFilter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition.
    pub fn with(mut self, field: impl Into<String>, condition: Condition) -> Self {
        self.conditions.push((field.into(), condition));
        self
    }

    /// Add an equality condition.
    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Equals(value.into()))
    }

    /// Conditions in insertion order.
    pub fn conditions(&self) -> &[(String, Condition)] {
        &self.conditions
    }

    /// Check whether the filter constrains nothing.
    pub fn is_unconditional(&self) -> bool {
        self.conditions.iter().all(|(_, c)| *c == Condition::Any)
    }

    /// Conjunction of two filters.
    pub fn and(&self, other: &AttributeFilter) -> AttributeFilter {
        let mut conditions = self.conditions.clone();
        conditions.extend(other.conditions.iter().cloned());
        AttributeFilter { conditions }
    }

    /// Encode as access-dict JSON: `"*"` when unconditional, otherwise a field map.
    ///
    /// Repeated fields cannot be represented in a map; the last condition wins.
    pub fn to_json(&self) -> serde_json::Value {
        if self.is_unconditional() {
            return serde_json::Value::String("*".into());
        }
        let map: serde_json::Map<String, serde_json::Value> = self
            .conditions
            .iter()
            .map(|(f, c)| (f.clone(), c.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Parse `"*"` or `{"field": condition, ...}`.
    pub fn from_json(segment: &str, json: &serde_json::Value) -> Result<AttributeFilter> {
        match json {
            serde_json::Value::String(s) if s == "*" => Ok(AttributeFilter::new()),
            serde_json::Value::Object(map) => {
                let mut filter = AttributeFilter::new();
                for (field, condition) in map {
                    let condition =
                        Condition::from_json(&format!("{}.{}", segment, field), condition)?;
                    filter = filter.with(field.clone(), condition);
                }
                Ok(filter)
            }
            _ => Err(Error::validation(
                segment,
                "filter must be \"*\" or an object of field conditions",
            )),
        }
    }
}

impl TryFrom<serde_json::Value> for AttributeFilter {
    type Error = Error;

    fn try_from(json: serde_json::Value) -> Result<Self> {
        AttributeFilter::from_json("filter", &json)
    }
}

impl From<AttributeFilter> for serde_json::Value {
    fn from(filter: AttributeFilter) -> Self {
        filter.to_json()
    }
}

impl fmt::Display for AttributeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conditions.is_empty() {
            return write!(f, "*");
        }
        let rendered: Vec<String> = self
            .conditions
            .iter()
            .map(|(field, c)| match c {
                Condition::Any => format!("{} *", field),
                Condition::Equals(v) => format!("{} EQUALS {:?}", field, v),
                Condition::Contains(v) => format!("{} CONTAINS {:?}", field, v),
                Condition::In(vs) => format!("{} IN {:?}", field, vs),
            })
            .collect();
        write!(f, "{}", rendered.join(" AND "))
    }
}

/// Which instances of a class a grant covers.
///
/// `AnyOf` is a disjunction of conjunctive filters. Unions only ever widen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstanceScope {
    /// Every instance of the class.
    All,
    /// Instances matching at least one filter.
    AnyOf(Vec<AttributeFilter>),
}

impl InstanceScope {
    /// Scope covering instances that match `filter`.
    pub fn filtered(filter: AttributeFilter) -> Self {
        if filter.is_unconditional() {
            InstanceScope::All
        } else {
            InstanceScope::AnyOf(vec![filter])
        }
    }

    /// Widen this scope with another.
    pub fn union(&mut self, other: InstanceScope) {
        match other {
            InstanceScope::All => *self = InstanceScope::All,
            InstanceScope::AnyOf(theirs) => {
                if let InstanceScope::AnyOf(mine) = self {
                    for filter in theirs {
                        if !mine.contains(&filter) {
                            mine.push(filter);
                        }
                    }
                }
            }
        }
    }

    /// Strict intersection with a requested filter.
    pub fn restrict(&self, requested: &AttributeFilter) -> InstanceScope {
        match self {
            InstanceScope::All => InstanceScope::filtered(requested.clone()),
            InstanceScope::AnyOf(filters) => {
                InstanceScope::AnyOf(filters.iter().map(|f| requested.and(f)).collect())
            }
        }
    }

    /// Check whether an instance with these fields is in scope.
    pub fn matches(&self, fields: &BTreeMap<String, Value>) -> bool {
        match self {
            InstanceScope::All => true,
            InstanceScope::AnyOf(filters) => {
                filters.iter().any(|f| FilterEvaluator::evaluate(f, fields))
            }
        }
    }

    /// Parse `"*"`, a filter object, or a list of filter objects.
    pub fn from_json(segment: &str, json: &serde_json::Value) -> Result<InstanceScope> {
        match json {
            serde_json::Value::Array(items) => {
                let mut scope = InstanceScope::AnyOf(Vec::new());
                for (i, item) in items.iter().enumerate() {
                    let filter = AttributeFilter::from_json(&format!("{}[{}]", segment, i), item)?;
                    scope.union(InstanceScope::filtered(filter));
                }
                Ok(scope)
            }
            other => Ok(InstanceScope::filtered(AttributeFilter::from_json(segment, other)?)),
        }
    }

    /// Encode as access-dict JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            InstanceScope::All => serde_json::Value::String("*".into()),
            InstanceScope::AnyOf(filters) if filters.len() == 1 => filters[0].to_json(),
            InstanceScope::AnyOf(filters) => {
                serde_json::Value::Array(filters.iter().map(AttributeFilter::to_json).collect())
            }
        }
    }
}

/// Extract all field names a filter constrains.
pub fn extract_filter_fields(filter: &AttributeFilter) -> BTreeSet<String> {
    filter.conditions.iter().map(|(f, _)| f.clone()).collect()
}

/// Evaluates attribute filters against instance fields.
pub struct FilterEvaluator;

impl FilterEvaluator {
    /// Evaluate a filter; a missing field evaluates as null.
    pub fn evaluate(filter: &AttributeFilter, fields: &BTreeMap<String, Value>) -> bool {
        filter
            .conditions
            .iter()
            .all(|(field, condition)| Self::evaluate_condition(condition, fields.get(field)))
    }

    /// Evaluate one condition against a field value.
    pub fn evaluate_condition(condition: &Condition, value: Option<&Value>) -> bool {
        let value = value.unwrap_or(&Value::Null);
        match condition {
            Condition::Any => true,
            Condition::Equals(expected) => Self::values_equal(value, expected),
            Condition::In(candidates) => candidates.iter().any(|c| Self::values_equal(value, c)),
            Condition::Contains(needle) => match (value, needle) {
                (Value::List(items), _) => items.iter().any(|i| Self::values_equal(i, needle)),
                (Value::String(haystack), Value::String(n)) => haystack.contains(n.as_str()),
                _ => false,
            },
        }
    }

    /// Compare two values; integers and floats compare numerically.
    pub fn values_equal(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
                (*x as f64) == *y
            }
            _ => a == b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("status".to_string(), Value::from("open"));
        fields.insert("qty".to_string(), Value::Int(3));
        fields.insert(
            "tags".to_string(),
            Value::List(vec![Value::from("red"), Value::from("blue")]),
        );
        fields
    }

    #[test]
    fn test_equals_and_in() {
        let f = fields();
        assert!(FilterEvaluator::evaluate(&AttributeFilter::new().eq("status", "open"), &f));
        assert!(!FilterEvaluator::evaluate(&AttributeFilter::new().eq("status", "closed"), &f));
        assert!(FilterEvaluator::evaluate(
            &AttributeFilter::new().with("qty", Condition::Equals(Value::Float(3.0))),
            &f
        ));

        let in_filter = AttributeFilter::new().with(
            "status",
            Condition::In(vec![Value::from("closed"), Value::from("open")]),
        );
        assert!(FilterEvaluator::evaluate(&in_filter, &f));
    }

    #[test]
    fn test_contains() {
        let f = fields();
        let list = AttributeFilter::new().with("tags", Condition::Contains(Value::from("red")));
        assert!(FilterEvaluator::evaluate(&list, &f));
        let substring = AttributeFilter::new().with("status", Condition::Contains(Value::from("pe")));
        assert!(FilterEvaluator::evaluate(&substring, &f));
        let number = AttributeFilter::new().with("qty", Condition::Contains(Value::Int(3)));
        assert!(!FilterEvaluator::evaluate(&number, &f));
    }

    #[test]
    fn test_conjunction_and_missing_fields() {
        let f = fields();
        let both = AttributeFilter::new().eq("status", "open").eq("qty", 3i64);
        assert!(FilterEvaluator::evaluate(&both, &f));
        assert!(!FilterEvaluator::evaluate(&both.and(&AttributeFilter::new().eq("qty", 4i64)), &f));

        let missing = AttributeFilter::new().with("owner", Condition::Equals(Value::Null));
        assert!(FilterEvaluator::evaluate(&missing, &f));
        assert!(FilterEvaluator::evaluate(&AttributeFilter::new(), &f));
        assert!(FilterEvaluator::evaluate(
            &AttributeFilter::new().with("owner", Condition::Any),
            &f
        ));
    }

    #[test]
    fn test_scope_union_widens() {
        let open = AttributeFilter::new().eq("status", "open");
        let mine = AttributeFilter::new().eq("owner", "u1");

        let mut scope = InstanceScope::filtered(open.clone());
        scope.union(InstanceScope::filtered(mine.clone()));
        scope.union(InstanceScope::filtered(open.clone()));
        assert_eq!(scope, InstanceScope::AnyOf(vec![open.clone(), mine]));

        scope.union(InstanceScope::All);
        assert_eq!(scope, InstanceScope::All);
        assert_eq!(InstanceScope::filtered(AttributeFilter::new()), InstanceScope::All);
    }

    #[test]
    fn test_scope_restrict_is_intersection() {
        let f = fields();
        let scope = InstanceScope::filtered(AttributeFilter::new().eq("status", "open"));

        assert!(scope.restrict(&AttributeFilter::new().eq("qty", 3i64)).matches(&f));
        assert!(!scope.restrict(&AttributeFilter::new().eq("qty", 9i64)).matches(&f));

        let closed_only = InstanceScope::filtered(AttributeFilter::new().eq("status", "closed"));
        assert!(!closed_only.restrict(&AttributeFilter::new()).matches(&f));
        assert!(InstanceScope::All.restrict(&AttributeFilter::new()).matches(&f));
    }

    #[test]
    fn test_parse_conditions() {
        let json = serde_json::json!({
            "status": {"EQUALS": "open"},
            "tags": {"CONTAINS": "red"},
            "qty": {"IN": [1, 2, 3]},
            "note": "*"
        });
        let filter = AttributeFilter::from_json("R.Order", &json).unwrap();
        assert_eq!(filter.conditions().len(), 4);
        assert!(FilterEvaluator::evaluate(&filter, &fields()));

        let err = AttributeFilter::from_json("R.Order", &serde_json::json!({"status": {"LIKE": "o%"}}))
            .unwrap_err();
        assert!(err.to_string().contains("R.Order.status.LIKE"));

        let err = AttributeFilter::from_json("R.Order", &serde_json::json!({"qty": {"IN": 3}}))
            .unwrap_err();
        assert!(err.to_string().contains("IN expects a list"));
    }

    #[test]
    fn test_scope_from_json() {
        assert_eq!(
            InstanceScope::from_json("s", &serde_json::json!("*")).unwrap(),
            InstanceScope::All
        );
        let scope = InstanceScope::from_json(
            "s",
            &serde_json::json!([{"status": {"EQUALS": "open"}}, {"qty": {"EQUALS": 9}}]),
        )
        .unwrap();
        assert!(scope.matches(&fields()));
        assert!(matches!(scope, InstanceScope::AnyOf(ref fs) if fs.len() == 2));
    }

    #[test]
    fn test_filter_serde_uses_dict_shape() {
        let filter: AttributeFilter =
            serde_json::from_value(serde_json::json!({"status": {"EQUALS": "open"}})).unwrap();
        assert_eq!(filter, AttributeFilter::new().eq("status", "open"));
        assert_eq!(
            serde_json::to_value(&filter).unwrap(),
            serde_json::json!({"status": {"EQUALS": "open"}})
        );
    }

    #[test]
    fn test_to_json_and_fields() {
        let filter = AttributeFilter::new().eq("status", "open");
        assert_eq!(filter.to_json(), serde_json::json!({"status": {"EQUALS": "open"}}));
        assert_eq!(AttributeFilter::new().to_json(), serde_json::json!("*"));
        assert_eq!(
            extract_filter_fields(&filter.and(&AttributeFilter::new().eq("qty", 1i64))),
            ["qty".to_string(), "status".to_string()].into()
        );
    }
}
