//! Typed immutable values and comparison primitives
//!
//! Values are what claims assert. Constraints compare them and drift measures
//! how far they moved from a baseline, so the comparison helpers here are the
//! single source of truth for "equal", "greater" and "how many".

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Default tolerance used when comparing numbers for equality
pub const DEFAULT_EPSILON: f64 = 1e-9;

/// A claim value
///
/// Serialized untagged so that wire JSON stays natural (`"luxury"`, `14`,
/// `{"tier": "gold"}`). Enumeration-kind lenses hold [`Value::Text`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// Absent / empty value (a claim may exist with an empty value)
    #[default]
    Null,
    /// Boolean
    Boolean(bool),
    /// Number (all numerics are f64)
    Number(f64),
    /// Text or enumeration variant
    Text(String),
    /// Ordered list
    List(Vec<Value>),
    /// Keyed structure
    Structured(BTreeMap<String, Value>),
}

/// Declared kind of a lens's values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Free text
    Text,
    /// Numeric
    Number,
    /// Boolean
    Boolean,
    /// One of a declared set of text variants
    Enumeration,
    /// Keyed structure
    Structured,
    /// Ordered list
    List,
}

impl ValueKind {
    /// Get the kind name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Text => "text",
            ValueKind::Number => "number",
            ValueKind::Boolean => "boolean",
            ValueKind::Enumeration => "enumeration",
            ValueKind::Structured => "structured",
            ValueKind::List => "list",
        }
    }

    /// Whether a value is acceptable for this kind
    ///
    /// `Null` is accepted by every kind: a claim may exist with an empty value.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ValueKind::Text, Value::Text(_))
                | (ValueKind::Enumeration, Value::Text(_))
                | (ValueKind::Number, Value::Number(_))
                | (ValueKind::Boolean, Value::Boolean(_))
                | (ValueKind::Structured, Value::Structured(_))
                | (ValueKind::List, Value::List(_))
        )
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    /// Short name of the value's shape, used in evidence
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::List(_) => "list",
            Value::Structured(_) => "structured",
        }
    }

    /// Numeric view
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Text view
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean view
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Structured view
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Structured(m) => Some(m),
            _ => None,
        }
    }

    /// Null, empty text, empty list and empty structure are all "empty"
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Structured(m) => m.is_empty(),
            Value::Boolean(_) | Value::Number(_) => false,
        }
    }

    /// Cardinality used by `count_gte` / `count_lte`
    pub fn cardinality(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::List(l) => l.len(),
            Value::Structured(m) => m.len(),
            Value::Text(s) => s.chars().count(),
            Value::Boolean(_) | Value::Number(_) => 1,
        }
    }

    /// Look up a dotted path inside a structured value
    ///
    /// An empty path returns the value itself.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |current, key| match current {
            Value::Structured(m) => m.get(key),
            Value::List(l) => key.parse::<usize>().ok().and_then(|i| l.get(i)),
            _ => None,
        })
    }

    /// Equality with a numeric tolerance, applied recursively
    pub fn loosely_eq(&self, other: &Value, epsilon: f64) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => (a - b).abs() <= epsilon,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loosely_eq(y, epsilon))
            }
            (Value::Structured(a), Value::Structured(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.loosely_eq(w, epsilon)))
            }
            _ => self == other,
        }
    }

    /// Ordering where one is defined: numbers numerically, text lexically,
    /// booleans false < true. Mixed shapes are unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Whether this value is a member of `set` (loose equality)
    pub fn is_in(&self, set: &[Value], epsilon: f64) -> bool {
        set.iter().any(|candidate| self.loosely_eq(candidate, epsilon))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::List(l) => {
                f.write_str("[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("]")
            }
            Value::Structured(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Value::Structured(m)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}
