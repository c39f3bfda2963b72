//! Tagged-variant value type carried in a [`LogRecord`](crate::record::LogRecord)'s
//! fields and context. Modeled as a duck-typed-fields replacement per
//! `spec.md` §9: "Model as a tagged-variant value type: primitive |
//! sequence | mapping | null."
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A field value. `Shared` lets the same subtree be aliased from two places
/// in a record without cloning it, which is how this crate models the
/// "circular references permitted at input" input shape: two `Shared` arms
/// pointing at each other form a cycle the [`Serializer`](crate::serializer)
/// must detect rather than recurse into forever.
#[derive(Clone, Debug)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<FieldValue>),
    Map(IndexMap<String, FieldValue>),
    Shared(Arc<FieldValue>),
}

impl FieldValue {
    pub fn str(s: impl Into<String>) -> Self {
        FieldValue::Str(s.into())
    }

    pub fn map() -> IndexMap<String, FieldValue> {
        IndexMap::new()
    }

    /// Pointer identity used by the serializer's cycle-detection visited set.
    /// Only meaningful for the `Shared` variant.
    pub fn shared_ptr(&self) -> Option<usize> {
        match self {
            FieldValue::Shared(arc) => Some(Arc::as_ptr(arc) as usize),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(v: Vec<T>) -> Self {
        FieldValue::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Fields and context slots are serialized to plain JSON eventually; this
/// `Serialize` impl is used by the non-cyclic fast path and by tests. The
/// cycle-aware path lives in [`crate::serializer`], which walks `FieldValue`
/// itself rather than going through `serde_json::Value`.
impl Serialize for FieldValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            FieldValue::Null => serializer.serialize_none(),
            FieldValue::Bool(b) => serializer.serialize_bool(*b),
            FieldValue::Int(i) => serializer.serialize_i64(*i),
            FieldValue::Float(f) => serializer.serialize_f64(*f),
            FieldValue::Str(s) => serializer.serialize_str(s),
            FieldValue::Array(items) => items.serialize(serializer),
            FieldValue::Map(map) => map.serialize(serializer),
            FieldValue::Shared(inner) => inner.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(FieldValue::from(value))
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Int(i)
                } else {
                    FieldValue::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => FieldValue::Str(s),
            serde_json::Value::Array(items) => {
                FieldValue::Array(items.into_iter().map(FieldValue::from).collect())
            }
            serde_json::Value::Object(obj) => FieldValue::Map(
                obj.into_iter()
                    .map(|(k, v)| (k, FieldValue::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_aliasing_shares_pointer_identity() {
        let inner = Arc::new(FieldValue::str("shared"));
        let a = FieldValue::Shared(inner.clone());
        let b = FieldValue::Shared(inner);
        assert_eq!(a.shared_ptr(), b.shared_ptr());
    }

    #[test]
    fn from_json_round_trips_primitives() {
        let json = serde_json::json!({"a": 1, "b": "two", "c": [1,2,3], "d": null});
        let fv = FieldValue::from(json);
        match fv {
            FieldValue::Map(m) => {
                assert_eq!(m.len(), 4);
                assert!(matches!(m.get("a"), Some(FieldValue::Int(1))));
                assert!(matches!(m.get("d"), Some(FieldValue::Null)));
            }
            _ => panic!("expected map"),
        }
    }
}
