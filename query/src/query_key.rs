use std::fmt::Write;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::QueryError;

/// Structured identity of a query or mutation.
///
/// An ordered sequence of JSON values. Two keys address the same entry iff their
/// [canonical hash](hash_key) is equal, so object field order never matters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    /// Builds a key from any serializable value.
    ///
    /// Arrays become the key's parts, any other value becomes a single-part key.
    /// Fails with [`QueryError::InvalidKey`] when the value is not representable as JSON.
    pub fn new(parts: impl Serialize) -> Result<Self, QueryError> {
        let value =
            serde_json::to_value(parts).map_err(|e| QueryError::InvalidKey(e.into()))?;
        Ok(match value {
            Value::Array(parts) => QueryKey(parts),
            other => QueryKey(vec![other]),
        })
    }

    /// The parts of this key.
    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    /// Canonical hash of this key.
    pub fn hash(&self) -> String {
        hash_key(self)
    }

    /// Whether `prefix` partially matches this key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        partial_match_key(self, prefix)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        QueryKey(parts)
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        QueryKey(vec![Value::String(part.to_string())])
    }
}

impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(parts) => QueryKey(parts),
            other => QueryKey(vec![other]),
        }
    }
}

/// Stable stringification of a key: object fields sorted, array order preserved.
pub fn hash_key(key: &QueryKey) -> String {
    let mut out = String::new();
    out.push('[');
    for (i, part) in key.0.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(&mut out, part);
    }
    out.push(']');
    out
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (i, (name, value)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_scalar(out, &Value::String(name.clone()));
                out.push(':');
                write_canonical(out, value);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => write_scalar(out, scalar),
    }
}

fn write_scalar(out: &mut String, value: &Value) {
    // Scalars always serialize.
    let _ = write!(out, "{}", value);
}

/// Whether `partial` is a prefix of `full`, compared recursively:
/// objects match when every field of the partial side matches,
/// arrays match element-wise over the partial side's length.
pub fn partial_match_key(full: &QueryKey, partial: &QueryKey) -> bool {
    partial.0.len() <= full.0.len()
        && partial
            .0
            .iter()
            .zip(full.0.iter())
            .all(|(b, a)| partial_deep_equal(a, b))
}

fn partial_deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => b
            .iter()
            .all(|(name, b)| a.get(name).map_or(false, |a| partial_deep_equal(a, b))),
        (Value::Array(a), Value::Array(b)) => {
            b.len() <= a.len() && b.iter().zip(a.iter()).all(|(b, a)| partial_deep_equal(a, b))
        }
        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_ignores_object_field_order() {
        let a = QueryKey::new(json!(["todos", { "page": 1, "status": "done" }])).unwrap();
        let b = QueryKey::new(json!(["todos", { "status": "done", "page": 1 }])).unwrap();
        assert_eq!(hash_key(&a), hash_key(&b));
        assert_eq!(hash_key(&a), r#"["todos",{"page":1,"status":"done"}]"#);
    }

    #[test]
    fn hash_preserves_array_order() {
        let a = QueryKey::new(json!(["todos", [1, 2]])).unwrap();
        let b = QueryKey::new(json!(["todos", [2, 1]])).unwrap();
        assert_ne!(hash_key(&a), hash_key(&b));
    }

    #[test]
    fn scalar_becomes_single_part() {
        let key = QueryKey::new("todos").unwrap();
        assert_eq!(key, QueryKey::from("todos"));
        assert_eq!(key.hash(), r#"["todos"]"#);
    }

    #[test]
    fn rejects_unrepresentable_keys() {
        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], 1);
        assert!(matches!(QueryKey::new(map), Err(QueryError::InvalidKey(_))));
    }

    #[test]
    fn prefix_matching() {
        let full = QueryKey::new(json!(["todos", { "page": 1, "status": "done" }, 7])).unwrap();
        assert!(full.starts_with(&QueryKey::from("todos")));
        assert!(full.starts_with(&QueryKey::new(json!(["todos", { "page": 1 }])).unwrap()));
        assert!(!full.starts_with(&QueryKey::new(json!(["todos", { "page": 2 }])).unwrap()));
        assert!(!full.starts_with(&QueryKey::from("posts")));
        assert!(!QueryKey::from("todos").starts_with(&full));
    }
}
