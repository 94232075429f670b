//! Conversion between `Value` and native host values (`serde_json::Value`).
//!
//! JSON has no sharing, so `from_json` builds a fresh tree. `to_json` is
//! lossy where JSON lacks a representation: `Undefined` maps to null,
//! date/times render as RFC 3339 strings, decimals go through f64, and
//! non-finite doubles map to null.

use crate::error::ValueError;
use crate::object::Obj;
use crate::value::{DateTime, Number, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Converts a JSON value into a runtime value. Integers that fit in 32
/// bits become `Int32`, other integers `Int64`, everything else `Double`.
pub fn from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    Value::Number(Number::Int32(small))
                } else {
                    Value::Number(Number::Int64(i))
                }
            } else {
                Value::Number(Number::Double(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        serde_json::Value::String(s) => Value::String(Arc::from(s.as_str())),
        serde_json::Value::Array(items) => {
            let obj = Obj::new();
            for item in items {
                // A fresh writable object never rejects push.
                let _ = obj.push(from_json(item));
            }
            Value::Object(obj)
        }
        serde_json::Value::Object(map) => {
            let obj = Obj::new();
            for (key, value) in map {
                let _ = obj.add(key.as_str(), from_json(value));
            }
            Value::Object(obj)
        }
    }
}

/// Converts a runtime value into JSON. Fails with `CyclicValue` when the
/// object graph contains a cycle.
pub fn to_json(value: &Value) -> Result<serde_json::Value, ValueError> {
    to_json_inner(value, &mut HashSet::new())
}

fn to_json_inner(
    value: &Value,
    visiting: &mut HashSet<usize>,
) -> Result<serde_json::Value, ValueError> {
    Ok(match value.resolve() {
        Value::Undefined | Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(b),
        Value::Number(n) => match n {
            Number::Int32(i) => serde_json::Value::from(i),
            Number::Int64(i) => serde_json::Value::from(i),
            Number::Double(d) => serde_json::Number::from_f64(d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Number::Decimal(_) => serde_json::Number::from_f64(n.to_f64())
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        },
        Value::DateTime(dt) => serde_json::Value::String(match dt {
            DateTime::Naive(d) => d.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            DateTime::Utc(d) => d.to_rfc3339(),
            DateTime::Offset(d) => d.to_rfc3339(),
        }),
        Value::String(s) => serde_json::Value::String(s.to_string()),
        Value::Object(obj) => {
            let identity = obj.identity();
            if !visiting.insert(identity) {
                return Err(ValueError::CyclicValue);
            }
            let entries = obj.entries();
            let json = if entries.iter().all(|e| e.key.is_none()) {
                let mut items = Vec::with_capacity(entries.len());
                for entry in &entries {
                    items.push(to_json_inner(&entry.value, visiting)?);
                }
                serde_json::Value::Array(items)
            } else {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (idx, entry) in entries.iter().enumerate() {
                    let key = entry
                        .key
                        .as_deref()
                        .map(str::to_string)
                        .unwrap_or_else(|| idx.to_string());
                    map.insert(key, to_json_inner(&entry.value, visiting)?);
                }
                serde_json::Value::Object(map)
            };
            visiting.remove(&identity);
            json
        }
        Value::Pending(_) => unreachable!("resolve never returns Pending"),
    })
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_roundtrip_basic() {
        let json = json!({
            "name": "order",
            "count": 3,
            "big": 9_000_000_000i64,
            "ratio": 0.5,
            "flag": true,
            "nothing": null,
            "items": [1, 2, 3]
        });

        let value = from_json(&json);
        let obj = value.as_object().unwrap();
        assert_eq!(obj.get("count"), Value::from(3i32));
        assert_eq!(obj.get("big"), Value::from(9_000_000_000i64));
        assert_eq!(obj.get("items").as_list().unwrap().len(), 3);

        assert_eq!(to_json(&value).unwrap(), json);
    }

    #[test]
    fn undefined_maps_to_null() {
        assert_eq!(to_json(&Value::Undefined).unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn cyclic_object_is_rejected() {
        let a = Obj::new();
        a.add("self", a.clone()).unwrap();
        assert!(matches!(
            to_json(&Value::Object(a)),
            Err(ValueError::CyclicValue)
        ));
    }

    #[test]
    fn shared_but_acyclic_structure_converts() {
        let shared = Obj::new();
        shared.add("x", 1i32).unwrap();
        let root = Obj::new();
        root.add("a", shared.clone()).unwrap();
        root.add("b", shared).unwrap();
        let json = to_json(&Value::Object(root)).unwrap();
        assert_eq!(json["a"]["x"], json["b"]["x"]);
    }
}
