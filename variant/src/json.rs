//! Bridging between [Value] trees and `serde_json` values at the HTTP
//! boundary.

use crate::value::{Object, Value};
use base64::Engine;
use std::sync::Arc;

/// Converts a JSON value into a variant tree.
///
/// Integral numbers become `I64`, everything else numeric becomes `F64`.
/// JSON carries no date or binary kinds, so those only appear on the way out.
pub fn value_from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(v) => Value::Bool(*v),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::I64(i)
            } else {
                Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::String(Arc::new(s.clone())),
        serde_json::Value::Array(values) => {
            Value::Array(values.iter().map(value_from_json).collect())
        }
        serde_json::Value::Object(map) => {
            let members = map
                .iter()
                .map(|(k, v)| (Arc::new(k.clone()), value_from_json(v)))
                .collect();
            Value::Object(Arc::new(Object { members }))
        }
    }
}

/// Converts a variant tree into a JSON value.
///
/// Dates render as RFC 3339 strings, binary blobs as base64.
pub fn json_from_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(v) => serde_json::Value::Bool(*v),
        Value::I64(v) => serde_json::Value::from(*v),
        Value::F64(v) => serde_json::Value::from(*v),
        Value::String(v) => serde_json::Value::String((**v).clone()),
        Value::Date(v) => serde_json::Value::String(v.to_rfc3339()),
        Value::Binary(v) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(&**v))
        }
        Value::Array(values) => {
            serde_json::Value::Array(values.iter().map(json_from_value).collect())
        }
        Value::Object(obj) => {
            let mut map = serde_json::Map::new();
            for (name, v) in &obj.members {
                map.insert((**name).clone(), json_from_value(v));
            }
            serde_json::Value::Object(map)
        }
    }
}
