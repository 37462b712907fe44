use chrono::{TimeZone, Utc};
use parquedb_variant::codec::{decode, encode};
use parquedb_variant::{Object, Value};
use std::sync::Arc;

fn sample_object() -> Value {
    let mut nested = Object::new();
    nested.set("depth", Value::I64(2));
    let mut obj = Object::new();
    obj.set("title", Value::from_str("hello"));
    obj.set("views", Value::I64(42));
    obj.set("ratio", Value::F64(0.5));
    obj.set("published", Value::Bool(true));
    obj.set(
        "created",
        Value::Date(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
    );
    obj.set("raw", Value::Binary(Arc::new(vec![0, 1, 2, 255])));
    obj.set(
        "tags",
        Value::Array(vec![Value::from_str("a"), Value::from_str("b")]),
    );
    obj.set("nested", nested.into());
    obj.set("missing", Value::Null);
    obj.into()
}

#[test]
fn test_nested_round_trip() {
    let value = sample_object();
    let buffer = encode(&value);
    let decoded = decode(&buffer).unwrap();
    assert_eq!(value, decoded);
}

#[test]
fn test_member_order_preserved() {
    let value = sample_object();
    let decoded = decode(&encode(&value)).unwrap();
    let obj = decoded.as_object().unwrap();
    let names: Vec<&str> = obj.members.iter().map(|m| m.0.as_str()).collect();
    assert_eq!(names[0], "title");
    assert_eq!(names[1], "views");
    assert_eq!(*names.last().unwrap(), "missing");
}

#[test]
fn test_unknown_tag_rejected() {
    let buffer = vec![200u8];
    assert!(decode(&buffer).is_err());
}

#[test]
fn test_truncated_buffer_rejected() {
    let buffer = encode(&sample_object());
    assert!(decode(&buffer[..buffer.len() - 3]).is_err());
}

#[test]
fn test_trailing_bytes_rejected() {
    let mut buffer = encode(&Value::I64(7));
    buffer.push(0);
    assert!(decode(&buffer).is_err());
}

#[test]
fn test_json_bridge() {
    let json: serde_json::Value = serde_json::from_str(
        r#"{"title":"x","views":3,"ratio":1.5,"tags":["a"],"meta":{"ok":true},"gone":null}"#,
    )
    .unwrap();
    let value = parquedb_variant::json::value_from_json(&json);
    let obj = value.as_object().unwrap();
    assert_eq!(obj.get::<i64>("views").unwrap(), 3);
    assert_eq!(obj.get::<f64>("ratio").unwrap(), 1.5);
    let back = parquedb_variant::json::json_from_value(&value);
    assert_eq!(json, back);
}
