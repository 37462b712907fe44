//! Length-prefixed binary encoding of [Value] trees.
//!
//! Each value starts with a one-byte tag. Scalars are little-endian and
//! fixed-width; strings and binary blobs carry a u32 byte length; arrays and
//! objects carry a u32 element count. The format is self-describing: a buffer
//! can be decoded without an external schema.

use crate::value::{Object, Value};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use std::sync::Arc;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_DATE: u8 = 5;
const TAG_BINARY: u8 = 6;
const TAG_ARRAY: u8 = 7;
const TAG_OBJECT: u8 = 8;

pub fn encode_value(buffer: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buffer.push(TAG_NULL),
        Value::Bool(v) => {
            buffer.push(TAG_BOOL);
            buffer.push(u8::from(*v));
        }
        Value::I64(v) => {
            buffer.push(TAG_I64);
            buffer.extend_from_slice(&v.to_le_bytes());
        }
        Value::F64(v) => {
            buffer.push(TAG_F64);
            buffer.extend_from_slice(&v.to_le_bytes());
        }
        Value::String(v) => {
            buffer.push(TAG_STRING);
            write_len_prefixed(buffer, v.as_bytes());
        }
        Value::Date(v) => {
            buffer.push(TAG_DATE);
            buffer.extend_from_slice(&v.timestamp_millis().to_le_bytes());
        }
        Value::Binary(v) => {
            buffer.push(TAG_BINARY);
            write_len_prefixed(buffer, v);
        }
        Value::Array(values) => {
            buffer.push(TAG_ARRAY);
            buffer.extend_from_slice(&(values.len() as u32).to_le_bytes());
            for v in values {
                encode_value(buffer, v);
            }
        }
        Value::Object(obj) => {
            buffer.push(TAG_OBJECT);
            buffer.extend_from_slice(&(obj.members.len() as u32).to_le_bytes());
            for (name, v) in &obj.members {
                write_len_prefixed(buffer, name.as_bytes());
                encode_value(buffer, v);
            }
        }
    }
}

/// Decodes one value from the front of the window, advancing it.
pub fn decode_value(window: &mut &[u8]) -> Result<Value> {
    let tag = read_u8(window)?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => Ok(Value::Bool(read_u8(window)? != 0)),
        TAG_I64 => Ok(Value::I64(read_i64(window)?)),
        TAG_F64 => Ok(Value::F64(f64::from_le_bytes(read_array::<8>(window)?))),
        TAG_STRING => {
            let bytes = read_len_prefixed(window)?;
            let string =
                String::from_utf8(bytes.to_vec()).with_context(|| "decoding utf8 string")?;
            Ok(Value::String(Arc::new(string)))
        }
        TAG_DATE => {
            let millis = read_i64(window)?;
            let date = DateTime::<Utc>::from_timestamp_millis(millis)
                .with_context(|| format!("decoding date from {millis} ms"))?;
            Ok(Value::Date(date))
        }
        TAG_BINARY => {
            let bytes = read_len_prefixed(window)?;
            Ok(Value::Binary(Arc::new(bytes.to_vec())))
        }
        TAG_ARRAY => {
            let count = read_u32(window)? as usize;
            let mut values = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                values.push(decode_value(window)?);
            }
            Ok(Value::Array(values))
        }
        TAG_OBJECT => {
            let count = read_u32(window)? as usize;
            let mut members = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let name_bytes = read_len_prefixed(window)?;
                let name = String::from_utf8(name_bytes.to_vec())
                    .with_context(|| "decoding member name")?;
                members.push((Arc::new(name), decode_value(window)?));
            }
            Ok(Value::Object(Arc::new(Object { members })))
        }
        unknown => bail!("unknown value tag {unknown}"),
    }
}

/// Encodes a value into a fresh buffer.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buffer = vec![];
    encode_value(&mut buffer, value);
    buffer
}

/// Decodes a single value and rejects trailing garbage.
pub fn decode(buffer: &[u8]) -> Result<Value> {
    let mut window = buffer;
    let value = decode_value(&mut window)?;
    if !window.is_empty() {
        bail!("{} trailing bytes after value", window.len());
    }
    Ok(value)
}

fn write_len_prefixed(buffer: &mut Vec<u8>, bytes: &[u8]) {
    buffer.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buffer.extend_from_slice(bytes);
}

fn read_len_prefixed<'a>(window: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_u32(window)? as usize;
    if window.len() < len {
        bail!("buffer too small for {len} prefixed bytes");
    }
    let (bytes, rest) = window.split_at(len);
    *window = rest;
    Ok(bytes)
}

fn read_u8(window: &mut &[u8]) -> Result<u8> {
    let Some((first, rest)) = window.split_first() else {
        bail!("buffer too small reading u8");
    };
    *window = rest;
    Ok(*first)
}

fn read_u32(window: &mut &[u8]) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array::<4>(window)?))
}

fn read_i64(window: &mut &[u8]) -> Result<i64> {
    Ok(i64::from_le_bytes(read_array::<8>(window)?))
}

fn read_array<const N: usize>(window: &mut &[u8]) -> Result<[u8; N]> {
    if window.len() < N {
        bail!("buffer too small reading {N} bytes");
    }
    let (bytes, rest) = window.split_at(N);
    *window = rest;
    Ok(bytes.try_into().expect("split_at returned N bytes"))
}
