use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// An ordered set of named values.
///
/// Member order is preserved: it is the declaration order of the fields when
/// the object was built, which matters for mutation payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    pub members: Vec<(Arc<String>, Value)>,
}

impl Object {
    pub fn new() -> Self {
        Self { members: vec![] }
    }

    pub fn get<T>(&self, member_name: &str) -> Result<T>
    where
        T: VariantValue,
    {
        for m in &self.members {
            if *m.0 == member_name {
                return T::get(&m.1);
            }
        }
        bail!("member {} not found", member_name);
    }

    pub fn get_ref(&self, member_name: &str) -> Option<&Value> {
        self.members
            .iter()
            .find(|m| *m.0 == member_name)
            .map(|m| &m.1)
    }

    /// Overwrites the member if present, appends it otherwise.
    pub fn set(&mut self, member_name: &str, value: Value) {
        for m in &mut self.members {
            if *m.0 == member_name {
                m.1 = value;
                return;
            }
        }
        self.members
            .push((Arc::new(member_name.to_owned()), value));
    }

    pub fn remove(&mut self, member_name: &str) -> Option<Value> {
        let index = self.members.iter().position(|m| *m.0 == member_name)?;
        Some(self.members.remove(index).1)
    }

    pub fn contains(&self, member_name: &str) -> bool {
        self.members.iter().any(|m| *m.0 == member_name)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Typed access into a [Value].
pub trait VariantValue {
    fn get(value: &Value) -> Result<Self>
    where
        Self: Sized;
}

impl VariantValue for bool {
    fn get(value: &Value) -> Result<Self> {
        if let Value::Bool(val) = value {
            Ok(*val)
        } else {
            bail!("bad type cast bool for value {:?}", value);
        }
    }
}

impl VariantValue for i64 {
    fn get(value: &Value) -> Result<Self> {
        if let Value::I64(val) = value {
            Ok(*val)
        } else {
            bail!("bad type cast i64 for value {:?}", value);
        }
    }
}

impl VariantValue for f64 {
    fn get(value: &Value) -> Result<Self> {
        match value {
            Value::F64(val) => Ok(*val),
            Value::I64(val) => Ok(*val as Self),
            _ => {
                bail!("bad type cast f64 for value {:?}", value)
            }
        }
    }
}

impl VariantValue for Arc<String> {
    fn get(value: &Value) -> Result<Self> {
        if let Value::String(val) = value {
            Ok(val.clone())
        } else {
            bail!("bad type cast String for value {:?}", value);
        }
    }
}

impl VariantValue for DateTime<Utc> {
    fn get(value: &Value) -> Result<Self> {
        if let Value::Date(val) = value {
            Ok(*val)
        } else {
            bail!("bad type cast Date for value {:?}", value);
        }
    }
}

impl VariantValue for Arc<Object> {
    fn get(value: &Value) -> Result<Self> {
        if let Value::Object(val) = value {
            Ok(val.clone())
        } else {
            bail!("bad type cast Object for value {:?}", value);
        }
    }
}

/// A dynamically typed value: the in-memory form of entity attributes and
/// event payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(Arc<String>),
    Date(DateTime<Utc>),
    Binary(Arc<Vec<u8>>),
    Array(Vec<Value>),
    Object(Arc<Object>),
}

impl Value {
    pub fn from_str(s: &str) -> Self {
        Value::String(Arc::new(s.to_owned()))
    }

    pub fn as_str(&self) -> Option<&str> {
        if let Value::String(s) = &self {
            Some(s.as_str())
        } else {
            None
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        if let Value::Object(obj) = &self {
            Some(obj)
        } else {
            None
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<Object> for Value {
    fn from(obj: Object) -> Self {
        Value::Object(Arc::new(obj))
    }
}
