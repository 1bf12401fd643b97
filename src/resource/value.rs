//! Resource values and method dispatch

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::{AtelierError, Result};

/// A value held in a process that exposes named methods.
///
/// Objects only cross the process boundary through [`ResourceObject::to_json`];
/// everything else about them stays local.
pub trait ResourceObject: Send + Sync {
    fn class_name(&self) -> &str;

    fn invoke(&self, method: &str, params: &[Value]) -> Result<ResourceValue>;

    /// JSON view, when the object can be shipped to another process
    fn to_json(&self) -> Option<Value> {
        None
    }
}

#[derive(Clone)]
pub enum ResourceValue {
    Json(Value),
    Object(Arc<dyn ResourceObject>),
}

impl ResourceValue {
    pub fn is_serializable(&self) -> bool {
        match self {
            ResourceValue::Json(_) => true,
            ResourceValue::Object(obj) => obj.to_json().is_some(),
        }
    }

    pub fn as_json(&self) -> Option<Value> {
        match self {
            ResourceValue::Json(v) => Some(v.clone()),
            ResourceValue::Object(obj) => obj.to_json(),
        }
    }

    /// UTF-8 JSON, or `None` for values that cannot leave the process
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        self.as_json().and_then(|v| serde_json::to_vec(&v).ok())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(ResourceValue::Json(serde_json::from_slice(bytes)?))
    }

    pub fn class_name(&self) -> String {
        match self {
            ResourceValue::Json(v) => json_type(v).to_string(),
            ResourceValue::Object(obj) => obj.class_name().to_string(),
        }
    }

    /// Call `method` on this value. JSON values understand `toString`,
    /// `length`, `get`, `keys` and `contains`; objects dispatch themselves.
    pub fn invoke(&self, method: &str, params: &[Value]) -> Result<ResourceValue> {
        match self {
            ResourceValue::Object(obj) => obj.invoke(method, params),
            ResourceValue::Json(v) => invoke_json(v, method, params).map(ResourceValue::Json),
        }
    }
}

impl From<Value> for ResourceValue {
    fn from(v: Value) -> Self {
        ResourceValue::Json(v)
    }
}

impl From<&str> for ResourceValue {
    fn from(s: &str) -> Self {
        ResourceValue::Json(Value::String(s.to_string()))
    }
}

impl From<String> for ResourceValue {
    fn from(s: String) -> Self {
        ResourceValue::Json(Value::String(s))
    }
}

impl fmt::Debug for ResourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceValue::Json(v) => write!(f, "Json({})", v),
            ResourceValue::Object(obj) => write!(f, "Object({})", obj.class_name()),
        }
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn invoke_json(v: &Value, method: &str, params: &[Value]) -> Result<Value> {
    let unsupported = || {
        AtelierError::Resource(format!(
            "method {} not supported on {}",
            method,
            json_type(v)
        ))
    };

    match method {
        "toString" => Ok(Value::String(match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        "length" => match v {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::Object(o) => Ok(Value::from(o.len())),
            _ => Err(unsupported()),
        },
        "keys" => match v {
            Value::Object(o) => Ok(Value::Array(
                o.keys().map(|k| Value::String(k.clone())).collect(),
            )),
            _ => Err(unsupported()),
        },
        "get" => {
            let key = params
                .first()
                .ok_or_else(|| AtelierError::Resource("get needs a key or index".to_string()))?;
            match (v, key) {
                (Value::Object(o), Value::String(k)) => {
                    Ok(o.get(k).cloned().unwrap_or(Value::Null))
                }
                (Value::Array(a), Value::Number(n)) => Ok(n
                    .as_u64()
                    .and_then(|i| a.get(i as usize))
                    .cloned()
                    .unwrap_or(Value::Null)),
                _ => Err(unsupported()),
            }
        }
        "contains" => {
            let needle = params
                .first()
                .ok_or_else(|| AtelierError::Resource("contains needs a value".to_string()))?;
            match (v, needle) {
                (Value::Array(a), needle) => Ok(Value::Bool(a.contains(needle))),
                (Value::String(s), Value::String(n)) => Ok(Value::Bool(s.contains(n.as_str()))),
                (Value::Object(o), Value::String(k)) => Ok(Value::Bool(o.contains_key(k))),
                _ => Err(unsupported()),
            }
        }
        _ => Err(unsupported()),
    }
}
