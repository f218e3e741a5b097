//! Value type tags and coercion.
//!
//! Every field declares a [`ValueType`]; the raw value a supplier returns is
//! coerced into that type before it is recorded. Null coerces to the type's
//! zero value so downstream consumers never observe an untyped hole.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Type tag carried by every field and param.
///
/// Wire names follow the external configuration format (`"int64"`,
/// `"[]string"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "int64")]
    Int,
    #[serde(rename = "uint64")]
    Uint,
    #[serde(rename = "float64")]
    Float,
    #[serde(rename = "map")]
    Map,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "[]int64")]
    ArrayInt,
    #[serde(rename = "[]string")]
    ArrayString,
    #[serde(rename = "[]byte")]
    Bytes,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "bool",
            ValueType::Int => "int64",
            ValueType::Uint => "uint64",
            ValueType::Float => "float64",
            ValueType::Map => "map",
            ValueType::String => "string",
            ValueType::ArrayInt => "[]int64",
            ValueType::ArrayString => "[]string",
            ValueType::Bytes => "[]byte",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("convert {value} to {target} error")]
    Mismatch { value: Value, target: ValueType },
    #[error("no field declares code [{0}]")]
    UnknownField(String),
}

/// The zero value of a type, used when a null response is coerced.
pub fn zero_value(target: ValueType) -> Value {
    match target {
        ValueType::Bool => Value::Bool(false),
        ValueType::Int => Value::from(0i64),
        ValueType::Uint => Value::from(0u64),
        ValueType::Float => Value::from(0.0f64),
        ValueType::Map => Value::Object(Map::new()),
        ValueType::String | ValueType::Bytes => Value::String(String::new()),
        ValueType::ArrayInt | ValueType::ArrayString => Value::Array(Vec::new()),
    }
}

/// Coerce `value` into `target`. Null always becomes the zero value.
pub fn convert(value: &Value, target: ValueType) -> Result<Value, ConvertError> {
    if value.is_null() {
        return Ok(zero_value(target));
    }
    let mismatch = || ConvertError::Mismatch {
        value: value.clone(),
        target,
    };
    match target {
        ValueType::String => Ok(Value::String(to_string(value))),
        ValueType::Int => to_i64(value).map(Value::from).ok_or_else(mismatch),
        ValueType::Uint => to_u64(value).map(Value::from).ok_or_else(mismatch),
        ValueType::Float => to_f64(value).map(Value::from).ok_or_else(mismatch),
        ValueType::Bool => to_bool(value).map(Value::Bool).ok_or_else(mismatch),
        ValueType::Map => match value {
            Value::Object(_) => Ok(value.clone()),
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => Ok(parsed),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },
        ValueType::ArrayInt => match value {
            Value::Array(items) => items
                .iter()
                .map(|item| to_i64(item).map(Value::from))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array)
                .ok_or_else(mismatch),
            _ => Err(mismatch()),
        },
        ValueType::ArrayString => match value {
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| Value::String(to_string(item)))
                    .collect(),
            )),
            _ => Err(mismatch()),
        },
        ValueType::Bytes => match value {
            // Bytes travel as an opaque string or a numeric array; both pass
            // through untouched.
            Value::String(_) => Ok(value.clone()),
            Value::Array(items) if items.iter().all(|i| i.is_u64()) => Ok(value.clone()),
            _ => Err(mismatch()),
        },
    }
}

fn to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_converts_to_zero() {
        assert_eq!(convert(&Value::Null, ValueType::Int).unwrap(), json!(0));
        assert_eq!(convert(&Value::Null, ValueType::String).unwrap(), json!(""));
        assert_eq!(convert(&Value::Null, ValueType::Bool).unwrap(), json!(false));
        assert_eq!(
            convert(&Value::Null, ValueType::ArrayString).unwrap(),
            json!([])
        );
        assert_eq!(convert(&Value::Null, ValueType::Map).unwrap(), json!({}));
    }

    #[test]
    fn test_convert_string() {
        assert_eq!(convert(&json!("a"), ValueType::String).unwrap(), json!("a"));
        assert_eq!(convert(&json!(12), ValueType::String).unwrap(), json!("12"));
        assert_eq!(
            convert(&json!(true), ValueType::String).unwrap(),
            json!("true")
        );
    }

    #[test]
    fn test_convert_numbers() {
        assert_eq!(convert(&json!("42"), ValueType::Int).unwrap(), json!(42));
        assert_eq!(convert(&json!(42.0), ValueType::Int).unwrap(), json!(42));
        assert!(convert(&json!(1.5), ValueType::Int).is_err());
        assert_eq!(convert(&json!(7), ValueType::Uint).unwrap(), json!(7u64));
        assert!(convert(&json!(-1), ValueType::Uint).is_err());
        assert_eq!(
            convert(&json!("2.5"), ValueType::Float).unwrap(),
            json!(2.5)
        );
    }

    #[test]
    fn test_convert_bool() {
        assert_eq!(convert(&json!("true"), ValueType::Bool).unwrap(), json!(true));
        assert_eq!(convert(&json!(0), ValueType::Bool).unwrap(), json!(false));
        assert!(convert(&json!("yes"), ValueType::Bool).is_err());
    }

    #[test]
    fn test_convert_arrays() {
        assert_eq!(
            convert(&json!([1, "2", 3.0]), ValueType::ArrayInt).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(
            convert(&json!([1, "b"]), ValueType::ArrayString).unwrap(),
            json!(["1", "b"])
        );
        assert!(convert(&json!("nope"), ValueType::ArrayInt).is_err());
    }

    #[test]
    fn test_convert_map() {
        assert_eq!(
            convert(&json!({"k": 1}), ValueType::Map).unwrap(),
            json!({"k": 1})
        );
        assert_eq!(
            convert(&json!(r#"{"k":1}"#), ValueType::Map).unwrap(),
            json!({"k": 1})
        );
        assert!(convert(&json!([1]), ValueType::Map).is_err());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&ValueType::ArrayInt).unwrap(),
            r#""[]int64""#
        );
        let t: ValueType = serde_json::from_str(r#""string""#).unwrap();
        assert_eq!(t, ValueType::String);
        assert!(serde_json::from_str::<ValueType>(r#""tuple""#).is_err());
        assert_eq!(ValueType::Uint.to_string(), "uint64");
    }
}
