//! Tagged dynamic value carried in message payloads and property maps
//!
//! Conversions out of [`Value`] are explicit and fallible: asking for the wrong variant is a
//! [`HubError::Decode`], never a silent default.

use crate::error::{HubError, HubResult};
use std::collections::BTreeMap;
use std::fmt;

/// String-keyed mapping of values
pub type Mapping = BTreeMap<String, Value>;

/// Dynamic value: null, bool, integer, float, string, sequence or mapping
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Sequence(Vec<Value>),
    Mapping(Mapping),
}

impl Value {
    /// Variant name used in decode errors
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> HubResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch("bool", other)),
        }
    }

    /// Integer view; floats with no fractional part are accepted since JSON does not
    /// distinguish the two
    pub fn as_i64(&self) -> HubResult<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(*f as i64),
            other => Err(mismatch("int", other)),
        }
    }

    pub fn as_f64(&self) -> HubResult<f64> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            other => Err(mismatch("float", other)),
        }
    }

    pub fn as_str(&self) -> HubResult<&str> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(mismatch("string", other)),
        }
    }

    pub fn as_sequence(&self) -> HubResult<&[Value]> {
        match self {
            Value::Sequence(items) => Ok(items),
            other => Err(mismatch("sequence", other)),
        }
    }

    pub fn as_mapping(&self) -> HubResult<&Mapping> {
        match self {
            Value::Mapping(map) => Ok(map),
            other => Err(mismatch("mapping", other)),
        }
    }

    pub fn into_mapping(self) -> HubResult<Mapping> {
        match self {
            Value::Mapping(map) => Ok(map),
            other => Err(mismatch("mapping", &other)),
        }
    }

    /// Decode a sequence whose every element is a string
    pub fn to_string_list(&self) -> HubResult<Vec<String>> {
        self.as_sequence()?
            .iter()
            .enumerate()
            .map(|(i, item)| {
                item.as_str()
                    .map(str::to_string)
                    .map_err(|_| HubError::decode(format!("element {i}: expected string, got {}", item.kind())))
            })
            .collect()
    }

    /// Look up a key of a mapping value
    pub fn get(&self, key: &str) -> HubResult<&Value> {
        self.as_mapping()?
            .get(key)
            .ok_or_else(|| HubError::decode(format!("missing key {key:?}")))
    }

    /// Parse a JSON document into a value
    pub fn from_json_slice(bytes: &[u8]) -> HubResult<Value> {
        let json: serde_json::Value = serde_json::from_slice(bytes)?;
        Ok(Value::from(json))
    }

    /// Serialize to a JSON document; non-finite floats become null
    pub fn to_json_vec(&self) -> HubResult<Vec<u8>> {
        Ok(serde_json::to_vec(&serde_json::Value::from(self.clone()))?)
    }
}

fn mismatch(expected: &str, actual: &Value) -> HubError {
    HubError::decode(format!("expected {expected}, got {}", actual.kind()))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", serde_json::Value::from(self.clone()))
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Sequence(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Mapping(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Sequence(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Mapping(map) => {
                serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Mapping> for Value {
    fn from(map: Mapping) -> Self {
        Value::Mapping(map)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Sequence(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion_preserves_shape() {
        let value = Value::from(json!({
            "partition_ids": ["0", "1"],
            "count": 2,
            "ratio": 0.5,
            "enabled": true,
            "nothing": null
        }));

        assert_eq!(value.get("count").unwrap(), &Value::Int(2));
        assert_eq!(value.get("ratio").unwrap(), &Value::Float(0.5));
        assert!(value.get("enabled").unwrap().as_bool().unwrap());
        assert!(value.get("nothing").unwrap().is_null());
        assert_eq!(
            value.get("partition_ids").unwrap().to_string_list().unwrap(),
            vec!["0".to_string(), "1".to_string()]
        );
    }

    #[test]
    fn test_wrong_variant_is_decode_error() {
        let value = Value::from("text");
        let err = value.as_i64().unwrap_err();
        assert_eq!(err, HubError::decode("expected int, got string"));
        assert!(value.as_mapping().is_err());
    }

    #[test]
    fn test_string_list_rejects_mixed_sequence() {
        let value = Value::from(json!(["0", 1]));
        let err = value.to_string_list().unwrap_err();
        assert!(err.to_string().contains("element 1"));
    }

    #[test]
    fn test_missing_key() {
        let value = Value::Mapping(Mapping::new());
        assert!(value.get("partition_ids").unwrap_err().to_string().contains("partition_ids"));
    }

    #[test]
    fn test_integral_float_reads_as_int() {
        assert_eq!(Value::Float(4.0).as_i64().unwrap(), 4);
        assert!(Value::Float(4.5).as_i64().is_err());
        assert_eq!(Value::Int(3).as_f64().unwrap(), 3.0);
    }

    #[test]
    fn test_non_finite_float_serializes_as_null() {
        let bytes = Value::Float(f64::NAN).to_json_vec().unwrap();
        assert_eq!(bytes, b"null");
    }

    #[test]
    fn test_display_is_json() {
        let mut map = Mapping::new();
        map.insert("temp".to_string(), Value::Int(21));
        assert_eq!(Value::Mapping(map).to_string(), r#"{"temp":21}"#);
    }
}
