//! Field discovery for loosely shaped JSON records
//!
//! Every logical attribute has an ordered list of candidate keys. Lookups walk
//! the list and take the first key holding a non-empty value.

use crate::error::IngestError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Ordered candidate keys for one logical attribute
#[derive(Debug, Clone, Copy)]
pub struct FieldCandidates {
    pub attribute: &'static str,
    pub keys: &'static [&'static str],
}

impl FieldCandidates {
    pub const fn new(attribute: &'static str, keys: &'static [&'static str]) -> Self {
        Self { attribute, keys }
    }

    /// First candidate holding a non-empty value
    pub fn resolve<'a>(&self, object: &'a Map<String, Value>) -> Option<&'a Value> {
        self.keys
            .iter()
            .filter_map(|key| object.get(*key))
            .find(|value| !is_empty(value))
    }

    /// Resolve and render as a string
    pub fn resolve_string(&self, object: &Map<String, Value>) -> Option<String> {
        self.resolve(object).map(value_to_string)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(&key)
    }
}

/// Result of parsing one record within a batch
///
/// A skipped record carries the reason so the batch loop can log it and move on.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome<T> {
    Parsed(T),
    Skipped(String),
}

impl<T> RecordOutcome<T> {
    pub fn skipped(reason: impl Into<String>) -> Self {
        RecordOutcome::Skipped(reason.into())
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            RecordOutcome::Parsed(value) => Some(value),
            RecordOutcome::Skipped(_) => None,
        }
    }
}

/// Borrow a blob as text; invalid UTF-8 is a whole-blob parse failure
pub fn decode_utf8<'a>(content: &'a [u8], source: &str) -> Result<&'a str, IngestError> {
    std::str::from_utf8(content).map_err(|e| {
        IngestError::Parsing(format!("Content of {} is not valid UTF-8: {}", source, e))
    })
}

/// Null, empty strings and empty containers count as absent
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Short name of a JSON value's type, for skip reasons
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Render a JSON value as plain text: strings unquoted, null empty, the rest compact JSON
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Numeric value from a JSON number or numeric string
pub fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Flatten a JSON object into string tags; anything else yields no tags
pub fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect(),
        _ => BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_utf8() {
        assert_eq!(decode_utf8("pool_size: 5".as_bytes(), "app.yaml").unwrap(), "pool_size: 5");

        let err = decode_utf8(&[b'{', 0xFF, b'}'], "metrics.json").unwrap_err();
        assert!(err.is_parsing());
        assert!(err.to_string().contains("metrics.json"));
    }

    const SERVICE: FieldCandidates =
        FieldCandidates::new("service", &["service", "service_name", "app"]);

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_resolve_takes_first_non_empty() {
        let obj = object(json!({"service": "", "service_name": null, "app": "billing"}));
        assert_eq!(SERVICE.resolve_string(&obj), Some("billing".to_string()));
    }

    #[test]
    fn test_resolve_respects_order() {
        let obj = object(json!({"app": "second", "service": "first"}));
        assert_eq!(SERVICE.resolve_string(&obj), Some("first".to_string()));
    }

    #[test]
    fn test_resolve_missing() {
        let obj = object(json!({"other": "x"}));
        assert_eq!(SERVICE.resolve(&obj), None);
    }

    #[test]
    fn test_value_rendering() {
        assert_eq!(value_to_string(&json!("text")), "text");
        assert_eq!(value_to_string(&json!(42)), "42");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert_eq!(value_to_string(&json!(null)), "");
        assert_eq!(value_to_string(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_value_to_f64() {
        assert_eq!(value_to_f64(&json!(1.5)), Some(1.5));
        assert_eq!(value_to_f64(&json!(" 2.25 ")), Some(2.25));
        assert_eq!(value_to_f64(&json!("abc")), None);
        assert_eq!(value_to_f64(&json!({})), None);
    }

    #[test]
    fn test_string_map() {
        let tags = string_map(Some(&json!({"host": "a", "port": 8080})));
        assert_eq!(tags.get("host").map(String::as_str), Some("a"));
        assert_eq!(tags.get("port").map(String::as_str), Some("8080"));
        assert!(string_map(Some(&json!("not a map"))).is_empty());
    }
}
