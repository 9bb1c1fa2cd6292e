//! Output schema validation
//!
//! A pragmatic JSON-Schema subset for step outputs: type checks, object
//! required/properties/additionalProperties, array items/minItems/maxItems,
//! string bounds/pattern/enum, numeric bounds. Validation enumerates every
//! violation rather than stopping at the first, and unwraps a single-key
//! `{data|content|text|response}` envelope before checking so handlers can
//! return wrapped payloads.

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use trellis_core::value::unwrap_payload_envelope;

/// One schema violation. `path` is dotted with bracketed array indices.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub path: String,
    pub message: String,
    pub value: Value,
    pub schema: Value,
}

impl Violation {
    fn new(path: &str, message: impl Into<String>, value: &Value, schema: &Value) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
            value: value.clone(),
            schema: schema.clone(),
        }
    }
}

/// Validate a value against a schema. `Ok` returns the (unwrapped) value
/// that was validated; `Err` carries every violation found.
pub fn validate<'a>(value: &'a Value, schema: &Value) -> Result<&'a Value, Vec<Violation>> {
    let unwrapped = unwrap_payload_envelope(value);
    let mut violations = Vec::new();
    check(unwrapped, schema, "", &mut violations);
    if violations.is_empty() {
        Ok(unwrapped)
    } else {
        Err(violations)
    }
}

/// Serialize violations into the error-envelope details shape.
pub fn violations_to_details(violations: &[Violation]) -> Value {
    json!({ "violations": violations })
}

fn check(value: &Value, schema: &Value, path: &str, out: &mut Vec<Violation>) {
    let schema_obj = match schema {
        Value::Object(map) => map,
        // `true` permits anything, `false` permits nothing.
        Value::Bool(true) => return,
        Value::Bool(false) => {
            out.push(Violation::new(path, "value not permitted", value, schema));
            return;
        }
        _ => return,
    };

    if let Some(expected) = schema_obj.get("type") {
        if !type_matches(value, expected) {
            out.push(Violation::new(
                path,
                format!(
                    "expected type {}, found {}",
                    type_label(expected),
                    value_type_name(value)
                ),
                value,
                schema,
            ));
            // A type mismatch makes the remaining keyword checks noise.
            return;
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            out.push(Violation::new(
                path,
                format!("value is not one of the permitted values {}", Value::Array(allowed.clone())),
                value,
                schema,
            ));
        }
    }

    match value {
        Value::Object(map) => check_object(map, schema_obj, path, schema, out),
        Value::Array(items) => check_array(items, schema_obj, path, schema, out),
        Value::String(s) => check_string(s, schema_obj, path, value, schema, out),
        Value::Number(_) => check_number(value, schema_obj, path, schema, out),
        _ => {}
    }
}

fn check_object(
    map: &serde_json::Map<String, Value>,
    schema_obj: &serde_json::Map<String, Value>,
    path: &str,
    schema: &Value,
    out: &mut Vec<Violation>,
) {
    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(key) {
                out.push(Violation::new(
                    &join_path(path, key),
                    format!("required property '{}' is missing", key),
                    &Value::Null,
                    schema,
                ));
            }
        }
    }

    let properties = schema_obj.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (key, sub_schema) in properties {
            if let Some(sub_value) = map.get(key) {
                check(sub_value, sub_schema, &join_path(path, key), out);
            }
        }
    }

    match schema_obj.get("additionalProperties") {
        Some(Value::Bool(false)) => {
            for key in map.keys() {
                let declared = properties.map(|p| p.contains_key(key)).unwrap_or(false);
                if !declared {
                    out.push(Violation::new(
                        &join_path(path, key),
                        format!("additional property '{}' is not allowed", key),
                        &map[key],
                        schema,
                    ));
                }
            }
        }
        Some(sub_schema @ Value::Object(_)) => {
            for (key, sub_value) in map {
                let declared = properties.map(|p| p.contains_key(key)).unwrap_or(false);
                if !declared {
                    check(sub_value, sub_schema, &join_path(path, key), out);
                }
            }
        }
        _ => {}
    }
}

fn check_array(
    items: &[Value],
    schema_obj: &serde_json::Map<String, Value>,
    path: &str,
    schema: &Value,
    out: &mut Vec<Violation>,
) {
    if let Some(min) = schema_obj.get("minItems").and_then(Value::as_u64) {
        if (items.len() as u64) < min {
            out.push(Violation::new(
                path,
                format!("array has {} items, fewer than minItems {}", items.len(), min),
                &Value::Array(items.to_vec()),
                schema,
            ));
        }
    }
    if let Some(max) = schema_obj.get("maxItems").and_then(Value::as_u64) {
        if (items.len() as u64) > max {
            out.push(Violation::new(
                path,
                format!("array has {} items, more than maxItems {}", items.len(), max),
                &Value::Array(items.to_vec()),
                schema,
            ));
        }
    }
    if let Some(item_schema) = schema_obj.get("items") {
        for (index, item) in items.iter().enumerate() {
            check(item, item_schema, &format!("{}[{}]", path, index), out);
        }
    }
}

fn check_string(
    s: &str,
    schema_obj: &serde_json::Map<String, Value>,
    path: &str,
    value: &Value,
    schema: &Value,
    out: &mut Vec<Violation>,
) {
    let length = s.chars().count() as u64;
    if let Some(min) = schema_obj.get("minLength").and_then(Value::as_u64) {
        if length < min {
            out.push(Violation::new(
                path,
                format!("string length {} is below minLength {}", length, min),
                value,
                schema,
            ));
        }
    }
    if let Some(max) = schema_obj.get("maxLength").and_then(Value::as_u64) {
        if length > max {
            out.push(Violation::new(
                path,
                format!("string length {} is above maxLength {}", length, max),
                value,
                schema,
            ));
        }
    }
    if let Some(pattern) = schema_obj.get("pattern").and_then(Value::as_str) {
        match Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(s) {
                    out.push(Violation::new(
                        path,
                        format!("string does not match pattern '{}'", pattern),
                        value,
                        schema,
                    ));
                }
            }
            Err(_) => out.push(Violation::new(
                path,
                format!("schema pattern '{}' is not a valid regex", pattern),
                value,
                schema,
            )),
        }
    }
}

fn check_number(
    value: &Value,
    schema_obj: &serde_json::Map<String, Value>,
    path: &str,
    schema: &Value,
    out: &mut Vec<Violation>,
) {
    let n = match value.as_f64() {
        Some(n) => n,
        None => return,
    };

    if let Some(min) = schema_obj.get("minimum").and_then(Value::as_f64) {
        if n < min {
            out.push(Violation::new(
                path,
                format!("{} is below minimum {}", n, min),
                value,
                schema,
            ));
        }
    }
    if let Some(max) = schema_obj.get("maximum").and_then(Value::as_f64) {
        if n > max {
            out.push(Violation::new(
                path,
                format!("{} is above maximum {}", n, max),
                value,
                schema,
            ));
        }
    }
    if let Some(min) = schema_obj.get("exclusiveMinimum").and_then(Value::as_f64) {
        if n <= min {
            out.push(Violation::new(
                path,
                format!("{} is not above exclusiveMinimum {}", n, min),
                value,
                schema,
            ));
        }
    }
    if let Some(max) = schema_obj.get("exclusiveMaximum").and_then(Value::as_f64) {
        if n >= max {
            out.push(Violation::new(
                path,
                format!("{} is not below exclusiveMaximum {}", n, max),
                value,
                schema,
            ));
        }
    }
}

fn type_matches(value: &Value, expected: &Value) -> bool {
    match expected {
        Value::String(name) => single_type_matches(value, name),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| single_type_matches(value, name)),
        _ => true,
    }
}

fn single_type_matches(value: &Value, name: &str) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false),
            _ => false,
        },
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_label(expected: &Value) -> String {
    match expected {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}
