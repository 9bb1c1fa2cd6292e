//! JSON value utilities shared across the engine: dotted-path traversal
//! with bracketed array indices, result-envelope unwrapping, truthiness.

use serde_json::Value;

/// Traverse `root` along a dotted path. Array elements are addressed either
/// with a bare numeric segment (`items.0`) or brackets (`items[0]`).
/// Returns `None` when any segment fails to resolve.
pub fn traverse<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(root);
    }

    let mut current = root;
    for segment in split_path(path) {
        current = match segment {
            PathSegment::Key(key) => match current {
                Value::Object(map) => map.get(key)?,
                // Numeric keys double as array indices in dot notation.
                Value::Array(arr) => arr.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            },
            PathSegment::Index(index) => match current {
                Value::Array(arr) => arr.get(index)?,
                _ => return None,
            },
        };
    }
    Some(current)
}

enum PathSegment<'a> {
    Key(&'a str),
    Index(usize),
}

fn split_path(path: &str) -> impl Iterator<Item = PathSegment<'_>> {
    path.split('.').flat_map(|part| {
        let mut segments = Vec::new();
        let mut rest = part;
        while let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                segments.push(PathSegment::Key(&rest[..bracket]));
            }
            match rest[bracket..].find(']') {
                Some(close) => {
                    let idx = &rest[bracket + 1..bracket + close];
                    match idx.parse::<usize>() {
                        Ok(index) => segments.push(PathSegment::Index(index)),
                        // A malformed index becomes a key that will not resolve.
                        Err(_) => segments.push(PathSegment::Key(idx)),
                    }
                    rest = &rest[bracket + close + 1..];
                }
                None => {
                    segments.push(PathSegment::Key(rest));
                    rest = "";
                }
            }
        }
        if !rest.is_empty() {
            segments.push(PathSegment::Key(rest));
        }
        segments
    })
}

/// Unwrap a `{"result": X}` envelope, returning `X`. Handlers may store raw
/// values or envelopes; readers always see the inner value.
pub fn unwrap_result_envelope(value: &Value) -> &Value {
    match value {
        Value::Object(map) if map.len() == 1 => map.get("result").unwrap_or(value),
        _ => value,
    }
}

/// Unwrap a single-key payload envelope (`data`, `content`, `text`,
/// `response`) before schema validation.
pub fn unwrap_payload_envelope(value: &Value) -> &Value {
    const ENVELOPE_KEYS: [&str; 4] = ["data", "content", "text", "response"];
    if let Value::Object(map) = value {
        if map.len() == 1 {
            for key in ENVELOPE_KEYS {
                if let Some(inner) = map.get(key) {
                    return inner;
                }
            }
        }
    }
    value
}

/// Condition truthiness: `false`, `null`, `0`, `""`, `[]` and `{}` are
/// falsey; everything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(arr) => !arr.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Stringify a value for interpolation into surrounding literal text.
/// Strings render bare; everything else renders as compact JSON.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Coerce a value to f64 for arithmetic builtins.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(true) => Some(1.0),
        Value::Bool(false) => Some(0.0),
        _ => None,
    }
}

/// Wrap an f64 back into a JSON number, collapsing integral results to
/// integers so arithmetic over counters stays integer-typed.
pub fn number_value(value: f64) -> Value {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
