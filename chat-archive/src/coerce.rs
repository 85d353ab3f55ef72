//! Type-tolerant conversions for loosely-typed export fields.
//!
//! Export files disagree about how scalars are encoded: timestamps show up as
//! floats, integers, numeric strings, or wrapped in small objects. These helpers
//! never fail; anything they cannot interpret collapses to a neutral value.

use serde_json::Value;

/// Keys consulted, in order, when a timestamp arrives wrapped in an object.
pub const TIMESTAMP_KEYS: [&str; 4] = ["timestamp", "time", "create_time", "date"];

/// Coerces an arbitrary node into a finite `f64`.
///
/// Numbers and numeric strings (surrounding whitespace allowed) convert
/// directly, booleans become `1.0`/`0.0`, and objects are searched for the first
/// truthy value under one of [`TIMESTAMP_KEYS`]. Everything else, including
/// NaN and infinities, yields `0.0`.
pub fn coerce_float(value: &Value) -> f64 {
    let coerced = match value {
        Value::Number(number) => number.as_f64().unwrap_or(0.0),
        Value::String(text) => text.trim().parse::<f64>().unwrap_or(0.0),
        Value::Bool(true) => 1.0,
        Value::Bool(false) => 0.0,
        Value::Object(map) => TIMESTAMP_KEYS
            .iter()
            .find_map(|key| map.get(*key).filter(|candidate| is_truthy(candidate)))
            .map(coerce_float)
            .unwrap_or(0.0),
        Value::Null | Value::Array(_) => 0.0,
    };
    if coerced.is_finite() {
        coerced
    } else {
        0.0
    }
}

/// Renders a node as text: `null` is empty, strings pass through, and
/// everything else uses its compact JSON form.
pub fn coerce_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Loose truthiness: null, `false`, zero, and empty strings or containers are falsy.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
