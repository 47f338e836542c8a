//! Canonical JSON rendering and order-independent structural equality.
//!
//! Idempotency hashing and snapshot diffing must agree on what "the same
//! value" means, so both go through this one module. Object keys are
//! sorted recursively before rendering, so two payloads that differ only
//! in field order produce identical canonical strings.

use serde_json::Value;

/// Render a JSON value to a canonical string with recursively sorted
/// object keys.
///
/// Scalars render as compact JSON; arrays preserve element order; objects
/// are rendered with their entries sorted by key at every nesting level.
pub fn stable_stringify(value: &Value) -> String {
    match value {
        Value::Null => String::from("null"),
        Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(stable_stringify).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            let inner: Vec<String> = entries
                .iter()
                .map(|(key, item)| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(key).unwrap_or_default(),
                        stable_stringify(item)
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
    }
}

/// Compare two JSON values structurally, ignoring object key order.
pub fn structurally_equal(left: &Value, right: &Value) -> bool {
    stable_stringify(left) == stable_stringify(right)
}

/// Render a finite number back into a JSON value, preferring the integer
/// representation when the value is integral.
///
/// Keeps computed numbers (deltas, rounded coordinates) structurally equal
/// to their hand-written integer counterparts.
pub fn number_value(num: f64) -> Value {
    if !num.is_finite() {
        return Value::Null;
    }
    if num.fract().abs() < f64::EPSILON {
        if let Ok(integral) = format!("{num:.0}").parse::<i64>() {
            return Value::from(integral);
        }
    }
    serde_json::Number::from_f64(num).map_or(Value::Null, Value::Number)
}

/// Coerce a JSON value to a finite number.
///
/// Accepts JSON numbers directly and numeric strings (`"42"`, `"-3.5"`).
/// Anything else, including non-finite parses, yields `None`.
pub fn as_finite_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(num) => num.as_f64().filter(|parsed| parsed.is_finite()),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|parsed| parsed.is_finite()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn scalars_render_as_compact_json() {
        assert_eq!(stable_stringify(&json!(null)), "null");
        assert_eq!(stable_stringify(&json!(true)), "true");
        assert_eq!(stable_stringify(&json!(3)), "3");
        assert_eq!(stable_stringify(&json!("hi")), "\"hi\"");
    }

    #[test]
    fn object_key_order_does_not_matter() {
        let left = json!({ "b": 1, "a": { "y": 2, "x": 3 } });
        let right = json!({ "a": { "x": 3, "y": 2 }, "b": 1 });
        assert_eq!(stable_stringify(&left), stable_stringify(&right));
        assert!(structurally_equal(&left, &right));
    }

    #[test]
    fn array_order_matters() {
        assert!(!structurally_equal(&json!([1, 2]), &json!([2, 1])));
    }

    #[test]
    fn number_value_prefers_integers() {
        assert_eq!(number_value(130.0), json!(130));
        assert_eq!(number_value(-4.0), json!(-4));
        assert_eq!(number_value(2.5), json!(2.5));
        assert_eq!(number_value(f64::NAN), json!(null));
    }

    #[test]
    fn numeric_coercion_accepts_strings() {
        assert_eq!(as_finite_number(&json!(5)), Some(5.0));
        assert_eq!(as_finite_number(&json!("5.5")), Some(5.5));
        assert_eq!(as_finite_number(&json!(" -3 ")), Some(-3.0));
        assert_eq!(as_finite_number(&json!("not a number")), None);
        assert_eq!(as_finite_number(&json!({ "x": 1 })), None);
    }
}
