//! Allow-list sanitization of script results.
//!
//! Whatever a script returns crosses the isolation boundary as arbitrary JSON.
//! Only `value`, `label` and `color` survive, each coerced to a string the way
//! JavaScript's `String(x)` would render it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder shown when a script returns no `value`.
pub const PLACEHOLDER_VALUE: &str = "—";

/// The only shape ever handed back to a widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptResult {
    /// Display value, always a string.
    pub value: String,
    /// Optional caption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Optional CSS color for the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl ScriptResult {
    /// Normalize a raw `scriptResult` payload.
    ///
    /// Falsy payloads are treated as an empty object. `value` defaults to
    /// [`PLACEHOLDER_VALUE`]; `label` and `color` are kept only when truthy.
    pub fn sanitize(raw: &Value) -> Self {
        let fields = if is_truthy(raw) { raw.as_object() } else { None };

        let value = fields
            .and_then(|o| o.get("value"))
            .map(js_string)
            .unwrap_or_else(|| PLACEHOLDER_VALUE.to_string());

        let optional = |key: &str| {
            fields
                .and_then(|o| o.get(key))
                .filter(|v| is_truthy(v))
                .map(js_string)
        };

        Self {
            value,
            label: optional("label"),
            color: optional("color"),
        }
    }
}

/// JavaScript truthiness for a JSON value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a JSON value the way `String(x)` renders the equivalent JS value.
pub fn js_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                n.to_string()
            } else {
                js_number(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => s.clone(),
        // Array.prototype.toString joins elements, rendering null as empty.
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::Null => String::new(),
                other => js_string(other),
            })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

/// `Number.prototype.toString()` for a finite or non-finite double.
fn js_number(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if f == 0.0 {
        return "0".to_string();
    }

    // `{:e}` yields the shortest round-trip digits as `d.ddde<exp>`.
    let sci = format!("{:e}", f.abs());
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return f.to_string();
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let Ok(exp) = exp.parse::<i32>() else {
        return f.to_string();
    };
    let k = digits.len() as i32;
    let n = exp + 1;

    let body = if k <= n && n <= 21 {
        format!("{digits}{}", "0".repeat((n - k) as usize))
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(n as usize);
        format!("{int}.{frac}")
    } else if -6 < n && n <= 0 {
        format!("0.{}{digits}", "0".repeat((-n) as usize))
    } else {
        let sign = if n - 1 < 0 { '-' } else { '+' };
        let (first, rest) = digits.split_at(1);
        if rest.is_empty() {
            format!("{first}e{sign}{}", (n - 1).abs())
        } else {
            format!("{first}.{rest}e{sign}{}", (n - 1).abs())
        }
    };

    if f < 0.0 {
        format!("-{body}")
    } else {
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_value_is_stringified_without_hints() {
        let r = ScriptResult::sanitize(&json!({"value": 42}));
        assert_eq!(
            r,
            ScriptResult {
                value: "42".into(),
                label: None,
                color: None
            }
        );
    }

    #[test]
    fn extra_fields_are_dropped() {
        let r = ScriptResult::sanitize(&json!({
            "value": 42,
            "label": "answer",
            "extra": "drop-me"
        }));
        assert_eq!(r.value, "42");
        assert_eq!(r.label.as_deref(), Some("answer"));
        assert_eq!(r.color, None);
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            json!({"value": "42", "label": "answer"})
        );
    }

    #[test]
    fn missing_value_uses_placeholder() {
        assert_eq!(ScriptResult::sanitize(&json!({"label": "x"})).value, "—");
        assert_eq!(ScriptResult::sanitize(&Value::Null).value, "—");
        assert_eq!(ScriptResult::sanitize(&json!(0)).value, "—");
        assert_eq!(ScriptResult::sanitize(&json!("just a string")).value, "—");
        assert_eq!(ScriptResult::sanitize(&json!([1, 2])).value, "—");
    }

    #[test]
    fn present_but_falsy_value_is_kept() {
        assert_eq!(ScriptResult::sanitize(&json!({"value": 0})).value, "0");
        assert_eq!(ScriptResult::sanitize(&json!({"value": ""})).value, "");
        assert_eq!(ScriptResult::sanitize(&json!({"value": false})).value, "false");
        assert_eq!(ScriptResult::sanitize(&json!({"value": null})).value, "null");
    }

    #[test]
    fn falsy_label_and_color_are_omitted() {
        let r = ScriptResult::sanitize(&json!({"value": 1, "label": "", "color": 0}));
        assert_eq!(r.label, None);
        assert_eq!(r.color, None);
    }

    #[test]
    fn non_string_hints_are_coerced() {
        let r = ScriptResult::sanitize(&json!({"value": 1, "label": 7, "color": true}));
        assert_eq!(r.label.as_deref(), Some("7"));
        assert_eq!(r.color.as_deref(), Some("true"));
    }

    #[test]
    fn js_string_matches_javascript_rendering() {
        assert_eq!(js_string(&json!(1.5)), "1.5");
        assert_eq!(js_string(&json!(-3.0)), "-3");
        assert_eq!(js_string(&json!([1, null, "a"])), "1,,a");
        assert_eq!(js_string(&json!({"a": 1})), "[object Object]");
        assert_eq!(js_string(&json!("72°F")), "72°F");
        assert_eq!(js_string(&json!(0.1)), "0.1");
        assert_eq!(js_string(&json!(123.456)), "123.456");
        assert_eq!(js_string(&json!(0.000001)), "0.000001");
        assert_eq!(js_string(&json!(1e-7)), "1e-7");
        assert_eq!(js_string(&json!(-2.5e-8)), "-2.5e-8");
        assert_eq!(js_string(&json!(1e20)), "100000000000000000000");
        assert_eq!(js_string(&json!(1e21)), "1e+21");
        assert_eq!(js_string(&json!(1.5e300)), "1.5e+300");
        assert_eq!(js_string(&json!(-0.0)), "0");
    }
}
