//! Lenient field parsing shared by both collectors.

use serde_json::Value;

/// Look up `field` in `value`: a JSON pointer (`/a/b`) or a top-level name.
pub(crate) fn lookup<'v>(value: &'v Value, field: &str) -> Option<&'v Value> {
    if field.starts_with('/') {
        value.pointer(field)
    } else {
        value.get(field)
    }
}

/// Non-empty text form of a scalar.
pub(crate) fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Whole currency units from `450000`, `450000.4` or `"$450,000"`.
pub(crate) fn money(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => number(s).map(|f| f.round() as i64),
        _ => None,
    }
}

/// Floating-point amount from a number or free text like `"1,850 sqft"`.
pub(crate) fn amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => number(s),
        _ => None,
    }
}

/// First decimal number in `raw`, ignoring currency symbols and thousands
/// separators.
pub(crate) fn number(raw: &str) -> Option<f64> {
    let digits: String = raw
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .filter(|c| *c != ',')
        .collect();
    digits.trim_end_matches('.').parse().ok()
}
