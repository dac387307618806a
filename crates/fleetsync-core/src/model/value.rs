// ── Value arithmetic and serialization helpers ──
//
// Reported values are untyped JSON. These helpers implement the small
// amount of arithmetic the rule engine needs and the property-update
// string encoding used by the command router.

use serde_json::{Number, Value};

use super::capability::ValueType;

/// Numeric view of a JSON value. Numeric strings count too; both backends
/// occasionally report integers as strings.
fn as_number(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .map(Number::from)
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(Number::from_f64))
        }
        _ => None,
    }
}

fn combine(
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Option<Value> {
    let (a, b) = (as_number(a)?, as_number(b)?);
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(r) = int_op(x, y) {
            return Some(Value::from(r));
        }
    }
    let r = float_op(a.as_f64()?, b.as_f64()?);
    Number::from_f64(r).map(Value::Number)
}

/// `a + b` for numeric values; `None` when either side is not numeric.
pub fn add(a: &Value, b: &Value) -> Option<Value> {
    combine(a, b, i64::checked_add, |x, y| x + y)
}

/// `a - b` for numeric values; `None` when either side is not numeric.
pub fn subtract(a: &Value, b: &Value) -> Option<Value> {
    combine(a, b, i64::checked_sub, |x, y| x - y)
}

/// Whether the value has a numeric reading.
pub fn is_numeric(value: &Value) -> bool {
    as_number(value).is_some()
}

/// Encode a value for a property update.
///
/// Booleans become the literal strings `"true"`/`"false"` (for declared
/// boolean codes, textual and numeric spellings are normalized too),
/// strings pass through verbatim, anything else is JSON-stringified.
pub fn property_string(value: &Value, declared: ValueType) -> String {
    match (value, declared) {
        (Value::Bool(b), _) => b.to_string(),
        (Value::String(s), ValueType::Boolean) if s.eq_ignore_ascii_case("true") => "true".into(),
        (Value::String(s), ValueType::Boolean) if s.eq_ignore_ascii_case("false") => {
            "false".into()
        }
        (Value::Number(n), ValueType::Boolean) => {
            n.as_f64().is_some_and(|f| f.abs() > f64::EPSILON).to_string()
        }
        (Value::String(s), _) => s.clone(),
        (other, _) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_keeps_integers_integral() {
        assert_eq!(add(&json!(5), &json!(3)), Some(json!(8)));
        assert_eq!(add(&json!("5"), &json!(3)), Some(json!(8)));
    }

    #[test]
    fn add_falls_back_to_float() {
        assert_eq!(add(&json!(1.5), &json!(2)), Some(json!(3.5)));
    }

    #[test]
    fn add_rejects_non_numeric() {
        assert_eq!(add(&json!(true), &json!(1)), None);
        assert_eq!(add(&json!("on"), &json!(1)), None);
    }

    #[test]
    fn subtract_computes_delta() {
        assert_eq!(subtract(&json!(120), &json!(100)), Some(json!(20)));
        assert_eq!(subtract(&json!(100), &json!(120)), Some(json!(-20)));
    }

    #[test]
    fn property_string_booleans_are_lowercase_literals() {
        assert_eq!(property_string(&json!(true), ValueType::Boolean), "true");
        assert_eq!(property_string(&json!(false), ValueType::Unknown), "false");
        assert_eq!(property_string(&json!("True"), ValueType::Boolean), "true");
        assert_eq!(property_string(&json!(0), ValueType::Boolean), "false");
    }

    #[test]
    fn property_string_other_types() {
        assert_eq!(property_string(&json!("white"), ValueType::Enum), "white");
        assert_eq!(property_string(&json!(42), ValueType::Integer), "42");
        assert_eq!(property_string(&json!({"h": 1}), ValueType::Json), "{\"h\":1}");
    }
}
