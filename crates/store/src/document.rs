use core::cmp::Ordering;

use serde_json::{Map, Value};

/// A stored row: a JSON object keyed by field name.
pub type Document = Map<String, Value>;

/// Reads an integer field, accepting integral floats.
#[must_use]
pub fn get_i64(doc: &Document, field: &str) -> Option<i64> {
    value_as_i64(doc.get(field)?)
}

#[must_use]
pub fn get_str<'a>(doc: &'a Document, field: &str) -> Option<&'a str> {
    doc.get(field)?.as_str()
}

#[must_use]
pub fn value_as_i64(value: &Value) -> Option<i64> {
    let Value::Number(number) = value else {
        return None;
    };

    if let Some(int) = number.as_i64() {
        return Some(int);
    }

    let float = number.as_f64()?;

    #[expect(clippy::cast_possible_truncation, reason = "checked to be integral and in range")]
    let int = float as i64;

    (float.fract() == 0.0 && float >= i64::MIN as f64 && float <= i64::MAX as f64).then_some(int)
}

/// Total order over JSON values used for sorting and equality in filters.
///
/// Values of different kinds order as null < numbers < strings < objects <
/// arrays < booleans. Numbers compare numerically regardless of representation.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Object(_), Value::Object(_)) | (Value::Array(_), Value::Array(_)) => {
            if a == b {
                Ordering::Equal
            } else {
                a.to_string().cmp(&b.to_string())
            }
        }
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

const fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}
