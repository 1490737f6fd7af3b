//! Deterministic byte encoding used as hash input.
//!
//! Output is compact JSON with object keys sorted by code point at every
//! depth. Floats that carry an integral value inside the exactly
//! representable range are written as integers, so `1.0` and `1` encode to
//! the same bytes and `-0.0` encodes as `0`.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Number, Value};

use crate::{hash_bytes, ChainError};

/// 2^53, the bound below which every integer is exactly representable as f64.
const MAX_EXACT_F64_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Encode an ordered field map into canonical bytes.
///
/// # Errors
/// Returns [`ChainError::Encoding`] if a value cannot be represented.
pub fn encode(fields: &BTreeMap<String, Value>) -> Result<Vec<u8>, ChainError> {
    let mut out = Vec::with_capacity(256);
    write_object(fields.iter(), &mut out)?;
    Ok(out)
}

/// Serialize any value through `serde_json` and encode it canonically.
///
/// # Errors
/// Returns [`ChainError::Encoding`] when serialization fails, for example on
/// maps with non-string keys.
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ChainError> {
    let value = serde_json::to_value(value)
        .map_err(|err| ChainError::Encoding(format!("value is not serializable: {err}")))?;
    let mut out = Vec::with_capacity(256);
    write_value(&value, &mut out)?;
    Ok(out)
}

/// Lowercase hex SHA-256 of canonical bytes.
#[must_use]
pub fn digest(bytes: &[u8]) -> String {
    hash_bytes(bytes)
}

/// Encode then digest in one step.
///
/// # Errors
/// Returns [`ChainError::Encoding`] if encoding fails.
pub fn digest_fields(fields: &BTreeMap<String, Value>) -> Result<String, ChainError> {
    Ok(digest(&encode(fields)?))
}

fn write_object<'a, I>(entries: I, out: &mut Vec<u8>) -> Result<(), ChainError>
where
    I: Iterator<Item = (&'a String, &'a Value)>,
{
    out.push(b'{');
    for (position, (key, value)) in entries.enumerate() {
        if position > 0 {
            out.push(b',');
        }
        write_string(key, out)?;
        out.push(b':');
        write_value(value, out)?;
    }
    out.push(b'}');
    Ok(())
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<(), ChainError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(number) => write_number(number, out)?,
        Value::String(text) => write_string(text, out)?,
        Value::Array(items) => {
            out.push(b'[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(b',');
                }
                write_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // preserve_order keeps insertion order, so sort explicitly
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            write_object(entries.into_iter(), out)?;
        }
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn write_number(number: &Number, out: &mut Vec<u8>) -> Result<(), ChainError> {
    if let Some(value) = number.as_i64() {
        out.extend_from_slice(value.to_string().as_bytes());
        return Ok(());
    }
    if let Some(value) = number.as_u64() {
        out.extend_from_slice(value.to_string().as_bytes());
        return Ok(());
    }

    let Some(value) = number.as_f64() else {
        return Err(ChainError::Encoding(format!(
            "number {number} has no canonical representation"
        )));
    };
    if !value.is_finite() {
        return Err(ChainError::Encoding(format!(
            "non-finite number {value} cannot be encoded"
        )));
    }
    if value.fract() == 0.0 && value.abs() < MAX_EXACT_F64_INTEGER {
        let integral = value as i64;
        out.extend_from_slice(integral.to_string().as_bytes());
        return Ok(());
    }

    serde_json::to_writer(&mut *out, &value)
        .map_err(|err| ChainError::Encoding(format!("failed to encode number: {err}")))
}

fn write_string(text: &str, out: &mut Vec<u8>) -> Result<(), ChainError> {
    serde_json::to_writer(&mut *out, text)
        .map_err(|err| ChainError::Encoding(format!("failed to encode string: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fields(value: Value) -> BTreeMap<String, Value> {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            other => panic!("fixture must be an object, got {other}"),
        }
    }

    fn encoded_str(value: Value) -> String {
        must_ok(String::from_utf8(must_ok(encode(&fields(value)))))
    }

    #[test]
    fn nested_keys_are_sorted_and_output_is_compact() {
        let out = encoded_str(json!({
            "zeta": {"b": 1, "a": [true, null, {"y": "v", "x": "w"}]},
            "alpha": "text"
        }));
        assert_eq!(
            out,
            r#"{"alpha":"text","zeta":{"a":[true,null,{"x":"w","y":"v"}],"b":1}}"#
        );
    }

    #[test]
    fn integral_floats_collapse_to_integers() {
        assert_eq!(encoded_str(json!({"n": 1.0})), r#"{"n":1}"#);
        assert_eq!(encoded_str(json!({"n": -0.0})), r#"{"n":0}"#);
        assert_eq!(encoded_str(json!({"n": 0.25})), r#"{"n":0.25}"#);
        assert_eq!(encoded_str(json!({"n": -17})), r#"{"n":-17}"#);
        assert_eq!(encoded_str(json!({"n": u64::MAX})), format!(r#"{{"n":{}}}"#, u64::MAX));
    }

    #[test]
    fn strings_keep_unicode_without_normalization() {
        // precomposed and decomposed forms stay distinct
        let composed = encoded_str(json!({"s": "caf\u{e9}"}));
        let decomposed = encoded_str(json!({"s": "cafe\u{301}"}));
        assert_ne!(composed, decomposed);
        assert_eq!(encoded_str(json!({"s": "a\"b\n"})), r#"{"s":"a\"b\n"}"#);
    }

    #[test]
    fn non_string_map_keys_fail_with_encoding_error() {
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);
        let result = encode_value(&bad);
        assert!(matches!(result, Err(ChainError::Encoding(_))), "{result:?}");
    }

    #[test]
    fn digest_matches_known_vector() {
        let bytes = must_ok(encode(&fields(json!({"b": 2, "a": 1}))));
        assert_eq!(bytes, br#"{"a":1,"b":2}"#.to_vec());
        assert_eq!(digest(&bytes), hash_bytes(br#"{"a":1,"b":2}"#));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn insertion_order_never_changes_bytes(
            entries in proptest::collection::vec(("[a-z]{1,8}", any::<i64>(), "[ -~]{0,12}"), 1..12)
        ) {
            let mut forward = serde_json::Map::new();
            for (key, number, text) in &entries {
                forward.insert(key.clone(), json!({"n": number, "t": text}));
            }
            let mut backward = serde_json::Map::new();
            for (key, _, _) in entries.iter().rev() {
                if let Some(value) = forward.get(key) {
                    backward.insert(key.clone(), value.clone());
                }
            }

            let left = must_ok(encode_value(&Value::Object(forward)));
            let right = must_ok(encode_value(&Value::Object(backward)));
            prop_assert_eq!(left, right);
        }

        #[test]
        fn finite_floats_survive_a_json_round_trip(value in -1.0e12_f64..1.0e12_f64) {
            let original = must_ok(encode_value(&json!({"v": value})));
            let text = must_ok(serde_json::to_string(&json!({"v": value})));
            let reparsed: Value = must_ok(serde_json::from_str(&text));
            let again = must_ok(encode_value(&reparsed));
            prop_assert_eq!(original, again);
        }
    }
}
