//! Canonical JSON encoding for signed documents.
//!
//! Evidence bundles sign the exact bytes of `summary.json`, so the encoding
//! must be deterministic: re-serializing a canonical document yields
//! byte-identical output and the signature keeps verifying.
//!
//! # Rules
//!
//! 1. Object keys are sorted in lexicographic (byte-order) order
//! 2. No whitespace between tokens, LF-free single line
//! 3. Strings use minimal escaping (only `"`, `\`, and control characters
//!    U+0000..U+001F, with the short escapes where JSON defines them)
//! 4. Integers are emitted in plain decimal; non-integer numbers use Rust's
//!    shortest round-trip `f64` form, which is stable for a given value
//!
//! Unlike a signing-only profile, metric values are measurements and are
//! frequently non-integral, so floats are permitted. NaN and infinities are
//! unrepresentable in `serde_json::Number` and therefore cannot occur.

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Maximum nesting depth accepted by [`canonicalize`].
pub const MAX_DEPTH: usize = 128;

/// Errors from canonical encoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// The value could not be serialized to a JSON tree.
    #[error("serialization failed: {message}")]
    Serialize {
        /// Description of the failure.
        message: String,
    },

    /// The JSON is nested deeper than [`MAX_DEPTH`] levels.
    #[error("max depth exceeded: JSON nested deeper than {max_depth} levels")]
    MaxDepthExceeded {
        /// The limit that was exceeded.
        max_depth: usize,
    },
}

/// Serializes any `Serialize` value to canonical JSON bytes.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value cannot be represented as a JSON
/// tree or exceeds the nesting limit.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    let tree = serde_json::to_value(value).map_err(|e| CanonicalError::Serialize {
        message: e.to_string(),
    })?;
    canonicalize(&tree).map(String::into_bytes)
}

/// Produces the canonical string form of a JSON tree.
///
/// # Errors
///
/// Returns [`CanonicalError::MaxDepthExceeded`] for structures nested deeper
/// than [`MAX_DEPTH`] levels.
pub fn canonicalize(value: &Value) -> Result<String, CanonicalError> {
    check_depth(value, 0)?;
    let mut output = String::new();
    emit_value(value, &mut output);
    Ok(output)
}

/// Checks whether a string is already in canonical form.
#[must_use]
pub fn is_canonical(input: &str) -> bool {
    serde_json::from_str::<Value>(input)
        .ok()
        .and_then(|v| canonicalize(&v).ok())
        .is_some_and(|canonical| canonical == input)
}

fn check_depth(value: &Value, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }
    match value {
        Value::Array(arr) => {
            for item in arr {
                check_depth(item, depth + 1)?;
            }
        }
        Value::Object(obj) => {
            for val in obj.values() {
                check_depth(val, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn emit_value(value: &Value, output: &mut String) {
    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(b) => output.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, output),
        Value::String(s) => emit_string(s, output),
        Value::Array(arr) => emit_array(arr, output),
        Value::Object(obj) => emit_object(obj, output),
    }
}

/// Emits a number deterministically.
///
/// Integers are plain decimal. Non-integers use Rust's shortest round-trip
/// formatting, which produces one fixed string per distinct `f64` value.
fn emit_number(n: &Number, output: &mut String) {
    if let Some(i) = n.as_i64() {
        let _ = write!(output, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(output, "{u}");
    } else if let Some(f) = n.as_f64() {
        let _ = write!(output, "{f}");
        // `{}` on f64 omits the decimal point for whole values (`3.0` ->
        // "3"); a reparse would then yield an integer and the encoding
        // would not be idempotent. Keep the float marker.
        if f.is_finite() && f.fract() == 0.0 {
            output.push_str(".0");
        }
    }
}

/// Emits a string with minimal escaping.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            }
            c => output.push(c),
        }
    }
    output.push('"');
}

fn emit_array(arr: &[Value], output: &mut String) {
    output.push('[');
    for (i, item) in arr.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_value(item, output);
    }
    output.push(']');
}

fn emit_object(obj: &Map<String, Value>, output: &mut String) {
    let mut sorted_keys: Vec<&String> = obj.keys().collect();
    sorted_keys.sort();

    output.push('{');
    for (i, key) in sorted_keys.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(&obj[*key], output);
    }
    output.push('}');
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sorts_keys() {
        let value = json!({"z": 1, "a": 2, "m": 3});
        assert_eq!(canonicalize(&value).unwrap(), r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn test_nested_objects_sorted() {
        let value = json!({"outer": {"z": 1, "a": 2}});
        assert_eq!(canonicalize(&value).unwrap(), r#"{"outer":{"a":2,"z":1}}"#);
    }

    #[test]
    fn test_arrays_preserve_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(canonicalize(&value).unwrap(), "[3,1,2]");
    }

    #[test]
    fn test_primitives() {
        assert_eq!(canonicalize(&json!(null)).unwrap(), "null");
        assert_eq!(canonicalize(&json!(true)).unwrap(), "true");
        assert_eq!(canonicalize(&json!(42)).unwrap(), "42");
        assert_eq!(canonicalize(&json!(-7)).unwrap(), "-7");
        assert_eq!(canonicalize(&json!("hi")).unwrap(), "\"hi\"");
    }

    #[test]
    fn test_float_values_stable() {
        assert_eq!(canonicalize(&json!(18.5)).unwrap(), "18.5");
        assert_eq!(canonicalize(&json!(0.027)).unwrap(), "0.027");
    }

    #[test]
    fn test_whole_float_keeps_marker() {
        // 18.0 must not canonicalize to "18" - a reparse would change the
        // number's type and break idempotence.
        let n = serde_json::Number::from_f64(18.0).unwrap();
        let out = canonicalize(&Value::Number(n)).unwrap();
        assert_eq!(out, "18.0");
    }

    #[test]
    fn test_escaping() {
        let value = json!({"text": "line1\nline2\ttab \"q\" \\"});
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"text":"line1\nline2\ttab \"q\" \\"}"#
        );
    }

    #[test]
    fn test_control_chars_escaped() {
        let value = json!({"text": "\u{0000}"});
        assert!(canonicalize(&value).unwrap().contains("\\u0000"));
    }

    #[test]
    fn test_is_canonical() {
        assert!(is_canonical(r#"{"a":1,"b":2}"#));
        assert!(!is_canonical(r#"{"b":2,"a":1}"#));
        assert!(!is_canonical(r#"{ "a": 1 }"#));
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            json!({"z": 1, "a": {"b": 2.5, "a": [1, 2.0]}}),
            json!([1, {"y": 3, "x": "s"}]),
        ];
        for value in &inputs {
            let once = canonicalize(value).unwrap();
            let reparsed: Value = serde_json::from_str(&once).unwrap();
            let twice = canonicalize(&reparsed).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!(0);
        for _ in 0..(MAX_DEPTH + 10) {
            value = json!({ "n": value });
        }
        assert!(matches!(
            canonicalize(&value),
            Err(CanonicalError::MaxDepthExceeded { .. })
        ));
    }

    #[test]
    fn test_to_canonical_bytes_of_struct() {
        #[derive(serde::Serialize)]
        struct Doc {
            z: u32,
            a: &'static str,
        }
        let bytes = to_canonical_bytes(&Doc { z: 1, a: "x" }).unwrap();
        assert_eq!(bytes, br#"{"a":"x","z":1}"#);
    }

    proptest! {
        #[test]
        fn prop_canonicalize_idempotent(
            keys in proptest::collection::vec("[a-z]{1,8}", 0..8),
            ints in proptest::collection::vec(any::<i64>(), 0..8),
        ) {
            let mut obj = Map::new();
            for (k, v) in keys.iter().zip(ints.iter()) {
                obj.insert(k.clone(), json!(v));
            }
            let value = Value::Object(obj);
            let once = canonicalize(&value).unwrap();
            let reparsed: Value = serde_json::from_str(&once).unwrap();
            prop_assert_eq!(once, canonicalize(&reparsed).unwrap());
        }

        #[test]
        fn prop_float_round_trips(f in any::<f64>().prop_filter("finite", |f| f.is_finite())) {
            let Some(n) = Number::from_f64(f) else { return Ok(()); };
            let out = canonicalize(&Value::Number(n)).unwrap();
            let reparsed: Value = serde_json::from_str(&out).unwrap();
            prop_assert_eq!(out, canonicalize(&reparsed).unwrap());
        }
    }
}
