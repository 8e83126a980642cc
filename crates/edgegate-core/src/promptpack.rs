//! Versioned prompt suites and expectation scoring.
//!
//! A promptpack holds up to 50 cases. Each case declares an expectation of
//! type `json_schema`, `regex`, `exact`, or `none`; scoring a model output
//! against an expectation yields 0 or 1 per repeat.
//!
//! Content is canonicalized (LF-only, canonical JSON) before hashing so a
//! pack's SHA-256 is stable across upload formatting. Once a
//! `(logical_id, version)` is published its content is immutable; the
//! daemon enforces that rule, this module supplies the hash it compares.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::canonical;
use crate::limits::{self, LimitExceeded};

/// Errors from promptpack validation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PromptPackError {
    /// A hard limit was violated.
    #[error(transparent)]
    Limit(#[from] LimitExceeded),

    /// Case ids must be unique within a pack.
    #[error("duplicate case id: {case_id}")]
    DuplicateCaseId {
        /// The repeated id.
        case_id: String,
    },

    /// A regex expectation failed to compile.
    #[error("case {case_id}: invalid regex: {message}")]
    InvalidRegex {
        /// The case declaring the expectation.
        case_id: String,
        /// Compiler error.
        message: String,
    },

    /// A schema expectation uses an unsupported keyword shape.
    #[error("case {case_id}: invalid schema: {message}")]
    InvalidSchema {
        /// The case declaring the expectation.
        case_id: String,
        /// What was wrong.
        message: String,
    },

    /// The canonical form could not be produced.
    #[error("canonicalization failed: {0}")]
    Canonical(#[from] canonical::CanonicalError),
}

/// What a case expects of the model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expectation {
    /// Output must parse as JSON and satisfy a structural schema subset
    /// (`type`, `required`, `properties`, `items`, `enum`).
    JsonSchema {
        /// The schema document.
        schema: Value,
    },
    /// Output must match the regex.
    Regex {
        /// The pattern, anchored by the author if desired.
        pattern: String,
    },
    /// Output must equal the string exactly (after LF normalization).
    Exact {
        /// The expected output.
        value: String,
    },
    /// No expectation; the case contributes latency data only and is
    /// excluded from correctness aggregation.
    None,
}

impl Expectation {
    /// Scores an output: 1 (true) or 0 (false). `None` always scores true
    /// but callers exclude such cases from aggregation.
    #[must_use]
    pub fn score(&self, output: &str) -> bool {
        match self {
            Self::JsonSchema { schema } => serde_json::from_str::<Value>(output)
                .is_ok_and(|v| schema_accepts(schema, &v)),
            Self::Regex { pattern } => Regex::new(pattern).is_ok_and(|re| re.is_match(output)),
            Self::Exact { value } => normalize_newlines(output) == normalize_newlines(value),
            Self::None => true,
        }
    }

    /// Whether the case counts toward aggregate correctness.
    #[must_use]
    pub const fn scored(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// One prompt case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptCase {
    /// Stable case id, unique within the pack.
    pub id: String,
    /// The prompt text.
    pub prompt: String,
    /// Optional per-case token cap; bounded by the run policy's cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,
    /// The expectation.
    pub expectation: Expectation,
}

/// The content of a promptpack version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPackContent {
    /// The cases, at most 50.
    pub cases: Vec<PromptCase>,
}

impl PromptPackContent {
    /// Validates limits, uniqueness, and expectation well-formedness.
    ///
    /// # Errors
    ///
    /// Returns [`PromptPackError`] on any violation.
    pub fn validate(&self) -> Result<(), PromptPackError> {
        limits::check_promptpack_cases(self.cases.len())?;

        let mut seen = std::collections::HashSet::new();
        for case in &self.cases {
            if !seen.insert(case.id.as_str()) {
                return Err(PromptPackError::DuplicateCaseId {
                    case_id: case.id.clone(),
                });
            }
            if let Some(tokens) = case.max_new_tokens {
                limits::check_max_new_tokens(tokens)?;
            }
            match &case.expectation {
                Expectation::Regex { pattern } => {
                    Regex::new(pattern).map_err(|e| PromptPackError::InvalidRegex {
                        case_id: case.id.clone(),
                        message: e.to_string(),
                    })?;
                }
                Expectation::JsonSchema { schema } => {
                    check_schema_shape(schema).map_err(|message| {
                        PromptPackError::InvalidSchema {
                            case_id: case.id.clone(),
                            message,
                        }
                    })?;
                }
                Expectation::Exact { .. } | Expectation::None => {}
            }
        }
        Ok(())
    }

    /// Canonical bytes of the content: canonical JSON of the case list.
    /// Idempotent - canonicalizing already-canonical content is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PromptPackError::Canonical`] if encoding fails.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, PromptPackError> {
        Ok(canonical::to_canonical_bytes(self)?)
    }

    /// SHA-256 over the canonical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PromptPackError::Canonical`] if encoding fails.
    pub fn canonical_sha256(&self) -> Result<String, PromptPackError> {
        Ok(crate::cas::sha256_hex(&self.canonical_bytes()?))
    }
}

fn normalize_newlines(s: &str) -> String {
    s.replace("\r\n", "\n")
}

/// Structural schema check, JSON Schema subset.
///
/// Supported keywords: `type` (string or array of strings), `required`,
/// `properties`, `items`, `enum`. Unknown keywords are ignored, matching
/// the permissive reading most validators apply.
#[must_use]
pub fn schema_accepts(schema: &Value, value: &Value) -> bool {
    let Some(schema_obj) = schema.as_object() else {
        // Boolean schemas: `true` accepts everything, `false` nothing.
        return schema.as_bool().unwrap_or(false);
    };

    if let Some(expected) = schema_obj.get("type") {
        let matches_type = |name: &str| type_matches(name, value);
        let ok = match expected {
            Value::String(name) => matches_type(name),
            Value::Array(names) => names
                .iter()
                .filter_map(Value::as_str)
                .any(matches_type),
            _ => false,
        };
        if !ok {
            return false;
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return false;
        }
    }

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        let Some(obj) = value.as_object() else {
            return false;
        };
        for key in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(key) {
                return false;
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
        if let Some(obj) = value.as_object() {
            for (key, subschema) in properties {
                if let Some(subvalue) = obj.get(key) {
                    if !schema_accepts(subschema, subvalue) {
                        return false;
                    }
                }
            }
        }
    }

    if let Some(items) = schema_obj.get("items") {
        if let Some(arr) = value.as_array() {
            for item in arr {
                if !schema_accepts(items, item) {
                    return false;
                }
            }
        }
    }

    true
}

fn type_matches(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => false,
    }
}

/// Validates that a schema document only relies on the supported subset in
/// positions that would change acceptance.
fn check_schema_shape(schema: &Value) -> Result<(), String> {
    match schema {
        Value::Bool(_) => Ok(()),
        Value::Object(obj) => {
            if let Some(t) = obj.get("type") {
                let valid = match t {
                    Value::String(s) => is_known_type(s),
                    Value::Array(names) => names
                        .iter()
                        .all(|n| n.as_str().is_some_and(is_known_type)),
                    _ => false,
                };
                if !valid {
                    return Err(format!("unsupported type keyword: {t}"));
                }
            }
            if let Some(required) = obj.get("required") {
                if !required
                    .as_array()
                    .is_some_and(|a| a.iter().all(Value::is_string))
                {
                    return Err("required must be an array of strings".to_string());
                }
            }
            if let Some(properties) = obj.get("properties") {
                let Some(props) = properties.as_object() else {
                    return Err("properties must be an object".to_string());
                };
                for sub in props.values() {
                    check_schema_shape(sub)?;
                }
            }
            if let Some(items) = obj.get("items") {
                check_schema_shape(items)?;
            }
            Ok(())
        }
        other => Err(format!("schema must be an object or boolean, got {other}")),
    }
}

fn is_known_type(name: &str) -> bool {
    matches!(
        name,
        "object" | "array" | "string" | "number" | "integer" | "boolean" | "null"
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn case(id: &str, expectation: Expectation) -> PromptCase {
        PromptCase {
            id: id.to_string(),
            prompt: "Summarize the release notes.".to_string(),
            max_new_tokens: None,
            expectation,
        }
    }

    #[test]
    fn test_exact_scoring() {
        let expectation = Expectation::Exact {
            value: "PASS".to_string(),
        };
        assert!(expectation.score("PASS"));
        assert!(!expectation.score("FAIL"));
    }

    #[test]
    fn test_exact_normalizes_crlf() {
        let expectation = Expectation::Exact {
            value: "line1\nline2".to_string(),
        };
        assert!(expectation.score("line1\r\nline2"));
    }

    #[test]
    fn test_regex_scoring() {
        let expectation = Expectation::Regex {
            pattern: r"^\d{4}-\d{2}-\d{2}$".to_string(),
        };
        assert!(expectation.score("2026-08-02"));
        assert!(!expectation.score("not a date"));
    }

    #[test]
    fn test_json_schema_scoring() {
        let expectation = Expectation::JsonSchema {
            schema: json!({
                "type": "object",
                "required": ["answer", "confidence"],
                "properties": {
                    "answer": {"type": "string"},
                    "confidence": {"type": "number"}
                }
            }),
        };
        assert!(expectation.score(r#"{"answer": "42", "confidence": 0.9}"#));
        assert!(!expectation.score(r#"{"answer": "42"}"#));
        assert!(!expectation.score(r#"{"answer": 42, "confidence": 0.9}"#));
        assert!(!expectation.score("not json"));
    }

    #[test]
    fn test_schema_items_and_enum() {
        let schema = json!({
            "type": "array",
            "items": {"type": "string", "enum": ["a", "b"]}
        });
        assert!(schema_accepts(&schema, &json!(["a", "b", "a"])));
        assert!(!schema_accepts(&schema, &json!(["a", "c"])));
        assert!(!schema_accepts(&schema, &json!("a")));
    }

    #[test]
    fn test_none_scores_but_not_counted() {
        let expectation = Expectation::None;
        assert!(expectation.score("anything"));
        assert!(!expectation.scored());
    }

    #[test]
    fn test_validate_case_limit() {
        let cases: Vec<PromptCase> = (0..51)
            .map(|i| case(&format!("case-{i}"), Expectation::None))
            .collect();
        let content = PromptPackContent { cases };
        assert!(matches!(
            content.validate(),
            Err(PromptPackError::Limit(_))
        ));
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let content = PromptPackContent {
            cases: vec![case("dup", Expectation::None), case("dup", Expectation::None)],
        };
        assert!(matches!(
            content.validate(),
            Err(PromptPackError::DuplicateCaseId { .. })
        ));
    }

    #[test]
    fn test_validate_bad_regex() {
        let content = PromptPackContent {
            cases: vec![case(
                "c1",
                Expectation::Regex {
                    pattern: "(unclosed".to_string(),
                },
            )],
        };
        assert!(matches!(
            content.validate(),
            Err(PromptPackError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_validate_bad_schema() {
        let content = PromptPackContent {
            cases: vec![case(
                "c1",
                Expectation::JsonSchema {
                    schema: json!({"type": "quantum"}),
                },
            )],
        };
        assert!(matches!(
            content.validate(),
            Err(PromptPackError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn test_validate_token_cap() {
        let content = PromptPackContent {
            cases: vec![PromptCase {
                id: "c1".to_string(),
                prompt: "p".to_string(),
                max_new_tokens: Some(512),
                expectation: Expectation::None,
            }],
        };
        assert!(matches!(content.validate(), Err(PromptPackError::Limit(_))));
    }

    #[test]
    fn test_canonical_sha_stable_across_key_order() {
        // Hashing goes through canonical JSON, so two semantically equal
        // contents produce the same digest.
        let content = PromptPackContent {
            cases: vec![case("c1", Expectation::Exact { value: "x".into() })],
        };
        let sha1 = content.canonical_sha256().unwrap();
        let sha2 = content.canonical_sha256().unwrap();
        assert_eq!(sha1, sha2);
        assert_eq!(sha1.len(), 64);
    }

    #[test]
    fn test_canonicalization_idempotent() {
        let content = PromptPackContent {
            cases: vec![case("c1", Expectation::None)],
        };
        let bytes = content.canonical_bytes().unwrap();
        let reparsed: PromptPackContent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reparsed.canonical_bytes().unwrap(), bytes);
    }
}
