//! Test specification wire types
//!
//! Instructor-authored test specs arrive as a JSON array of tagged objects.
//! A payload that is not an array is a validation error; an individual spec
//! with an unrecognized tag fails closed (a failing verdict, never silently
//! skipped).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::GradeError;

fn default_entry_point() -> String {
    "solution".into()
}

fn default_true() -> bool {
    true
}

fn default_type() -> String {
    "str".into()
}

/// One instructor-defined assertion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: TestKind,
}

impl TestSpec {
    /// Display description, defaulting to "Test N" (1-based)
    pub fn describe(&self, index: usize) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("Test {}", index + 1))
    }
}

/// Assertion variants, tagged with the wire `type` field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestKind {
    /// Call an entry point and compare its return value
    AssertFunction {
        #[serde(default = "default_entry_point")]
        function_name: String,
        /// Positional args: a JSON array, or a single scalar for one arg
        #[serde(default)]
        input: Value,
        #[serde(default)]
        expected: Value,
        /// When non-empty, membership wins over equality
        #[serde(default)]
        expected_any_of: Vec<Value>,
        /// Keyword args
        #[serde(default)]
        kwargs: serde_json::Map<String, Value>,
    },
    /// Compare the full captured stdout
    AssertOutput {
        #[serde(default)]
        expected: String,
        #[serde(default = "default_true")]
        case_sensitive: bool,
        #[serde(default = "default_true")]
        strip_whitespace: bool,
    },
    /// Captured stdout must contain a fragment
    AssertOutputContains {
        #[serde(default)]
        expected: String,
        #[serde(default = "default_true")]
        case_sensitive: bool,
    },
    /// Captured stdout must match a regex
    AssertOutputRegex {
        #[serde(default)]
        pattern: String,
        /// Flag letters: I/IGNORECASE, M, S
        #[serde(default)]
        flags: String,
    },
    /// A top-level binding must exist after the submission ran
    AssertVariableExists { variable_name: String },
    /// A top-level binding must have the given type name
    AssertVariableType {
        variable_name: String,
        #[serde(default = "default_type")]
        expected_type: String,
    },
    /// A top-level collection binding must have the given length
    AssertVariableLength {
        variable_name: String,
        #[serde(default)]
        expected_length: i64,
    },
    /// A top-level binding must equal the given value
    AssertVariableValue {
        variable_name: String,
        #[serde(default)]
        expected_value: Value,
    },
    /// Instructor-trusted boolean expression, evaluated over the
    /// submission's namespace. Never accepts learner-controlled text.
    AssertCustom {
        #[serde(default)]
        code: String,
    },
    /// Catch-all for unrecognized tags; always produces a failing verdict
    #[serde(skip)]
    Unknown { tag: String },
}

/// Parse the `test_specs` payload. A non-array payload is a validation
/// error; an item that does not deserialize becomes `Unknown`.
pub fn parse_test_specs(raw: &Value) -> Result<Vec<TestSpec>, GradeError> {
    let items = raw
        .as_array()
        .ok_or_else(|| GradeError::ParseFailure("test_specs must be a JSON array".into()))?;

    let specs = items
        .iter()
        .map(|item| {
            serde_json::from_value::<TestSpec>(item.clone()).unwrap_or_else(|_| TestSpec {
                description: item
                    .get("description")
                    .and_then(|d| d.as_str())
                    .map(|d| d.to_string()),
                kind: TestKind::Unknown {
                    tag: item
                        .get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("<missing>")
                        .to_string(),
                },
            })
        })
        .collect();

    Ok(specs)
}

/// Render a JSON value as a Python literal for probe codegen
pub fn py_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".into(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => py_str(s),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(py_literal).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Object(map) => {
            let rendered: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", py_str(k), py_literal(v)))
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
    }
}

/// Render a string as a double-quoted Python literal
pub fn py_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_assert_function() {
        let raw = json!([{
            "type": "assert_function",
            "description": "adds two numbers",
            "function_name": "add",
            "input": [2, 3],
            "expected": 5
        }]);

        let specs = parse_test_specs(&raw).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].describe(0), "adds two numbers");
        match &specs[0].kind {
            TestKind::AssertFunction {
                function_name,
                expected,
                ..
            } => {
                assert_eq!(function_name, "add");
                assert_eq!(expected, &json!(5));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_defaults_applied() {
        let raw = json!([{"type": "assert_output", "expected": "hi"}]);
        let specs = parse_test_specs(&raw).unwrap();
        match &specs[0].kind {
            TestKind::AssertOutput {
                case_sensitive,
                strip_whitespace,
                ..
            } => {
                assert!(case_sensitive);
                assert!(strip_whitespace);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_fails_closed() {
        let raw = json!([
            {"type": "assert_output", "expected": "ok"},
            {"type": "assert_quantum", "description": "future test"}
        ]);

        let specs = parse_test_specs(&raw).unwrap();
        assert_eq!(specs.len(), 2);
        match &specs[1].kind {
            TestKind::Unknown { tag } => assert_eq!(tag, "assert_quantum"),
            other => panic!("expected Unknown, got {:?}", other),
        }
        assert_eq!(specs[1].describe(1), "future test");
    }

    #[test]
    fn test_non_array_payload_is_rejected() {
        let raw = json!({"type": "assert_output"});
        let err = parse_test_specs(&raw).unwrap_err();
        assert!(matches!(err, GradeError::ParseFailure(_)));
    }

    #[test]
    fn test_missing_description_defaults_to_test_number() {
        let raw = json!([{"type": "assert_variable_exists", "variable_name": "x"}]);
        let specs = parse_test_specs(&raw).unwrap();
        assert_eq!(specs[0].describe(0), "Test 1");
    }

    #[test]
    fn test_py_literal_scalars() {
        assert_eq!(py_literal(&json!(null)), "None");
        assert_eq!(py_literal(&json!(true)), "True");
        assert_eq!(py_literal(&json!(false)), "False");
        assert_eq!(py_literal(&json!(42)), "42");
        assert_eq!(py_literal(&json!(-1.5)), "-1.5");
        assert_eq!(py_literal(&json!("hi")), "\"hi\"");
    }

    #[test]
    fn test_py_literal_collections() {
        assert_eq!(py_literal(&json!([1, "a", null])), "[1, \"a\", None]");
        assert_eq!(py_literal(&json!({"k": [true]})), "{\"k\": [True]}");
    }

    #[test]
    fn test_py_str_escapes() {
        assert_eq!(py_str("a\"b"), "\"a\\\"b\"");
        assert_eq!(py_str("line\nbreak"), "\"line\\nbreak\"");
        assert_eq!(py_str("back\\slash"), "\"back\\\\slash\"");
        assert_eq!(py_str("bell\x07"), "\"bell\\x07\"");
    }
}
