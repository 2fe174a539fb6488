//! Test harness synthesizer
//!
//! Turns a screened script submission plus its test specs into one
//! executable probe unit. The learner's code is embedded as a string
//! literal and executed into an isolated namespace dict; assertion blocks
//! read from that dict and never share scope with the submission, so
//! learner code cannot rebind grading internals or forge the verdict
//! channel. Synthesis is deterministic: identical inputs yield a
//! byte-identical probe.

use std::fmt::Write;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::testspec::{py_literal, py_str, TestKind, TestSpec};

/// Sentinel marker pair delimiting learner output and the verdict array
#[derive(Debug, Clone, PartialEq)]
pub struct Sentinels {
    pub user_output: String,
    pub test_results: String,
}

impl Sentinels {
    /// Derive sentinels from the submission content. The suffix is a
    /// SHA-256 prefix of the inputs: deterministic for caching, yet not a
    /// string ordinary learner prints can produce.
    pub fn derive(code: &str, specs: &[TestSpec]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(code.as_bytes());
        hasher.update([0u8]);
        if let Ok(serialized) = serde_json::to_string(specs) {
            hasher.update(serialized.as_bytes());
        }
        let suffix = hex::encode(&hasher.finalize()[..8]);

        Self {
            user_output: format!("<<<USER_OUTPUT:{}>>>", suffix),
            test_results: format!("<<<TEST_RESULTS:{}>>>", suffix),
        }
    }
}

/// A synthesized probe unit ready for the sandbox runner
#[derive(Debug, Clone)]
pub struct ProbeUnit {
    pub source: String,
    pub sentinels: Sentinels,
}

/// Synthesize the executable probe for a script submission
pub fn synthesize(code: &str, specs: &[TestSpec]) -> ProbeUnit {
    let sentinels = Sentinels::derive(code, specs);
    let mut out = String::with_capacity(code.len() + 4096);

    // Header: capture stdout before the submission can run, then execute
    // the submission into its own namespace.
    out.push_str("import io as _pj_io\n");
    out.push_str("import json as _pj_json\n");
    out.push_str("import re as _pj_re\n");
    out.push_str("import sys as _pj_sys\n");
    out.push('\n');
    out.push_str("_pj_stdout = _pj_sys.stdout\n");
    out.push_str("_pj_buffer = _pj_io.StringIO()\n");
    out.push_str("_pj_sys.stdout = _pj_buffer\n");
    out.push('\n');
    out.push_str("_pj_results = []\n");
    out.push_str("_pj_ns = {}\n");
    let _ = writeln!(out, "_pj_source = {}", py_str(code));
    out.push('\n');
    out.push_str("try:\n");
    out.push_str("    exec(compile(_pj_source, \"<submission>\", \"exec\"), _pj_ns)\n");
    out.push_str("except BaseException as _pj_exc:\n");
    out.push_str(
        "    _pj_sys.stderr.write(\"%s: %s\" % (type(_pj_exc).__name__, _pj_exc))\n",
    );
    out.push('\n');

    for (index, spec) in specs.iter().enumerate() {
        let number = index + 1;
        let description = py_str(&spec.describe(index));

        let _ = writeln!(out, "# Test {}", number);
        out.push_str("try:\n");
        emit_assertion(&mut out, &spec.kind);
        let _ = writeln!(
            out,
            "    _pj_results.append({{\"test_number\": {}, \"description\": {}, \"passed\": bool(_pj_passed), \"expected\": _pj_expected, \"actual\": _pj_actual, \"error\": None}})",
            number, description
        );
        out.push_str("except Exception as _pj_exc:\n");
        let _ = writeln!(
            out,
            "    _pj_results.append({{\"test_number\": {}, \"description\": {}, \"passed\": False, \"expected\": \"Test should not raise exception\", \"actual\": None, \"error\": str(_pj_exc)}})",
            number, description
        );
        out.push('\n');
    }

    // Trailer: restore stdout, then emit the sentinel-delimited payloads.
    out.push_str("_pj_sys.stdout = _pj_stdout\n");
    let _ = writeln!(out, "print({})", py_str(&sentinels.user_output));
    out.push_str("print(_pj_buffer.getvalue())\n");
    let _ = writeln!(out, "print({})", py_str(&sentinels.test_results));
    out.push_str("print(_pj_json.dumps(_pj_results, default=str))\n");

    ProbeUnit {
        source: out,
        sentinels,
    }
}

fn emit_assertion(out: &mut String, kind: &TestKind) {
    match kind {
        TestKind::AssertFunction {
            function_name,
            input,
            expected,
            expected_any_of,
            kwargs,
        } => {
            let name = py_str(function_name);
            let call_args = render_call_args(input, kwargs);
            let _ = writeln!(out, "    _pj_fn = _pj_ns.get({})", name);
            out.push_str("    if not callable(_pj_fn):\n");
            out.push_str("        _pj_passed = False\n");
            if expected_any_of.is_empty() {
                let _ = writeln!(out, "        _pj_expected = {}", py_literal(expected));
            } else {
                let any_of = Value::Array(expected_any_of.clone());
                let _ = writeln!(out, "        _pj_expected = {}", py_literal(&any_of));
            }
            let _ = writeln!(
                out,
                "        _pj_actual = \"Function {} is not defined\"",
                function_name.replace('"', "")
            );
            out.push_str("    else:\n");
            let _ = writeln!(out, "        _pj_actual = _pj_fn({})", call_args);
            if expected_any_of.is_empty() {
                let _ = writeln!(out, "        _pj_expected = {}", py_literal(expected));
                out.push_str("        _pj_passed = _pj_actual == _pj_expected\n");
            } else {
                let any_of = Value::Array(expected_any_of.clone());
                let _ = writeln!(out, "        _pj_expected = {}", py_literal(&any_of));
                out.push_str("        _pj_passed = _pj_actual in _pj_expected\n");
            }
        }
        TestKind::AssertOutput {
            expected,
            case_sensitive,
            strip_whitespace,
        } => {
            out.push_str("    _pj_actual = _pj_buffer.getvalue()\n");
            let _ = writeln!(out, "    _pj_expected = {}", py_str(expected));
            if *strip_whitespace {
                out.push_str("    _pj_actual = _pj_actual.strip()\n");
                out.push_str("    _pj_expected = _pj_expected.strip()\n");
            }
            if *case_sensitive {
                out.push_str("    _pj_passed = _pj_actual == _pj_expected\n");
            } else {
                out.push_str("    _pj_passed = _pj_actual.lower() == _pj_expected.lower()\n");
            }
        }
        TestKind::AssertOutputContains {
            expected,
            case_sensitive,
        } => {
            out.push_str("    _pj_actual = _pj_buffer.getvalue()\n");
            let _ = writeln!(out, "    _pj_expected = {}", py_str(expected));
            if *case_sensitive {
                out.push_str("    _pj_passed = _pj_expected in _pj_actual\n");
            } else {
                out.push_str("    _pj_passed = _pj_expected.lower() in _pj_actual.lower()\n");
            }
        }
        TestKind::AssertOutputRegex { pattern, flags } => {
            out.push_str("    _pj_actual = _pj_buffer.getvalue().strip()\n");
            let _ = writeln!(
                out,
                "    _pj_passed = bool(_pj_re.match({}, _pj_actual, {}))",
                py_str(pattern),
                render_regex_flags(flags)
            );
            let _ = writeln!(
                out,
                "    _pj_expected = {}",
                py_str(&format!("matches pattern: {}", pattern))
            );
        }
        TestKind::AssertVariableExists { variable_name } => {
            let name = py_str(variable_name);
            let _ = writeln!(out, "    _pj_passed = {} in _pj_ns", name);
            let _ = writeln!(
                out,
                "    _pj_expected = {}",
                py_str(&format!("Variable {} exists", variable_name))
            );
            let _ = writeln!(
                out,
                "    _pj_actual = \"Variable \" + {} + (\" exists\" if _pj_passed else \" not found\")",
                name
            );
        }
        TestKind::AssertVariableType {
            variable_name,
            expected_type,
        } => {
            let name = py_str(variable_name);
            let _ = writeln!(out, "    if {} in _pj_ns:", name);
            let _ = writeln!(
                out,
                "        _pj_actual = type(_pj_ns[{}]).__name__",
                name
            );
            let _ = writeln!(out, "        _pj_expected = {}", py_str(expected_type));
            out.push_str("        _pj_passed = _pj_actual == _pj_expected\n");
            out.push_str("    else:\n");
            out.push_str("        _pj_passed = False\n");
            let _ = writeln!(out, "        _pj_expected = {}", py_str(expected_type));
            let _ = writeln!(
                out,
                "        _pj_actual = {}",
                py_str(&format!("Variable {} not found", variable_name))
            );
        }
        TestKind::AssertVariableLength {
            variable_name,
            expected_length,
        } => {
            let name = py_str(variable_name);
            let _ = writeln!(out, "    if {} in _pj_ns:", name);
            let _ = writeln!(out, "        _pj_actual = len(_pj_ns[{}])", name);
            let _ = writeln!(out, "        _pj_expected = {}", expected_length);
            out.push_str("        _pj_passed = _pj_actual == _pj_expected\n");
            out.push_str("    else:\n");
            out.push_str("        _pj_passed = False\n");
            let _ = writeln!(out, "        _pj_expected = {}", expected_length);
            let _ = writeln!(
                out,
                "        _pj_actual = {}",
                py_str(&format!("Variable {} not found", variable_name))
            );
        }
        TestKind::AssertVariableValue {
            variable_name,
            expected_value,
        } => {
            let name = py_str(variable_name);
            let _ = writeln!(out, "    if {} in _pj_ns:", name);
            let _ = writeln!(out, "        _pj_actual = _pj_ns[{}]", name);
            let _ = writeln!(out, "        _pj_expected = {}", py_literal(expected_value));
            out.push_str("        _pj_passed = _pj_actual == _pj_expected\n");
            out.push_str("    else:\n");
            out.push_str("        _pj_passed = False\n");
            let _ = writeln!(out, "        _pj_expected = {}", py_literal(expected_value));
            let _ = writeln!(
                out,
                "        _pj_actual = {}",
                py_str(&format!("Variable {} not found", variable_name))
            );
        }
        TestKind::AssertCustom { code } => {
            // Instructor-trusted expression. Evaluated inside a copy of the
            // submission namespace so it can read learner bindings but not
            // mutate grading state. If the authoring path ever stops being
            // admin-only, this text must go through the screener too.
            let _ = writeln!(
                out,
                "    _pj_passed = bool(eval({}, dict(_pj_ns)))",
                py_str(code)
            );
            out.push_str("    _pj_expected = \"Custom validation passed\"\n");
            out.push_str(
                "    _pj_actual = \"Custom validation \" + (\"passed\" if _pj_passed else \"failed\")\n",
            );
        }
        TestKind::Unknown { tag } => {
            out.push_str("    _pj_passed = False\n");
            let _ = writeln!(
                out,
                "    _pj_expected = {}",
                py_str(&format!("Unknown test type: {}", tag))
            );
            out.push_str("    _pj_actual = \"Error\"\n");
        }
    }
}

/// Render positional + keyword args for an entry-point call
fn render_call_args(input: &Value, kwargs: &serde_json::Map<String, Value>) -> String {
    let mut parts: Vec<String> = match input {
        Value::Null => vec![],
        Value::Array(items) => items.iter().map(py_literal).collect(),
        scalar => vec![py_literal(scalar)],
    };

    for (name, value) in kwargs {
        parts.push(format!("{}={}", name, py_literal(value)));
    }

    parts.join(", ")
}

/// Translate flag letters/words into a Python `re` flags expression
fn render_regex_flags(flags: &str) -> String {
    let upper = flags.to_uppercase();
    let tokens: Vec<&str> = upper
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|t| !t.is_empty())
        .collect();

    let mut parts = Vec::new();
    for token in tokens {
        match token {
            "I" | "IGNORECASE" => parts.push("_pj_re.IGNORECASE"),
            "M" | "MULTILINE" => parts.push("_pj_re.MULTILINE"),
            "S" | "DOTALL" => parts.push("_pj_re.DOTALL"),
            _ => {}
        }
    }
    parts.dedup();

    if parts.is_empty() {
        "0".into()
    } else {
        parts.join(" | ")
    }
}
