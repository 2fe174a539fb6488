//! Security pre-screener for script submissions
//!
//! Static, defense-in-depth policy gate applied to raw submission text
//! before anything is executed. It reduces, but does not replace, process
//! isolation: everything that passes still runs inside the sandbox runner.

use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::config::get_config;
use crate::errors::GradeError;

/// Module references rejected when they appear in import-style syntax
pub const BANNED_IMPORTS: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "eval",
    "exec",
    "compile",
    "__import__",
    "importlib",
    "open",
    "file",
    "input",
    "raw_input",
    "execfile",
    "socket",
    "urllib",
    "requests",
    "http",
    "pickle",
    "shelve",
    "marshal",
    "ctypes",
    "multiprocessing",
    "threading",
];

/// Identifier fragments rejected anywhere in the submission
pub const BANNED_KEYWORDS: &[&str] = &[
    "__builtins__",
    "__globals__",
    "__locals__",
    "__code__",
    "__dict__",
    "__class__",
    "globals()",
    "locals()",
    "vars()",
    "dir()",
    "help()",
];

/// Modules learners may import. Published for the caller's UI; the screen
/// itself only enforces the denylist.
#[allow(dead_code)]
pub const ALLOWED_IMPORTS: &[&str] = &[
    "math",
    "random",
    "datetime",
    "collections",
    "itertools",
    "functools",
    "re",
    "json",
    "statistics",
    "decimal",
    "fractions",
];

struct ImportRule {
    name: String,
    patterns: Vec<Regex>,
}

fn compile_import_rule(name: &str) -> ImportRule {
    let escaped = regex::escape(name);
    let patterns = [
        format!(r"(?i)\bimport\s+{}\b", escaped),
        format!(r"(?i)\bfrom\s+{}\b", escaped),
        format!(r#"(?i)__import__\s*\(\s*["']{}"#, escaped),
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect();

    ImportRule {
        name: name.to_string(),
        patterns,
    }
}

fn import_rules() -> &'static Vec<ImportRule> {
    static RULES: OnceLock<Vec<ImportRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        BANNED_IMPORTS
            .iter()
            .map(|name| compile_import_rule(name))
            .collect()
    })
}

/// Deployment-specific policy additions, loaded from a TOML file
#[derive(Debug, Default, Deserialize)]
pub struct PolicyOverride {
    #[serde(default)]
    pub extra_banned_imports: Vec<String>,
    #[serde(default)]
    pub extra_banned_keywords: Vec<String>,
}

struct CompiledPolicy {
    import_rules: Vec<ImportRule>,
    keywords: Vec<String>,
}

static POLICY_OVERRIDE: OnceLock<CompiledPolicy> = OnceLock::new();

/// Load additional banned imports/keywords from a TOML policy file
pub fn init_policy(path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)?;
    let raw: PolicyOverride = toml::from_str(&content)?;

    let compiled = CompiledPolicy {
        import_rules: raw
            .extra_banned_imports
            .iter()
            .map(|name| compile_import_rule(name))
            .collect(),
        keywords: raw.extra_banned_keywords,
    };

    POLICY_OVERRIDE
        .set(compiled)
        .map_err(|_| anyhow::anyhow!("Screen policy already initialized"))?;

    Ok(())
}

fn policy_override() -> Option<&'static CompiledPolicy> {
    POLICY_OVERRIDE.get()
}

fn suspicious_rules() -> &'static Vec<(Regex, &'static str)> {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"while\s+(True|1)\s*:", "Infinite loops are not allowed"),
            (
                r"for\s+\w+\s+in\s+range\s*\(\s*\d{6,}",
                "Loop range too large",
            ),
            (r"\*\*\s*\d{4,}", "Exponentiation too large"),
            (
                r"[\[\{].*[\]\}]\s*\*\s*\d{6,}",
                "Data structure too large",
            ),
        ]
        .into_iter()
        .filter_map(|(pattern, message)| Regex::new(pattern).ok().map(|re| (re, message)))
        .collect()
    })
}

/// Statically screen a script submission. Pure check, spawns nothing.
pub fn screen(code: &str) -> Result<(), GradeError> {
    if code.trim().is_empty() {
        return Err(GradeError::SecurityRejected("Code cannot be empty".into()));
    }

    let max_len = get_config().max_code_len;
    if code.len() > max_len {
        return Err(GradeError::SecurityRejected(format!(
            "Code is too long (max {} characters)",
            max_len
        )));
    }

    for rule in import_rules() {
        for pattern in &rule.patterns {
            if pattern.is_match(code) {
                return Err(GradeError::SecurityRejected(format!(
                    "Banned import detected: {}",
                    rule.name
                )));
            }
        }
    }

    for keyword in BANNED_KEYWORDS {
        if code.contains(keyword) {
            return Err(GradeError::SecurityRejected(format!(
                "Banned keyword detected: {}",
                keyword
            )));
        }
    }

    for (pattern, message) in suspicious_rules() {
        if pattern.is_match(code) {
            return Err(GradeError::SecurityRejected((*message).to_string()));
        }
    }

    if let Some(policy) = policy_override() {
        for rule in &policy.import_rules {
            for pattern in &rule.patterns {
                if pattern.is_match(code) {
                    return Err(GradeError::SecurityRejected(format!(
                        "Banned import detected: {}",
                        rule.name
                    )));
                }
            }
        }
        for keyword in &policy.keywords {
            if code.contains(keyword) {
                return Err(GradeError::SecurityRejected(format!(
                    "Banned keyword detected: {}",
                    keyword
                )));
            }
        }
    }

    Ok(())
}

/// Compile-only syntax check: parses the submission with the interpreter's
/// `ast` module, never executing it. Rejects before a probe is synthesized.
const SYNTAX_CHECK_PROGRAM: &str = "\
import ast, sys
try:
    ast.parse(sys.stdin.read())
except SyntaxError as e:
    sys.stderr.write('line %s: %s' % (e.lineno, e.msg))
    sys.exit(1)
";

pub async fn check_syntax(code: &str) -> Result<(), GradeError> {
    let config = get_config();

    let mut child = Command::new(&config.python_bin)
        .arg("-I")
        .arg("-c")
        .arg(SYNTAX_CHECK_PROGRAM)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            GradeError::SandboxUnavailable(format!(
                "failed to spawn {} for syntax check: {}",
                config.python_bin, e
            ))
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(code.as_bytes())
            .await
            .map_err(|e| GradeError::SandboxUnavailable(format!("syntax check stdin: {}", e)))?;
    }

    let budget = Duration::from_millis(config.syntax_check_timeout_ms);
    let output = match timeout(budget, child.wait_with_output()).await {
        Ok(result) => result
            .map_err(|e| GradeError::SandboxUnavailable(format!("syntax check wait: {}", e)))?,
        Err(_) => {
            // Kill handled by kill_on_drop; a parse that refuses to finish
            // is treated as a rejected submission, not an infra fault.
            return Err(GradeError::SyntaxInvalid("syntax check timed out".into()));
        }
    };

    if output.status.success() {
        debug!("Syntax check passed ({} bytes)", code.len());
        Ok(())
    } else {
        let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(GradeError::SyntaxInvalid(if message.is_empty() {
            "invalid syntax".into()
        } else {
            message
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_code() {
        assert!(screen("def add(a, b):\n    return a + b\n").is_ok());
    }

    #[test]
    fn test_rejects_empty_code() {
        let err = screen("   \n  ").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_rejects_oversized_code() {
        let big = "x = 1\n".repeat(3000);
        let err = screen(&big).unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn test_rejects_every_banned_import() {
        for name in BANNED_IMPORTS {
            let code = format!("import {}\n", name);
            assert!(screen(&code).is_err(), "import {} slipped through", name);

            let code = format!("from {} import x\n", name);
            assert!(screen(&code).is_err(), "from {} slipped through", name);
        }
    }

    #[test]
    fn test_rejects_dunder_import_call() {
        let err = screen("m = __import__(\"socket\")\n").unwrap_err();
        assert!(matches!(err, GradeError::SecurityRejected(_)));
    }

    #[test]
    fn test_import_match_is_case_insensitive() {
        assert!(screen("IMPORT OS\n").is_err());
    }

    #[test]
    fn test_allows_whitelisted_import() {
        assert!(screen("import math\nprint(math.pi)\n").is_ok());
        assert!(screen("from collections import Counter\n").is_ok());
    }

    #[test]
    fn test_rejects_banned_keywords() {
        assert!(screen("print(__builtins__)").is_err());
        assert!(screen("x.__class__.__bases__").is_err());
        assert!(screen("g = globals()").is_err());
    }

    #[test]
    fn test_rejects_infinite_loop() {
        let err = screen("while True:\n    pass\n").unwrap_err();
        assert!(err.to_string().contains("Infinite loops"));
        assert!(screen("while 1:\n    pass\n").is_err());
    }

    #[test]
    fn test_rejects_huge_range() {
        assert!(screen("for i in range(1000000):\n    pass\n").is_err());
        assert!(screen("for i in range(100):\n    pass\n").is_ok());
    }

    #[test]
    fn test_rejects_huge_exponent() {
        assert!(screen("x = 2 ** 99999\n").is_err());
        assert!(screen("x = 2 ** 10\n").is_ok());
    }

    #[test]
    fn test_rejects_huge_repeated_literal() {
        assert!(screen("data = [0] * 10000000\n").is_err());
        assert!(screen("data = [0] * 10\n").is_ok());
    }

    #[test]
    fn test_policy_override_extends_the_denylist() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
extra_banned_imports = ["numpy"]
extra_banned_keywords = ["breakpoint()"]
"#
        )
        .unwrap();

        init_policy(file.path().to_str().unwrap()).unwrap();

        assert!(screen("import numpy\n").is_err());
        assert!(screen("breakpoint()\n").is_err());
        // Built-in policy still applies
        assert!(screen("import json\n").is_ok());
    }

    #[tokio::test]
    async fn test_syntax_check_accepts_valid_code() {
        if check_syntax("x = 1\n").await.is_err() {
            // Interpreter not installed in this environment; nothing to assert
            return;
        }
        assert!(check_syntax("def f():\n    return 42\n").await.is_ok());
    }

    #[tokio::test]
    async fn test_syntax_check_rejects_invalid_code() {
        match check_syntax("def f(:\n").await {
            Err(GradeError::SyntaxInvalid(msg)) => assert!(!msg.is_empty()),
            Err(GradeError::SandboxUnavailable(_)) => {} // no interpreter here
            other => panic!("expected syntax rejection, got {:?}", other),
        }
    }
}
