//! Verdict types shared across the grading pipeline
//!
//! A submission always resolves to a structured `ExecutionResult`; learners
//! never see a raw stack trace from the host process.

use serde::{Deserialize, Serialize};

/// Overall status of a graded submission
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Passed,
    Failed,
    Error,
    Timeout,
    SecurityRejected,
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubmissionStatus::Passed => "passed",
            SubmissionStatus::Failed => "failed",
            SubmissionStatus::Error => "error",
            SubmissionStatus::Timeout => "timeout",
            SubmissionStatus::SecurityRejected => "security_rejected",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one instructor-defined test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestVerdict {
    pub test_number: usize,
    pub description: String,
    pub passed: bool,
    /// Opaque display value of what the test expected
    #[serde(default)]
    pub expected: serde_json::Value,
    /// Opaque display value of what the submission produced
    #[serde(default)]
    pub actual: serde_json::Value,
    /// Error message when the test block itself raised
    #[serde(default)]
    pub error: Option<String>,
}

/// Result of grading one submission, produced once and never mutated
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub submission_id: i64,
    pub status: SubmissionStatus,
    /// Learner-visible stdout, sanitized
    pub captured_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub per_test: Vec<TestVerdict>,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub wall_time_ms: u64,
}

impl ExecutionResult {
    /// Verdict for a submission rejected before any execution
    pub fn rejected(submission_id: i64, reason: impl Into<String>) -> Self {
        Self {
            submission_id,
            status: SubmissionStatus::SecurityRejected,
            captured_output: String::new(),
            error_message: Some(reason.into()),
            per_test: vec![],
            tests_passed: 0,
            tests_failed: 0,
            wall_time_ms: 0,
        }
    }

    /// Verdict for a submission killed on its time budget. Partial per-test
    /// results are discarded, never reported as passed.
    pub fn timed_out(submission_id: i64, budget_ms: u64) -> Self {
        Self {
            submission_id,
            status: SubmissionStatus::Timeout,
            captured_output: String::new(),
            error_message: Some(format!(
                "Code execution exceeded the {} ms time limit",
                budget_ms
            )),
            per_test: vec![],
            tests_passed: 0,
            tests_failed: 0,
            wall_time_ms: budget_ms,
        }
    }

    /// Verdict for a session operation that succeeded without per-test
    /// grading (schema inspection, reset, ungraded query runs)
    pub fn completed(submission_id: i64, captured_output: impl Into<String>) -> Self {
        Self {
            submission_id,
            status: SubmissionStatus::Passed,
            captured_output: captured_output.into(),
            error_message: None,
            per_test: vec![],
            tests_passed: 0,
            tests_failed: 0,
            wall_time_ms: 0,
        }
    }

    /// Verdict for an infrastructure or parse failure. The learner sees a
    /// generic message; the cause goes to the logs.
    pub fn errored(submission_id: i64, message: impl Into<String>) -> Self {
        Self {
            submission_id,
            status: SubmissionStatus::Error,
            captured_output: String::new(),
            error_message: Some(message.into()),
            per_test: vec![],
            tests_passed: 0,
            tests_failed: 0,
            wall_time_ms: 0,
        }
    }
}

/// Maximum learner-visible output length before truncation
pub const MAX_OUTPUT_LEN: usize = 5000;

/// Truncate and scrub captured output before it leaves the worker
pub fn sanitize_output(output: &str) -> String {
    let cleaned: String = output.chars().filter(|c| *c != '\0').collect();

    if cleaned.len() > MAX_OUTPUT_LEN {
        let mut end = MAX_OUTPUT_LEN;
        while !cleaned.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}\n\n... (output truncated)", &cleaned[..end])
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(SubmissionStatus::Passed.to_string(), "passed");
        assert_eq!(
            SubmissionStatus::SecurityRejected.to_string(),
            "security_rejected"
        );
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SubmissionStatus::SecurityRejected).unwrap();
        assert_eq!(json, "\"security_rejected\"");
    }

    #[test]
    fn test_sanitize_truncates_long_output() {
        let long = "x".repeat(MAX_OUTPUT_LEN + 100);
        let sanitized = sanitize_output(&long);
        assert!(sanitized.ends_with("... (output truncated)"));
        assert!(sanitized.len() < long.len());
    }

    #[test]
    fn test_sanitize_strips_nul_bytes() {
        assert_eq!(sanitize_output("a\0b\0c"), "abc");
    }

    #[test]
    fn test_sanitize_leaves_short_output_alone() {
        assert_eq!(sanitize_output("hello\nworld"), "hello\nworld");
    }

    #[test]
    fn test_timeout_verdict_has_no_partial_results() {
        let result = ExecutionResult::timed_out(7, 30_000);
        assert_eq!(result.status, SubmissionStatus::Timeout);
        assert!(result.per_test.is_empty());
        assert_eq!(result.tests_passed, 0);
    }
}
