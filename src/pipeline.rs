//! Submission pipeline
//!
//! Orchestrates validate -> (synthesize/route) -> execute -> compare ->
//! verdict for both submission kinds. Security, policy, and syntax failures
//! short-circuit before any resource is spent; infrastructure faults are
//! logged distinctly from learner-caused failures but surface to the
//! learner as a generic "could not be evaluated" verdict.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::get_config;
use crate::errors::GradeError;
use crate::harness;
use crate::protocol::parse_probe_output;
use crate::runner::{ProbeRunner, RunLimits};
use crate::screener;
use crate::sqlbox::{InstanceBackend, InstanceManager, SessionKey};
use crate::sqlexec::{self, ExpectedResultSet, QueryOutcome};
use crate::sqlguard;
use crate::testspec::parse_test_specs;
use crate::verdict::{sanitize_output, ExecutionResult, SubmissionStatus, TestVerdict};

const GENERIC_FAILURE: &str = "Your submission could not be evaluated. Please try again.";

/// A script-kind submission as received from the web layer
#[derive(Debug, Serialize, Deserialize)]
pub struct ScriptSubmission {
    pub submission_id: i64,
    pub author_id: i64,
    pub content: String,
    /// JSON array of tagged test specs; validated by the pipeline
    pub test_specs: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_budget_ms: Option<u64>,
}

/// A query-kind submission. Both mode flags default to the most
/// restrictive setting.
#[derive(Debug, Serialize, Deserialize)]
pub struct QuerySubmission {
    pub submission_id: i64,
    pub author_id: i64,
    pub session_id: String,
    pub content: String,
    #[serde(default = "default_read_only")]
    pub read_only: bool,
    #[serde(default)]
    pub allow_destructive_delete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_result: Option<ExpectedResultSet>,
}

fn default_read_only() -> bool {
    true
}

/// A session-scoped request that carries no statement: schema inspection or
/// a reset of the session's instance
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionRequest {
    pub submission_id: i64,
    pub author_id: i64,
    pub session_id: String,
}

/// The grading pipeline: one instance per worker, shared across jobs
pub struct Pipeline<R: ProbeRunner, B: InstanceBackend> {
    runner: R,
    instances: InstanceManager<B>,
}

impl<R: ProbeRunner, B: InstanceBackend> Pipeline<R, B> {
    pub fn new(runner: R, instances: InstanceManager<B>) -> Self {
        Self { runner, instances }
    }

    /// The instance registry, shared with the background sweep task
    pub fn instances(&self) -> &InstanceManager<B> {
        &self.instances
    }

    /// Grade a script submission: screen -> syntax check -> synthesize ->
    /// run -> parse -> score.
    pub async fn grade_script(&self, job: &ScriptSubmission) -> ExecutionResult {
        let started = Instant::now();
        let config = get_config();
        let budget_ms = job.time_budget_ms.unwrap_or(config.default_time_budget_ms);

        if let Err(e) = screener::screen(&job.content) {
            info!("Submission {} screened out: {}", job.submission_id, e);
            return finish(ExecutionResult::rejected(job.submission_id, e.to_string()), started);
        }

        let specs = match parse_test_specs(&job.test_specs) {
            Ok(specs) => specs,
            Err(e) => {
                warn!(
                    "Submission {} carried malformed test specs: {}",
                    job.submission_id, e
                );
                return finish(
                    ExecutionResult::errored(job.submission_id, "Invalid test specifications"),
                    started,
                );
            }
        };

        match screener::check_syntax(&job.content).await {
            Ok(()) => {}
            Err(GradeError::SyntaxInvalid(message)) => {
                info!(
                    "Submission {} failed syntax check: {}",
                    job.submission_id, message
                );
                return finish(
                    ExecutionResult::errored(
                        job.submission_id,
                        format!("Syntax error: {}", message),
                    ),
                    started,
                );
            }
            Err(e) => {
                error!(
                    "Infrastructure fault during syntax check for {}: {}",
                    job.submission_id, e
                );
                return finish(
                    ExecutionResult::errored(job.submission_id, GENERIC_FAILURE),
                    started,
                );
            }
        }

        let probe = harness::synthesize(&job.content, &specs);
        let limits = RunLimits::new(Duration::from_millis(budget_ms));

        let outcome = match self.runner.run(&probe.source, &limits).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    "Failed to run probe for submission {}: {:#}",
                    job.submission_id, e
                );
                return finish(
                    ExecutionResult::errored(job.submission_id, GENERIC_FAILURE),
                    started,
                );
            }
        };

        if outcome.status.is_timeout() {
            info!(
                "Submission {} exceeded its {} ms budget",
                job.submission_id, budget_ms
            );
            return finish(ExecutionResult::timed_out(job.submission_id, budget_ms), started);
        }

        // A non-zero exit alone is not fatal: trust the sentinels if the
        // probe produced them.
        let parsed = match parse_probe_output(&outcome.stdout, &probe.sentinels) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Infrastructure-class faults alert differently from
                // learner-caused ones even when the verdict looks the same
                if e.is_infrastructure() {
                    error!(
                        "Probe output unparsable for submission {} (exit {}): {}",
                        job.submission_id,
                        outcome.exit_code(),
                        e
                    );
                } else {
                    warn!("Probe output rejected for submission {}: {}", job.submission_id, e);
                }
                return finish(
                    ExecutionResult::errored(job.submission_id, GENERIC_FAILURE),
                    started,
                );
            }
        };

        let tests_passed = parsed.verdicts.iter().filter(|v| v.passed).count();
        let tests_failed = parsed.verdicts.len() - tests_passed;

        let mut status = if tests_failed == 0 && tests_passed > 0 {
            SubmissionStatus::Passed
        } else {
            SubmissionStatus::Failed
        };

        // A "passing" run that still wrote to stderr is suspect
        let stderr = outcome.stderr.trim();
        let mut error_message = None;
        if !stderr.is_empty() {
            error_message = Some(sanitize_output(stderr));
            if status == SubmissionStatus::Passed {
                status = SubmissionStatus::Error;
            }
        }

        info!(
            "Submission {} graded: status={}, passed={}/{}, time={}ms",
            job.submission_id,
            status,
            tests_passed,
            parsed.verdicts.len(),
            outcome.time_ms
        );

        finish(
            ExecutionResult {
                submission_id: job.submission_id,
                status,
                captured_output: sanitize_output(&parsed.user_output),
                error_message,
                per_test: parsed.verdicts,
                tests_passed,
                tests_failed,
                wall_time_ms: 0,
            },
            started,
        )
    }

    /// Grade a query submission: policy-validate -> ensure instance ->
    /// execute -> compare.
    pub async fn grade_query(&self, job: &QuerySubmission) -> ExecutionResult {
        let started = Instant::now();
        let config = get_config();

        let validated = match sqlguard::validate(
            &job.content,
            job.read_only,
            job.allow_destructive_delete,
        ) {
            Ok(validated) => validated,
            Err(e) => {
                info!("Query {} rejected by policy: {}", job.submission_id, e);
                return finish(ExecutionResult::rejected(job.submission_id, e.to_string()), started);
            }
        };

        for warning in &validated.warnings {
            warn!("Query {}: {}", job.submission_id, warning);
        }
        let tables = sqlguard::extract_tables(&validated.normalized);
        if !tables.is_empty() {
            info!("Query {} touches tables: {:?}", job.submission_id, tables);
        }

        let key = SessionKey::new(job.author_id, job.session_id.clone());
        let handle = match self.instances.ensure(&key).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(
                    "Instance unavailable for query {} (session {}): {}",
                    job.submission_id, key, e
                );
                return finish(
                    ExecutionResult::errored(
                        job.submission_id,
                        "The practice database could not be prepared. Please try again.",
                    ),
                    started,
                );
            }
        };

        self.instances.mark_busy(&key).await;
        let executed = sqlexec::execute(
            &handle,
            &validated.normalized,
            Duration::from_millis(config.sql_statement_timeout_ms),
        )
        .await;
        self.instances.mark_ready(&key).await;

        let result_set = match executed {
            Ok(QueryOutcome::Ok(result_set)) => result_set,
            Ok(QueryOutcome::SqlError(message)) => {
                let verdict = TestVerdict {
                    test_number: 1,
                    description: "Query executes successfully".into(),
                    passed: false,
                    expected: serde_json::Value::Null,
                    actual: serde_json::Value::Null,
                    error: Some(message.clone()),
                };
                return finish(
                    ExecutionResult {
                        submission_id: job.submission_id,
                        status: SubmissionStatus::Failed,
                        captured_output: String::new(),
                        error_message: Some(sanitize_output(&message)),
                        per_test: vec![verdict],
                        tests_passed: 0,
                        tests_failed: 1,
                        wall_time_ms: 0,
                    },
                    started,
                );
            }
            Err(GradeError::Timeout(budget_ms)) => {
                info!("Query {} exceeded its statement budget", job.submission_id);
                return finish(ExecutionResult::timed_out(job.submission_id, budget_ms), started);
            }
            Err(e) => {
                error!("Query {} infrastructure fault: {}", job.submission_id, e);
                return finish(
                    ExecutionResult::errored(job.submission_id, GENERIC_FAILURE),
                    started,
                );
            }
        };

        let captured_output = serde_json::to_string(&result_set).unwrap_or_default();

        let result = match &job.expected_result {
            Some(expected) => {
                let comparison = sqlexec::compare(&result_set, expected);
                let verdict = TestVerdict {
                    test_number: 1,
                    description: comparison.feedback.clone(),
                    passed: comparison.matches,
                    expected: serde_json::json!(format!("{} rows", expected.rows.len())),
                    actual: serde_json::json!(format!("{} rows", result_set.row_count)),
                    error: None,
                };
                ExecutionResult {
                    submission_id: job.submission_id,
                    status: if comparison.matches {
                        SubmissionStatus::Passed
                    } else {
                        SubmissionStatus::Failed
                    },
                    captured_output: sanitize_output(&captured_output),
                    error_message: None,
                    tests_passed: comparison.matches as usize,
                    tests_failed: !comparison.matches as usize,
                    per_test: vec![verdict],
                    wall_time_ms: 0,
                }
            }
            None => {
                ExecutionResult::completed(job.submission_id, sanitize_output(&captured_output))
            }
        };

        info!(
            "Query {} graded: status={}, rows={}",
            job.submission_id, result.status, result_set.row_count
        );

        finish(result, started)
    }

    /// Describe the session's tables for the practice UI
    pub async fn schema(&self, job: &SessionRequest) -> ExecutionResult {
        let started = Instant::now();
        let config = get_config();
        let key = SessionKey::new(job.author_id, job.session_id.clone());

        let handle = match self.instances.ensure(&key).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Instance unavailable for schema request {}: {}", job.submission_id, e);
                return finish(
                    ExecutionResult::errored(
                        job.submission_id,
                        "The practice database could not be prepared. Please try again.",
                    ),
                    started,
                );
            }
        };

        let summary = match sqlexec::schema_summary(
            &handle,
            Duration::from_millis(config.sql_statement_timeout_ms),
        )
        .await
        {
            Ok(summary) => summary,
            Err(e) => {
                error!("Schema request {} failed: {}", job.submission_id, e);
                return finish(
                    ExecutionResult::errored(job.submission_id, GENERIC_FAILURE),
                    started,
                );
            }
        };

        finish(
            ExecutionResult::completed(
                job.submission_id,
                serde_json::to_string(&summary).unwrap_or_default(),
            ),
            started,
        )
    }

    /// Restart the session's instance, restoring initial schema and data
    pub async fn reset_session(&self, job: &SessionRequest) -> ExecutionResult {
        let started = Instant::now();
        let key = SessionKey::new(job.author_id, job.session_id.clone());

        match self.instances.reset(&key).await {
            Ok(_) => {
                info!("Session {} reset for request {}", key, job.submission_id);
                finish(
                    ExecutionResult::completed(
                        job.submission_id,
                        "Database reset to initial state.",
                    ),
                    started,
                )
            }
            Err(e) => {
                error!("Reset failed for session {}: {}", key, e);
                finish(
                    ExecutionResult::errored(
                        job.submission_id,
                        "The practice database could not be reset. Please try again.",
                    ),
                    started,
                )
            }
        }
    }
}

fn finish(mut result: ExecutionResult, started: Instant) -> ExecutionResult {
    result.wall_time_ms = started.elapsed().as_millis() as u64;
    result
}
