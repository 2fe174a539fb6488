//! Grading error taxonomy
//!
//! Distinguishes learner-caused rejections from infrastructure faults so the
//! pipeline can map them to different verdict statuses and log them apart.

use thiserror::Error;

/// Errors that can abort a submission before or during grading
#[derive(Debug, Error)]
pub enum GradeError {
    /// Static security screen rejected the submission; nothing was executed
    #[error("submission rejected: {0}")]
    SecurityRejected(String),

    /// Compile-only syntax check failed; nothing was executed
    #[error("syntax error: {0}")]
    SyntaxInvalid(String),

    /// Query policy validation rejected the statement
    #[error("query rejected: {0}")]
    QueryRejected(String),

    /// The submission exceeded its wall-clock budget and was killed
    #[error("execution exceeded the {0} ms time limit")]
    Timeout(u64),

    /// The isolated data instance failed to become ready
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// Probe output was missing sentinels or carried malformed verdicts
    #[error("failed to parse probe output: {0}")]
    ParseFailure(String),

    /// Any other host-side failure (spawn errors, I/O, connection faults)
    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

impl GradeError {
    /// Infrastructure faults are alerted/retried differently from
    /// learner-caused rejections even when the learner-visible verdict
    /// looks the same.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            GradeError::SandboxUnavailable(_) | GradeError::ParseFailure(_) | GradeError::Infra(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_classification() {
        assert!(GradeError::SandboxUnavailable("no docker".into()).is_infrastructure());
        assert!(GradeError::ParseFailure("missing sentinel".into()).is_infrastructure());
        assert!(!GradeError::SecurityRejected("banned import".into()).is_infrastructure());
        assert!(!GradeError::Timeout(5000).is_infrastructure());
    }

    #[test]
    fn test_display_messages() {
        let err = GradeError::Timeout(30_000);
        assert_eq!(err.to_string(), "execution exceeded the 30000 ms time limit");

        let err = GradeError::SecurityRejected("Banned import detected: os".into());
        assert_eq!(err.to_string(), "submission rejected: Banned import detected: os");
    }
}
