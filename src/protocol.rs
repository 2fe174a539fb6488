//! Probe output protocol
//!
//! A probe prints two sentinel lines delimiting the captured learner output
//! and the serialized verdict array. Parsing is defensive: missing markers
//! or a malformed payload become `ParseFailure`, never a false pass.

use crate::errors::GradeError;
use crate::harness::Sentinels;
use crate::verdict::TestVerdict;

/// Learner-visible output plus per-test verdicts recovered from a probe run
#[derive(Debug)]
pub struct ParsedProbeOutput {
    pub user_output: String,
    pub verdicts: Vec<TestVerdict>,
}

/// Split raw probe stdout on the sentinel pair. Anything printed before the
/// first sentinel (a stray harness-level message) is discarded.
pub fn parse_probe_output(
    stdout: &str,
    sentinels: &Sentinels,
) -> Result<ParsedProbeOutput, GradeError> {
    let after_first = stdout
        .split_once(&sentinels.user_output)
        .map(|(_, rest)| rest)
        .ok_or_else(|| GradeError::ParseFailure("no test results found".into()))?;

    let (user_output, verdict_payload) = after_first
        .split_once(&sentinels.test_results)
        .ok_or_else(|| GradeError::ParseFailure("verdict marker missing".into()))?;

    let verdicts: Vec<TestVerdict> = serde_json::from_str(verdict_payload.trim())
        .map_err(|e| GradeError::ParseFailure(format!("malformed verdict payload: {}", e)))?;

    Ok(ParsedProbeOutput {
        user_output: trim_marker_newlines(user_output).to_string(),
        verdicts,
    })
}

/// The sentinel `print` calls contribute one newline on each side of the
/// learner output; remove those without disturbing interior whitespace.
fn trim_marker_newlines(s: &str) -> &str {
    let s = s.strip_prefix('\n').unwrap_or(s);
    let s = s.strip_suffix('\n').unwrap_or(s);
    s.strip_suffix('\n').unwrap_or(s) // buffer.getvalue() print adds its own
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testspec::parse_test_specs;
    use serde_json::json;

    fn sentinels() -> Sentinels {
        let specs = parse_test_specs(&json!([])).unwrap();
        Sentinels::derive("print('hi')", &specs)
    }

    #[test]
    fn test_parses_well_formed_output() {
        let s = sentinels();
        let stdout = format!(
            "{}\nhello\n\n{}\n[{{\"test_number\": 1, \"description\": \"t\", \"passed\": true, \"expected\": 5, \"actual\": 5, \"error\": null}}]\n",
            s.user_output, s.test_results
        );

        let parsed = parse_probe_output(&stdout, &s).unwrap();
        assert_eq!(parsed.user_output, "hello");
        assert_eq!(parsed.verdicts.len(), 1);
        assert!(parsed.verdicts[0].passed);
        assert_eq!(parsed.verdicts[0].expected, json!(5));
    }

    #[test]
    fn test_noise_before_first_marker_is_discarded() {
        let s = sentinels();
        let stdout = format!(
            "warning: something\n{}\nout\n\n{}\n[]\n",
            s.user_output, s.test_results
        );
        let parsed = parse_probe_output(&stdout, &s).unwrap();
        assert_eq!(parsed.user_output, "out");
        assert!(parsed.verdicts.is_empty());
    }

    #[test]
    fn test_missing_first_marker() {
        let s = sentinels();
        let err = parse_probe_output("plain output, no markers", &s).unwrap_err();
        assert!(matches!(err, GradeError::ParseFailure(_)));
        assert!(err.to_string().contains("no test results found"));
    }

    #[test]
    fn test_missing_second_marker() {
        let s = sentinels();
        let stdout = format!("{}\nout only\n", s.user_output);
        let err = parse_probe_output(&stdout, &s).unwrap_err();
        assert!(err.to_string().contains("verdict marker missing"));
    }

    #[test]
    fn test_malformed_verdict_json_is_an_error_not_a_pass() {
        let s = sentinels();
        let stdout = format!("{}\nout\n\n{}\nnot json\n", s.user_output, s.test_results);
        let err = parse_probe_output(&stdout, &s).unwrap_err();
        assert!(matches!(err, GradeError::ParseFailure(_)));
    }

    #[test]
    fn test_learner_cannot_forge_markers_without_suffix() {
        let s = sentinels();
        // A learner printing the un-suffixed token does not split the stream
        let stdout = format!(
            "{}\n<<<USER_OUTPUT>>> forged\n\n{}\n[]\n",
            s.user_output, s.test_results
        );
        let parsed = parse_probe_output(&stdout, &s).unwrap();
        assert!(parsed.user_output.contains("forged"));
        assert!(parsed.verdicts.is_empty());
    }
}
