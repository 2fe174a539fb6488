//! Query policy validator
//!
//! Static policy gate for query submissions. Normalizes the statement,
//! refuses schema/privilege-altering keywords in every mode, restricts
//! read-only sessions to read-class leading keywords, and gates destructive
//! deletes behind an explicit flag. Suspicious-but-legal patterns produce
//! warnings, not rejections.

use std::sync::OnceLock;

use regex::Regex;

use crate::errors::GradeError;

/// Keywords blocked in every mode: schema, privilege, and lock class
pub const DANGEROUS_KEYWORDS: &[&str] = &[
    "DROP", "TRUNCATE", "ALTER", "CREATE", "GRANT", "REVOKE", "LOCK", "UNLOCK", "RENAME", "FLUSH",
    "SHUTDOWN",
];

/// Leading keywords accepted in read-only mode
pub const READ_ONLY_KEYWORDS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];

/// Row-mutating keywords accepted when mutation is allowed
#[allow(dead_code)]
pub const DML_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE"];

/// A validated query with its normalized text and non-fatal warnings
#[derive(Debug)]
pub struct ValidatedQuery {
    pub normalized: String,
    pub warnings: Vec<String>,
}

fn line_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--[^\n]*").unwrap_or_else(|_| unreachable!()))
}

fn block_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)/\*.*?\*/").unwrap_or_else(|_| unreachable!()))
}

/// Strip comments and collapse whitespace
pub fn normalize_query(query: &str) -> String {
    let without_line = line_comment_re().replace_all(query, "");
    let without_block = block_comment_re().replace_all(&without_line, "");
    without_block
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Check whether the (normalized) query starts with a read-class keyword
pub fn is_read_only(query: &str) -> bool {
    let normalized = normalize_query(query).to_uppercase();
    match normalized.split_whitespace().next() {
        Some(first) => READ_ONLY_KEYWORDS.contains(&first),
        None => false,
    }
}

/// Find dangerous keywords present in the query (word-boundary match)
pub fn dangerous_keywords_in(query: &str) -> Vec<&'static str> {
    let normalized = normalize_query(query).to_uppercase();
    DANGEROUS_KEYWORDS
        .iter()
        .filter(|keyword| word_match(&normalized, keyword))
        .copied()
        .collect()
}

fn word_match(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|token| token == word)
}

/// Validate a query against the session's execution mode.
///
/// `read_only` restricts to read-class statements; `allow_destructive_delete`
/// gates DELETE even when mutation is otherwise allowed. Both flags default
/// to the most restrictive setting at the call sites.
pub fn validate(
    query: &str,
    read_only: bool,
    allow_destructive_delete: bool,
) -> Result<ValidatedQuery, GradeError> {
    if query.trim().is_empty() {
        return Err(GradeError::QueryRejected("Query cannot be empty".into()));
    }

    let normalized = normalize_query(query);

    if normalized.len() > 10_000 {
        return Err(GradeError::QueryRejected(
            "Query is too long (max 10000 characters)".into(),
        ));
    }

    let dangerous = dangerous_keywords_in(query);
    if !dangerous.is_empty() {
        return Err(GradeError::QueryRejected(format!(
            "Query contains forbidden keywords: {}",
            dangerous.join(", ")
        )));
    }

    if read_only && !is_read_only(&normalized) {
        return Err(GradeError::QueryRejected(
            "Only SELECT, SHOW, DESCRIBE, and EXPLAIN queries are allowed".into(),
        ));
    }

    let upper = normalized.to_uppercase();
    if !allow_destructive_delete && word_match(&upper, "DELETE") {
        return Err(GradeError::QueryRejected(
            "DELETE queries are not allowed for this exercise".into(),
        ));
    }

    let mut warnings = Vec::new();

    // A trailing semicolon is fine; an embedded one means extra statements
    // that will not run.
    if normalized[..normalized.len().saturating_sub(1)].contains(';') {
        warnings.push(
            "Multiple statements detected. Only the first statement will be executed.".into(),
        );
    }

    if upper.matches("JOIN").count() > 5 {
        warnings.push("Query has many JOINs. This might be slow.".into());
    }

    if upper.matches("UNION").count() > 3 {
        warnings.push("Query has multiple UNIONs. This might be slow.".into());
    }

    Ok(ValidatedQuery {
        normalized,
        warnings,
    })
}

/// Best-effort table-name extraction for logging
pub fn extract_tables(query: &str) -> Vec<String> {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = RE.get_or_init(|| {
        [
            r"(?i)\bFROM\s+([a-zA-Z_][a-zA-Z0-9_]*)",
            r"(?i)\bJOIN\s+([a-zA-Z_][a-zA-Z0-9_]*)",
            r"(?i)\bINTO\s+([a-zA-Z_][a-zA-Z0-9_]*)",
            r"(?i)\bUPDATE\s+([a-zA-Z_][a-zA-Z0-9_]*)",
        ]
        .into_iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    let normalized = normalize_query(query);
    let mut tables: Vec<String> = patterns
        .iter()
        .flat_map(|re| {
            re.captures_iter(&normalized)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str().to_lowercase())
                .collect::<Vec<_>>()
        })
        .collect();

    tables.sort();
    tables.dedup();
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_both_comment_forms() {
        let query = "SELECT a, -- pick a\n  b /* and\n b */ FROM t";
        assert_eq!(normalize_query(query), "SELECT a, b FROM t");
    }

    #[test]
    fn test_read_only_detection() {
        assert!(is_read_only("SELECT * FROM users"));
        assert!(is_read_only("  show tables"));
        assert!(is_read_only("EXPLAIN SELECT 1"));
        assert!(!is_read_only("INSERT INTO t VALUES (1)"));
        assert!(!is_read_only(""));
    }

    #[test]
    fn test_dangerous_keywords_rejected_in_any_mode() {
        for keyword in DANGEROUS_KEYWORDS {
            let query = format!("{} TABLE users", keyword);
            let err = validate(&query, false, true).unwrap_err();
            assert!(
                matches!(err, GradeError::QueryRejected(_)),
                "{} slipped through",
                keyword
            );
        }
    }

    #[test]
    fn test_dangerous_keyword_inside_comment_is_ignored() {
        let result = validate("SELECT 1 -- DROP TABLE users", true, false).unwrap();
        assert_eq!(result.normalized, "SELECT 1");
    }

    #[test]
    fn test_keyword_as_substring_of_identifier_is_allowed() {
        // "dropped_at" contains DROP but is not the keyword
        assert!(validate("SELECT dropped_at FROM logs", true, false).is_ok());
    }

    #[test]
    fn test_read_only_mode_rejects_mutation() {
        let err = validate("INSERT INTO t VALUES (1)", true, false).unwrap_err();
        assert!(err
            .to_string()
            .contains("Only SELECT, SHOW, DESCRIBE, and EXPLAIN"));
    }

    #[test]
    fn test_mutation_mode_accepts_insert_and_update() {
        assert!(validate("INSERT INTO t VALUES (1)", false, false).is_ok());
        assert!(validate("UPDATE t SET a = 1 WHERE id = 2", false, false).is_ok());
    }

    #[test]
    fn test_delete_requires_explicit_flag() {
        let err = validate("DELETE FROM t WHERE id = 1", false, false).unwrap_err();
        assert!(err.to_string().contains("DELETE"));

        assert!(validate("DELETE FROM t WHERE id = 1", false, true).is_ok());
    }

    #[test]
    fn test_empty_query_rejected() {
        assert!(validate("   ", true, false).is_err());
    }

    #[test]
    fn test_oversized_query_rejected() {
        let huge = format!("SELECT {}", "a,".repeat(6000));
        let err = validate(&huge, true, false).unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn test_multiple_statements_warn_but_pass() {
        let result = validate("SELECT 1; SELECT 2;", true, false).unwrap();
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("Multiple statements"));
    }

    #[test]
    fn test_trailing_semicolon_is_not_a_warning() {
        let result = validate("SELECT 1;", true, false).unwrap();
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_excessive_joins_warn() {
        let joins = "JOIN t ON 1=1 ".repeat(6);
        let query = format!("SELECT * FROM a {}", joins);
        let result = validate(&query, true, false).unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("JOIN")));
    }

    #[test]
    fn test_extract_tables() {
        let tables =
            extract_tables("SELECT * FROM Users u JOIN orders o ON u.id = o.user_id");
        assert_eq!(tables, vec!["orders", "users"]);
    }
}
