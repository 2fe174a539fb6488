//! Query executor and result comparator
//!
//! Runs a validated statement against a session's isolated instance over a
//! single short-lived connection, canonicalizes the result set, and compares
//! it with the instructor's expected shape. Row comparison is an
//! order-insensitive multiset so semantically-correct but differently-ordered
//! results are accepted.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row, Statement};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::GradeError;
use crate::sqlbox::InstanceHandle;
use crate::sqlguard;

/// Result set of one executed statement
#[derive(Debug, Serialize)]
pub struct QueryResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, Value>>,
    pub row_count: usize,
    pub time_ms: u64,
}

/// Execution outcome: a result set, or a statement-level SQL error.
/// SQL errors are learner feedback, not infrastructure faults.
#[derive(Debug)]
pub enum QueryOutcome {
    Ok(QueryResultSet),
    SqlError(String),
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Execute one statement against the session's instance. The connection is
/// opened per call and closed on every exit path; the statement is bounded
/// by `statement_timeout`, after which the connection is dropped (aborting
/// the server-side statement) and the whole submission times out.
pub async fn execute(
    handle: &InstanceHandle,
    query: &str,
    statement_timeout: Duration,
) -> Result<QueryOutcome, GradeError> {
    // The validator warned about extra statements; only the first runs.
    let statement = query.split(';').next().unwrap_or("").trim();
    let started = Instant::now();

    let options = MySqlConnectOptions::new()
        .host("127.0.0.1")
        .port(handle.port)
        .username(&handle.user)
        .password(&handle.password)
        .database(&handle.database);

    let mut conn = timeout(CONNECT_TIMEOUT, options.connect())
        .await
        .map_err(|_| GradeError::SandboxUnavailable("connection timed out".into()))?
        .map_err(|e| GradeError::SandboxUnavailable(format!("connection failed: {}", e)))?;

    let outcome = run_statement(&mut conn, statement, statement_timeout, started).await;

    if let Err(e) = conn.close().await {
        debug!("Connection close after statement: {}", e);
    }

    outcome
}

async fn run_statement(
    conn: &mut sqlx::MySqlConnection,
    statement: &str,
    statement_timeout: Duration,
    started: Instant,
) -> Result<QueryOutcome, GradeError> {
    if sqlguard::is_read_only(statement) {
        let prepared = match conn.prepare(statement).await {
            Ok(prepared) => prepared,
            Err(sqlx::Error::Database(db)) => return Ok(QueryOutcome::SqlError(db.to_string())),
            Err(e) => {
                return Err(GradeError::Infra(
                    anyhow::Error::new(e).context("Failed to prepare statement"),
                ))
            }
        };

        let columns: Vec<String> = prepared
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let rows = match timeout(statement_timeout, prepared.query().fetch_all(&mut *conn)).await
        {
            Ok(Ok(rows)) => rows,
            Ok(Err(sqlx::Error::Database(db))) => {
                return Ok(QueryOutcome::SqlError(db.to_string()))
            }
            Ok(Err(e)) => {
                return Err(GradeError::Infra(
                    anyhow::Error::new(e).context("Failed to fetch rows"),
                ))
            }
            Err(_) => {
                warn!("Statement exceeded {:?} budget", statement_timeout);
                return Err(GradeError::Timeout(statement_timeout.as_millis() as u64));
            }
        };

        let mapped: Vec<serde_json::Map<String, Value>> = rows
            .iter()
            .map(|row| row_to_object(row, &columns))
            .collect();

        Ok(QueryOutcome::Ok(QueryResultSet {
            row_count: mapped.len(),
            columns,
            rows: mapped,
            time_ms: started.elapsed().as_millis() as u64,
        }))
    } else {
        // Row-mutating statement: autocommit applies it, rows_affected is
        // the interesting number.
        let result = match timeout(statement_timeout, conn.execute(statement)).await {
            Ok(Ok(result)) => result,
            Ok(Err(sqlx::Error::Database(db))) => {
                return Ok(QueryOutcome::SqlError(db.to_string()))
            }
            Ok(Err(e)) => {
                return Err(GradeError::Infra(
                    anyhow::Error::new(e).context("Failed to execute statement"),
                ))
            }
            Err(_) => {
                warn!("Statement exceeded {:?} budget", statement_timeout);
                return Err(GradeError::Timeout(statement_timeout.as_millis() as u64));
            }
        };

        Ok(QueryOutcome::Ok(QueryResultSet {
            columns: vec![],
            rows: vec![],
            row_count: result.rows_affected() as usize,
            time_ms: started.elapsed().as_millis() as u64,
        }))
    }
}

/// Decode one row into a JSON object, trying progressively looser types.
fn row_to_object(row: &MySqlRow, columns: &[String]) -> serde_json::Map<String, Value> {
    let mut object = serde_json::Map::with_capacity(columns.len());
    for (idx, name) in columns.iter().enumerate() {
        object.insert(name.clone(), column_value(row, idx));
    }
    object
}

fn column_value(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return match v {
            Some(n) => Value::from(n),
            None => Value::Null,
        };
    }
    if let Ok(Some(n)) = row.try_get::<Option<u64>, _>(idx) {
        return Value::from(n);
    }
    if let Ok(Some(f)) = row.try_get::<Option<f64>, _>(idx) {
        return serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(Some(f)) = row.try_get::<Option<f32>, _>(idx) {
        return serde_json::Number::from_f64(f64::from(f))
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    // DECIMAL (e.g. AVG/SUM results) canonicalizes to its string form
    if let Ok(Some(d)) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
        return Value::from(d.to_string());
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return match v {
            Some(s) => Value::from(s),
            None => Value::Null,
        };
    }
    if let Ok(Some(dt)) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
        return Value::from(dt.format("%Y-%m-%d %H:%M:%S").to_string());
    }
    if let Ok(Some(dt)) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
        return Value::from(dt.format("%Y-%m-%d %H:%M:%S").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<NaiveDate>, _>(idx) {
        return Value::from(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(t)) = row.try_get::<Option<NaiveTime>, _>(idx) {
        return Value::from(t.format("%H:%M:%S").to_string());
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(idx) {
        return Value::from(b);
    }
    if let Ok(Some(bytes)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return Value::from(String::from_utf8_lossy(&bytes).into_owned());
    }
    Value::Null
}

/// Instructor-authored expected result set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedResultSet {
    pub columns: Vec<String>,
    #[serde(alias = "results")]
    pub rows: Vec<serde_json::Map<String, Value>>,
}

/// Outcome of comparing actual vs expected result sets
#[derive(Debug, Serialize)]
pub struct Comparison {
    pub matches: bool,
    pub feedback: String,
}

/// Compare column count, then names (case-insensitive, unordered), then row
/// count, then row content as an order-insensitive multiset.
pub fn compare(actual: &QueryResultSet, expected: &ExpectedResultSet) -> Comparison {
    if actual.columns.len() != expected.columns.len() {
        return Comparison {
            matches: false,
            feedback: format!(
                "Column count mismatch. Expected {} columns, got {}.",
                expected.columns.len(),
                actual.columns.len()
            ),
        };
    }

    let mut actual_names: Vec<String> =
        actual.columns.iter().map(|c| c.to_lowercase()).collect();
    let mut expected_names: Vec<String> =
        expected.columns.iter().map(|c| c.to_lowercase()).collect();
    actual_names.sort();
    expected_names.sort();

    if actual_names != expected_names {
        return Comparison {
            matches: false,
            feedback: format!(
                "Column names mismatch. Expected: {:?}, Got: {:?}",
                expected.columns, actual.columns
            ),
        };
    }

    if actual.rows.len() != expected.rows.len() {
        return Comparison {
            matches: false,
            feedback: format!(
                "Row count mismatch. Expected {} rows, got {}.",
                expected.rows.len(),
                actual.rows.len()
            ),
        };
    }

    let mut actual_rows: Vec<String> = actual.rows.iter().map(canonical_row).collect();
    let mut expected_rows: Vec<String> = expected.rows.iter().map(canonical_row).collect();
    actual_rows.sort();
    expected_rows.sort();

    if actual_rows != expected_rows {
        return Comparison {
            matches: false,
            feedback:
                "Query results do not match expected output. Check your WHERE clauses and calculations."
                    .into(),
        };
    }

    Comparison {
        matches: true,
        feedback: "Excellent! Your query returns the correct results.".into(),
    }
}

/// Canonical serialization of one row: keys lowercased and ordered, so the
/// multiset comparison is insensitive to column order and name casing.
fn canonical_row(row: &serde_json::Map<String, Value>) -> String {
    let ordered: BTreeMap<String, &Value> = row
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();
    serde_json::to_string(&ordered).unwrap_or_default()
}

/// Column metadata for one table in the session's schema
#[derive(Debug, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: String,
    pub key: String,
}

/// Summary of one table: columns plus row count
#[derive(Debug, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub row_count: usize,
}

/// Describe every table in the session's database, for the practice UI
pub async fn schema_summary(
    handle: &InstanceHandle,
    statement_timeout: Duration,
) -> Result<Vec<TableSummary>, GradeError> {
    let tables = match execute(handle, "SHOW TABLES", statement_timeout).await? {
        QueryOutcome::Ok(result) => result,
        QueryOutcome::SqlError(e) => {
            return Err(GradeError::Infra(anyhow::anyhow!(
                "SHOW TABLES failed: {}",
                e
            )))
        }
    };

    let mut summaries = Vec::new();
    for row in &tables.rows {
        let table = match row.values().next().and_then(|v| v.as_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };

        // Table names come from SHOW TABLES, not the learner, so direct
        // interpolation is safe here.
        let describe = format!("DESCRIBE `{}`", table);
        let columns = match execute(handle, &describe, statement_timeout).await? {
            QueryOutcome::Ok(result) => result
                .rows
                .iter()
                .map(|r| {
                    let field = |key: &str| {
                        r.get(key)
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string()
                    };
                    ColumnInfo {
                        name: field("Field"),
                        data_type: field("Type"),
                        nullable: field("Null"),
                        key: field("Key"),
                    }
                })
                .collect(),
            QueryOutcome::SqlError(_) => vec![],
        };

        let count_query = format!("SELECT COUNT(*) AS n FROM `{}`", table);
        let row_count = match execute(handle, &count_query, statement_timeout).await? {
            QueryOutcome::Ok(result) => result
                .rows
                .first()
                .and_then(|r| r.get("n"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize,
            QueryOutcome::SqlError(_) => 0,
        };

        summaries.push(TableSummary {
            name: table,
            columns,
            row_count,
        });
    }

    Ok(summaries)
}
