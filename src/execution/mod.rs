//! Query Execution Module
//!
//! Runs approved queries against the finance database:
//! - read-only connection opened per execution and dropped right after
//! - hard row cap independent of any LIMIT the query carries
//! - wall-clock timeout with cancellation of the in-flight statement

mod timeout;

pub use timeout::{CancelHandle, QueryTimeout};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Execution failure, classified for the caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// Wall-clock timeout exceeded; the statement was interrupted
    #[error("Query exceeded timeout of {timeout:?} (ran for {elapsed:?})")]
    Timeout { timeout: Duration, elapsed: Duration },

    /// Any database-level error: open, prepare, locked, malformed, disk
    #[error("Database error: {message}")]
    EngineError { message: String },
}

impl ExecutionFailure {
    pub fn engine(message: impl Into<String>) -> Self {
        ExecutionFailure::EngineError {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionFailure::Timeout { .. } => "timeout",
            ExecutionFailure::EngineError { .. } => "engine_error",
        }
    }
}

/// A single typed cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Storage class of a column, inferred from its values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
    Blob,
    Null,
}

impl CellValue {
    pub fn kind(&self) -> ColumnKind {
        match self {
            CellValue::Null => ColumnKind::Null,
            CellValue::Integer(_) => ColumnKind::Integer,
            CellValue::Real(_) => ColumnKind::Real,
            CellValue::Text(_) => ColumnKind::Text,
            CellValue::Blob(_) => ColumnKind::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Numeric view of integer and real cells
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(i) => Some(*i as f64),
            CellValue::Real(r) => Some(*r),
            _ => None,
        }
    }
}

impl From<SqlValue> for CellValue {
    fn from(value: SqlValue) -> Self {
        match value {
            SqlValue::Null => CellValue::Null,
            SqlValue::Integer(i) => CellValue::Integer(i),
            SqlValue::Real(r) => CellValue::Real(r),
            SqlValue::Text(t) => CellValue::Text(t),
            SqlValue::Blob(b) => CellValue::Blob(b),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => f.write_str("NULL"),
            CellValue::Integer(i) => write!(f, "{i}"),
            CellValue::Real(r) => write!(f, "{r}"),
            CellValue::Text(t) => f.write_str(t),
            CellValue::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// Raw rows returned by one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    /// Rows actually returned, never above the row cap
    pub row_count: usize,
    /// More rows existed past the cap
    pub truncated: bool,
}

/// Executes approved queries against one database file
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    db_path: PathBuf,
}

impl QueryExecutor {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        QueryExecutor {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `sql` with at most `row_cap` rows, cancelling it after `timeout`.
    ///
    /// The connection is opened here and released when the blocking worker
    /// finishes; it never outlives one call.
    pub async fn execute(
        &self,
        sql: &str,
        row_cap: usize,
        timeout: Duration,
    ) -> Result<QueryResult, ExecutionFailure> {
        let conn = open_read_only(&self.db_path)?;
        let deadline = QueryTimeout::start(timeout);
        let cancel = deadline.cancel_handle(conn.get_interrupt_handle());

        let worker_deadline = deadline.clone();
        let sql_owned = sql.to_string();
        let task = tokio::task::spawn_blocking(move || {
            run_capped(&conn, &sql_owned, row_cap, &worker_deadline)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ExecutionFailure::engine(format!(
                "execution worker failed: {join_error}"
            ))),
            Err(_) => {
                cancel.cancel();
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "query_interrupted");
                Err(deadline.expired())
            }
        }
    }
}

fn open_read_only(path: &Path) -> Result<Connection, ExecutionFailure> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI;
    let conn = Connection::open_with_flags(path, flags).map_err(|e| {
        ExecutionFailure::engine(format!("cannot open '{}': {e}", path.display()))
    })?;
    conn.execute_batch("PRAGMA query_only = ON")
        .map_err(|e| ExecutionFailure::engine(e.to_string()))?;
    Ok(conn)
}

fn run_capped(
    conn: &Connection,
    sql: &str,
    row_cap: usize,
    deadline: &QueryTimeout,
) -> Result<QueryResult, ExecutionFailure> {
    let classify = |e: rusqlite::Error| {
        if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
            deadline.expired()
        } else {
            ExecutionFailure::engine(e.to_string())
        }
    };

    let mut statement = conn.prepare(sql).map_err(classify)?;
    if !statement.readonly() {
        return Err(ExecutionFailure::engine("statement is not read-only"));
    }
    let columns: Vec<String> = statement
        .column_names()
        .iter()
        .map(ToString::to_string)
        .collect();
    let width = columns.len();

    deadline.check()?;
    let mut rows = statement.query([]).map_err(classify)?;
    let mut result_rows = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next().map_err(classify)? {
        deadline.check()?;
        if result_rows.len() >= row_cap {
            truncated = true;
            break;
        }
        let mut cells = Vec::with_capacity(width);
        for idx in 0..width {
            cells.push(CellValue::from(row.get::<_, SqlValue>(idx).map_err(classify)?));
        }
        result_rows.push(cells);
    }

    Ok(QueryResult {
        columns,
        row_count: result_rows.len(),
        rows: result_rows,
        truncated,
    })
}
