//! Append-only per-request query log.
//!
//! The orchestrator writes exactly one [`QueryLogRecord`] per question, on
//! success and failure alike. Sinks are handed to the orchestrator
//! explicitly; there is no global logger.

use crate::guard::ViolationKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Query log errors
#[derive(Debug, thiserror::Error)]
pub enum LogSinkError {
    #[error("Query log I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Query log serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Verdict of one attempt, as logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictEntry {
    pub attempt: usize,
    pub candidate: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub violations: BTreeSet<ViolationKind>,
}

/// One line of the query log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLogRecord {
    /// RFC 3339
    pub timestamp: String,
    pub request_id: String,
    pub question: String,
    pub final_query: Option<String>,
    pub verdicts: Vec<VerdictEntry>,
    pub row_count: Option<usize>,
    pub elapsed_ms: u64,
    /// `answered` or the failure kind
    pub outcome: String,
}

/// Destination for query log records
pub trait QueryLogSink: Send + Sync {
    fn record(&self, record: &QueryLogRecord) -> Result<(), LogSinkError>;
}

/// JSON Lines file, one record per line
pub struct JsonlQueryLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlQueryLog {
    /// Open (or create) the log file, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogSinkError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| LogSinkError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        Ok(JsonlQueryLog {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QueryLogSink for JsonlQueryLog {
    fn record(&self, record: &QueryLogRecord) -> Result<(), LogSinkError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|source| LogSinkError::Io {
                path: self.path.display().to_string(),
                source,
            })
    }
}

/// Emits each record as a structured `tracing` event
#[derive(Debug, Default)]
pub struct TracingQueryLog;

impl QueryLogSink for TracingQueryLog {
    fn record(&self, record: &QueryLogRecord) -> Result<(), LogSinkError> {
        tracing::info!(
            target: "finquery::query_log",
            request_id = %record.request_id,
            question = %record.question,
            final_query = record.final_query.as_deref().unwrap_or(""),
            attempts = record.verdicts.len(),
            row_count = record.row_count,
            elapsed_ms = record.elapsed_ms,
            outcome = %record.outcome,
            "query"
        );
        Ok(())
    }
}

/// Keeps records in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryQueryLog {
    records: Arc<Mutex<Vec<QueryLogRecord>>>,
}

impl MemoryQueryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<QueryLogRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl QueryLogSink for MemoryQueryLog {
    fn record(&self, record: &QueryLogRecord) -> Result<(), LogSinkError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
