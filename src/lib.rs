//! # finquery
//!
//! Natural-language questions over a personal finance SQLite database.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Question
//!     ↓
//! [PromptBuilder]     → Prompt (schema, samples, conventions, prior violations)
//!     ↓
//! [QueryGenerator]    → GenerationAttempt (untrusted candidate SQL)
//!     ↓
//! [QueryGuard]        → GuardVerdict (approved + row cap, or violation set)
//!     ↓                    ↺ retry with violations, bounded by max_attempts
//! [QueryExecutor]     → QueryResult (read-only, timed, capped)
//!     ↓
//! [ResultPackager]    → PackagedResult (kinds, totals, clipped cells)
//!     ↓
//! [Summarizer]        → grounded summary or fallback
//!     ↓
//! Answer | Failure    (+ one query log record)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use finquery::{Config, Orchestrator, SchemaModel};
//! use finquery::generation::backend_from_config;
//! use finquery::query_log::JsonlQueryLog;
//! use std::sync::Arc;
//!
//! let config = Config::load()?;
//! let schema = SchemaModel::from_snapshot_file(&config.database.schema_snapshot)?;
//! let backend = backend_from_config(&config.generation)?;
//! let log = Arc::new(JsonlQueryLog::open(&config.query_log.path)?);
//!
//! let orchestrator = Orchestrator::new(&config, schema, backend, log);
//! let answer = orchestrator.answer("How much did I spend on food in 2024?").await?;
//! println!("{}", answer.summary_text.unwrap_or_default());
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `schema` | Snapshot loading and live introspection |
//! | `prompt` | Prompt assembly |
//! | `generation` | Text generation capability and backends |
//! | `guard` | Static validation and row-cap enforcement |
//! | `execution` | Read-only, cancellable execution |
//! | `packager` | Display-ready results |
//! | `grounding` | Summary grounding check |
//! | `summarizer` | Natural-language summaries |
//! | `query_log` | Per-request audit records |
//! | `orchestrator` | Bounded retry state machine |

// Configuration system
pub mod config;

// Schema model
pub mod schema;

// Pipeline stages
pub mod execution;
pub mod generation;
pub mod guard;
pub mod packager;
pub mod prompt;
pub mod summarizer;

// Summary grounding
pub mod grounding;

// Audit log
pub mod query_log;

// Entry point
pub mod orchestrator;

// Re-export public types
pub use config::Config;
pub use execution::{CellValue, ExecutionFailure, QueryExecutor, QueryResult};
pub use generation::{CapabilityError, GenerationAttempt, Prompt, QueryGenerator, TextGenerator};
pub use guard::{GuardVerdict, QueryGuard, ViolationKind};
pub use orchestrator::{Answer, AttemptRecord, Failure, Orchestrator, Provenance};
pub use packager::{PackagedResult, ResultPackager, ResultShape};
pub use prompt::PromptBuilder;
pub use query_log::{JsonlQueryLog, MemoryQueryLog, QueryLogRecord, QueryLogSink};
pub use schema::{ColumnDescriptor, SchemaError, SchemaModel, TableDescriptor};
pub use summarizer::{Summarizer, SummaryStatus};
