//! # finquery CLI
//!
//! Thin front end over [`Orchestrator::answer`].
//!
//! ## Usage
//!
//! ```bash
//! # One question
//! finquery ask "How much did I spend on food in March 2024?"
//!
//! # Interactive
//! finquery repl
//!
//! # Guard a hand-written query without running it
//! finquery check "SELECT category, SUM(amount_clp) FROM expenses GROUP BY category"
//!
//! # Refresh the schema snapshot from the database
//! finquery snapshot --out data/clean/schema_snapshot.json
//! ```
//!
//! Exit codes: 0 on an answer, 1 on configuration or I/O errors, 2 on a
//! pipeline failure (or a rejected `check`).
//!
//! Diagnostics are off unless `FINQUERY_TRACE=1` (stderr) or
//! `FINQUERY_TRACE_FILE=<path>` is set. Level and format come from the
//! `[logging]` section; `FINQUERY_TRACE_LEVEL` and `FINQUERY_TRACE_JSON`
//! override them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use finquery::config::LoggingConfig;
use finquery::generation::backend_from_config;
use finquery::query_log::{JsonlQueryLog, QueryLogSink, TracingQueryLog};
use finquery::{
    Answer, Config, Failure, GuardVerdict, Orchestrator, PackagedResult, QueryGuard, SchemaModel,
    SummaryStatus,
};
use rusqlite::{Connection, OpenFlags};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, OnceLock};
use tracing_subscriber::EnvFilter;

static TRACE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Ask questions about your finance records in plain language
#[derive(Parser)]
#[command(name = "finquery")]
#[command(about = "Ask questions about your finance records in plain language", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: finquery.toml + finquery.local.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Schema snapshot file
    #[arg(long, global = true)]
    schema: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one question
    Ask {
        /// The question (may be given unquoted)
        #[arg(required = true)]
        question: Vec<String>,

        /// Also print rows, attempts and timings
        #[arg(long, short)]
        verbose: bool,

        /// Print the answer or failure as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactive question loop
    Repl {
        #[arg(long, short)]
        verbose: bool,
    },

    /// Run the query guard on a SQL query and print its verdict
    Check {
        query: String,

        #[arg(long)]
        json: bool,
    },

    /// Introspect the database and write a schema snapshot
    Snapshot {
        /// Output path (default: database.schema_snapshot)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Example rows to keep per table (default: prompt.max_samples_per_table)
        #[arg(long)]
        samples: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Ask {
            question,
            verbose,
            json,
        } => {
            let orchestrator = build_orchestrator(&config)?;
            match orchestrator.answer(&question.join(" ")).await {
                Ok(answer) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&answer)?);
                    } else {
                        print_answer(&answer, verbose);
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(failure) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&failure)?);
                    } else {
                        print_failure(&failure, verbose);
                    }
                    Ok(ExitCode::from(2))
                }
            }
        }
        Commands::Repl { verbose } => repl(&config, verbose).await,
        Commands::Check { query, json } => check(&config, &query, json),
        Commands::Snapshot { out, samples } => snapshot(&config, out, samples),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(&path.to_string_lossy())
            .with_context(|| format!("Failed to load configuration from '{}'", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };
    if let Some(db) = &cli.db {
        config.database.path.clone_from(db);
    }
    if let Some(schema) = &cli.schema {
        config.database.schema_snapshot.clone_from(schema);
    }
    Ok(config)
}

fn load_schema(config: &Config) -> Result<SchemaModel> {
    SchemaModel::from_snapshot_file(&config.database.schema_snapshot).with_context(|| {
        format!(
            "Failed to load schema snapshot '{}' (run `finquery snapshot` to create it)",
            config.database.schema_snapshot.display()
        )
    })
}

fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let schema = load_schema(config)?;
    let backend =
        backend_from_config(&config.generation).context("Failed to configure generation backend")?;
    let log: Arc<dyn QueryLogSink> = if config.query_log.path.is_empty() {
        Arc::new(TracingQueryLog)
    } else {
        Arc::new(
            JsonlQueryLog::open(&config.query_log.path).context("Failed to open query log")?,
        )
    };
    Ok(Orchestrator::new(config, schema, backend, log))
}

async fn repl(config: &Config, verbose: bool) -> Result<ExitCode> {
    let orchestrator = build_orchestrator(config)?;
    let mut editor = DefaultEditor::new().context("Failed to initialize line editor")?;

    println!("finquery");
    println!("========");
    println!(
        "{} table(s) loaded. Ask a question, or .quit to exit.",
        orchestrator.schema().tables().len()
    );
    println!();

    loop {
        match editor.readline("? ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == ".quit" || line == ".exit" {
                    break;
                }
                let _ = editor.add_history_entry(line);

                match orchestrator.answer(line).await {
                    Ok(answer) => print_answer(&answer, verbose),
                    Err(failure) => print_failure(&failure, verbose),
                }
                println!();
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e).context("Failed to read input"),
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn check(config: &Config, query: &str, json: bool) -> Result<ExitCode> {
    let schema = load_schema(config)?;
    let guard = QueryGuard::new(config.guard.row_cap);
    let verdict = guard.validate(query, &schema);

    if json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        match &verdict {
            GuardVerdict::Approved {
                final_query_text,
                row_limit_injected,
            } => {
                println!("APPROVED");
                println!("{final_query_text}");
                if *row_limit_injected {
                    println!("(row limit {} applied)", guard.row_cap());
                }
            }
            GuardVerdict::Rejected { violations } => {
                println!("REJECTED");
                for violation in violations {
                    println!("  - {violation}: {}", violation.guidance());
                }
            }
        }
    }

    Ok(if verdict.is_approved() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn snapshot(config: &Config, out: Option<PathBuf>, samples: Option<usize>) -> Result<ExitCode> {
    let db_path = &config.database.path;
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open database '{}'", db_path.display()))?;

    let samples = samples.unwrap_or(config.prompt.max_samples_per_table);
    let schema = SchemaModel::introspect(&conn, samples)?;

    let out = out.unwrap_or_else(|| config.database.schema_snapshot.clone());
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    std::fs::write(&out, schema.to_snapshot_json()?)
        .with_context(|| format!("Failed to write '{}'", out.display()))?;

    println!(
        "Wrote schema snapshot with {} table(s) to {}",
        schema.tables().len(),
        out.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn print_answer(answer: &Answer, verbose: bool) {
    match &answer.summary_text {
        Some(text) => println!("{text}"),
        None => println!("(no summary available)"),
    }
    println!();
    println!("SQL: {}", answer.query_used);

    if verbose {
        println!();
        print_rows(&answer.packaged_result);
        if let SummaryStatus::Ungrounded { values } = &answer.summary {
            println!(
                "Generated summary cited values not in the result ({}); showing a plain summary",
                values.join(", ")
            );
        }
        let provenance = &answer.provenance;
        println!(
            "request {}: {} attempt(s), generation {} ms, execution {} ms, total {} ms",
            provenance.request_id,
            answer.attempts_made,
            provenance.generation_ms,
            provenance.execution_ms,
            provenance.total_ms
        );
    }
}

fn print_rows(result: &PackagedResult) {
    println!("{}", result.columns.join(" | "));
    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
        println!("{}", cells.join(" | "));
    }
    println!(
        "({} row{}{})",
        result.row_count,
        if result.row_count == 1 { "" } else { "s" },
        if result.truncated { ", truncated" } else { "" }
    );
    for (column, total) in &result.totals {
        println!("total {column}: {total}");
    }
}

fn print_failure(failure: &Failure, verbose: bool) {
    eprintln!("Error: {failure}");
    if matches!(failure, Failure::GuardRejected { .. }) {
        for violation in failure.last_violations() {
            eprintln!("  - {violation}: {}", violation.guidance());
        }
    }
    if verbose {
        for record in failure.attempts() {
            eprintln!(
                "attempt {}: {}",
                record.attempt.attempt_index, record.attempt.candidate_query_text
            );
        }
    }
}

/// Diagnostics destination and format once environment overrides apply
#[derive(Debug, PartialEq)]
struct TraceSettings {
    level: String,
    json: bool,
    /// `None` writes to stderr
    file: Option<PathBuf>,
}

impl TraceSettings {
    /// `None` when neither `FINQUERY_TRACE` nor `FINQUERY_TRACE_FILE` asks for diagnostics
    fn resolve(config: &LoggingConfig, var: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let file = var("FINQUERY_TRACE_FILE")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        let requested = var("FINQUERY_TRACE").is_some_and(|v| v != "0");
        if !requested && file.is_none() {
            return None;
        }

        Some(TraceSettings {
            level: var("FINQUERY_TRACE_LEVEL").unwrap_or_else(|| config.level.clone()),
            json: var("FINQUERY_TRACE_JSON").map_or(config.format == "json", |v| v != "0"),
            file,
        })
    }
}

fn init_tracing(config: &LoggingConfig) {
    let Some(settings) = TraceSettings::resolve(config, |name| env::var(name).ok()) else {
        return;
    };

    let (writer, guard) = match &settings.file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => tracing_appender::non_blocking(file),
            Err(e) => {
                eprintln!("Error: cannot open trace file {}: {e}", path.display());
                return;
            }
        },
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    let _ = TRACE_GUARD.set(guard);

    let filter = EnvFilter::try_new(&settings.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false);
    let _ = if settings.json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}
