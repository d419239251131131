//! # Orchestrator
//!
//! Drives one question through generate, guard, execute, package and
//! summarize as an explicit state machine:
//!
//! ```text
//! Generating -> Guarding -> Approved -> Executing -> Packaging -> Summarizing -> Done
//!                   |                       |
//!                   +-> Rejected ------------+-> Failed
//!                         | attempts left
//!                         +-> Generating (carrying the violation set)
//! ```
//!
//! The loop runs at most `max_attempts` generation calls. Capability and
//! execution failures end the request at once; only guard rejections retry.
//! Exactly one query log record is written per call to [`Orchestrator::answer`].

use crate::config::Config;
use crate::execution::{ExecutionFailure, QueryExecutor, QueryResult};
use crate::generation::{CapabilityError, GenerationAttempt, QueryGenerator, TextGenerator};
use crate::guard::{GuardVerdict, QueryGuard, ViolationKind};
use crate::packager::{PackagedResult, ResultPackager, ResultShape};
use crate::prompt::PromptBuilder;
use crate::query_log::{QueryLogRecord, QueryLogSink, VerdictEntry};
use crate::schema::SchemaModel;
use crate::summarizer::{Summarizer, SummaryStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

/// One generation call and the verdict it received
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: GenerationAttempt,
    pub verdict: GuardVerdict,
}

/// Where an answer came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub request_id: String,
    pub attempts: Vec<AttemptRecord>,
    pub generation_ms: u64,
    pub execution_ms: u64,
    pub total_ms: u64,
}

/// Successful result of one question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// `None` when summaries are disabled or the generator failed
    pub summary_text: Option<String>,
    pub summary: SummaryStatus,
    pub packaged_result: PackagedResult,
    pub query_used: String,
    pub attempts_made: usize,
    pub provenance: Provenance,
}

/// Terminal pipeline failure
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    #[error("Question is empty")]
    EmptyQuestion,

    #[error("Query generator unavailable: {cause}")]
    GeneratorUnavailable {
        cause: CapabilityError,
        attempts: Vec<AttemptRecord>,
    },

    #[error("Could not form a safe query after {} attempt(s)", .attempts.len())]
    GuardRejected { attempts: Vec<AttemptRecord> },

    #[error("Query execution failed: {failure}")]
    Execution {
        failure: ExecutionFailure,
        query: String,
        attempts: Vec<AttemptRecord>,
    },
}

impl Failure {
    /// Attempts recorded before the failure
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Failure::EmptyQuestion => &[],
            Failure::GeneratorUnavailable { attempts, .. }
            | Failure::GuardRejected { attempts }
            | Failure::Execution { attempts, .. } => attempts,
        }
    }

    /// Stable label for front ends and the query log
    pub fn kind(&self) -> &'static str {
        match self {
            Failure::EmptyQuestion => "empty_question",
            Failure::GeneratorUnavailable { .. } => "generator_unavailable",
            Failure::GuardRejected { .. } => "guard_rejected",
            Failure::Execution { failure, .. } => match failure {
                ExecutionFailure::Timeout { .. } => "execution_timeout",
                ExecutionFailure::EngineError { .. } => "execution_error",
            },
        }
    }

    /// Violations of the last rejected attempt, if any
    pub fn last_violations(&self) -> BTreeSet<ViolationKind> {
        self.attempts()
            .last()
            .map(|record| record.verdict.violations())
            .unwrap_or_default()
    }
}

enum State {
    Generating { prior: BTreeSet<ViolationKind> },
    Guarding(GenerationAttempt),
    Executing { query: String },
    Packaging { result: QueryResult, query: String },
    Summarizing { packaged: PackagedResult, query: String },
    Done(Answer),
    Failed(Failure),
}

/// The single entry point from a question to an [`Answer`]
pub struct Orchestrator {
    schema: Arc<SchemaModel>,
    prompts: PromptBuilder,
    generator: QueryGenerator,
    guard: QueryGuard,
    executor: QueryExecutor,
    packager: ResultPackager,
    summarizer: Summarizer,
    log: Arc<dyn QueryLogSink>,
    max_attempts: usize,
    execution_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        schema: SchemaModel,
        backend: Arc<dyn TextGenerator>,
        log: Arc<dyn QueryLogSink>,
    ) -> Self {
        Orchestrator {
            schema: Arc::new(schema),
            prompts: PromptBuilder::new(&config.prompt),
            generator: QueryGenerator::from_config(Arc::clone(&backend), &config.generation),
            guard: QueryGuard::new(config.guard.row_cap),
            executor: QueryExecutor::new(&config.database.path),
            packager: ResultPackager::new(&config.packager),
            summarizer: Summarizer::new(backend, &config.summary, config.generation.timeout()),
            log,
            max_attempts: config.guard.max_attempts.max(1),
            execution_timeout: config.executor.timeout(),
        }
    }

    pub fn schema(&self) -> &SchemaModel {
        &self.schema
    }

    pub fn guard(&self) -> &QueryGuard {
        &self.guard
    }

    /// Answer one question. Writes exactly one query log record.
    pub async fn answer(&self, question: &str) -> Result<Answer, Failure> {
        let request_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("answer", request_id = %request_id);

        async {
            let started = Instant::now();
            let outcome = self.drive(&request_id, question).await;
            let elapsed = started.elapsed();

            match &outcome {
                Ok(answer) => tracing::info!(
                    attempts = answer.attempts_made,
                    rows = answer.packaged_result.row_count,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "answered"
                ),
                Err(failure) => tracing::info!(
                    kind = failure.kind(),
                    attempts = failure.attempts().len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "failed"
                ),
            }

            self.write_log(&request_id, question, &outcome, elapsed);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, request_id: &str, question: &str) -> Result<Answer, Failure> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Failure::EmptyQuestion);
        }

        let started = Instant::now();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut generation_time = Duration::ZERO;
        let mut execution_time = Duration::ZERO;
        let mut state = State::Generating {
            prior: BTreeSet::new(),
        };

        loop {
            state = match state {
                State::Generating { prior } => {
                    let prompt = self.prompts.build(question, &self.schema, &prior);
                    let clock = Instant::now();
                    let generated = self.generator.generate(&prompt, attempts.len() + 1).await;
                    generation_time += clock.elapsed();
                    match generated {
                        Ok(attempt) => State::Guarding(attempt),
                        Err(cause) => State::Failed(Failure::GeneratorUnavailable {
                            cause,
                            attempts: std::mem::take(&mut attempts),
                        }),
                    }
                }

                State::Guarding(attempt) => {
                    let verdict = self.guard.validate(&attempt.candidate_query_text, &self.schema);
                    let approved = verdict.final_query_text().map(str::to_string);
                    let violations = verdict.violations();
                    tracing::debug!(
                        attempt = attempt.attempt_index,
                        approved = approved.is_some(),
                        violations = ?violations,
                        "attempt_guarded"
                    );
                    attempts.push(AttemptRecord { attempt, verdict });

                    match approved {
                        Some(query) => State::Executing { query },
                        None if attempts.len() < self.max_attempts => {
                            State::Generating { prior: violations }
                        }
                        None => State::Failed(Failure::GuardRejected {
                            attempts: std::mem::take(&mut attempts),
                        }),
                    }
                }

                State::Executing { query } => {
                    let clock = Instant::now();
                    let executed = self
                        .executor
                        .execute(&query, self.guard.row_cap(), self.execution_timeout)
                        .await;
                    execution_time = clock.elapsed();
                    match executed {
                        Ok(result) => State::Packaging { result, query },
                        Err(failure) => State::Failed(Failure::Execution {
                            failure,
                            query,
                            attempts: std::mem::take(&mut attempts),
                        }),
                    }
                }

                State::Packaging { result, query } => {
                    let shape = ResultShape::classify(&query);
                    State::Summarizing {
                        packaged: self.packager.package(result, shape, execution_time),
                        query,
                    }
                }

                State::Summarizing { packaged, query } => {
                    let summary = self.summarizer.summarize(question, &query, &packaged).await;
                    State::Done(Answer {
                        summary_text: summary.text,
                        summary: summary.status,
                        packaged_result: packaged,
                        query_used: query,
                        attempts_made: attempts.len(),
                        provenance: Provenance {
                            request_id: request_id.to_string(),
                            attempts: std::mem::take(&mut attempts),
                            generation_ms: generation_time.as_millis() as u64,
                            execution_ms: execution_time.as_millis() as u64,
                            total_ms: started.elapsed().as_millis() as u64,
                        },
                    })
                }

                State::Done(answer) => return Ok(answer),
                State::Failed(failure) => return Err(failure),
            };
        }
    }

    fn write_log(
        &self,
        request_id: &str,
        question: &str,
        outcome: &Result<Answer, Failure>,
        elapsed: Duration,
    ) {
        let (attempts, final_query, row_count, label) = match outcome {
            Ok(answer) => (
                answer.provenance.attempts.as_slice(),
                Some(answer.query_used.clone()),
                Some(answer.packaged_result.row_count),
                "answered",
            ),
            Err(failure) => (
                failure.attempts(),
                match failure {
                    Failure::Execution { query, .. } => Some(query.clone()),
                    _ => None,
                },
                None,
                failure.kind(),
            ),
        };

        let record = QueryLogRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: request_id.to_string(),
            question: question.to_string(),
            final_query,
            verdicts: attempts
                .iter()
                .map(|record| VerdictEntry {
                    attempt: record.attempt.attempt_index,
                    candidate: record.attempt.candidate_query_text.clone(),
                    approved: record.verdict.is_approved(),
                    violations: record.verdict.violations(),
                })
                .collect(),
            row_count,
            elapsed_ms: elapsed.as_millis() as u64,
            outcome: label.to_string(),
        };

        if let Err(e) = self.log.record(&record) {
            tracing::warn!(error = %e, "query_log_write_failed");
        }
    }
}
