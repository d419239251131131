//! End-to-end pipeline tests: scripted generator, scratch SQLite database.

mod common;

use common::{FinanceDb, ScriptedGenerator, Unreachable};
use finquery::generation::CapabilityError;
use finquery::summarizer::EMPTY_RESULT_SUMMARY;
use finquery::{
    CellValue, Failure, GuardVerdict, MemoryQueryLog, Orchestrator, ResultShape, SummaryStatus,
    ViolationKind,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const APRIL_EXPENSES: &str = "SELECT date, category, amount_clp FROM expenses \
     WHERE amount_clp > 100 AND date >= '2024-04-01' AND date < '2024-05-01'";

fn orchestrator(
    db: &FinanceDb,
    backend: Arc<ScriptedGenerator>,
) -> (Orchestrator, MemoryQueryLog) {
    let log = MemoryQueryLog::new();
    let orchestrator = Orchestrator::new(&db.config(), db.schema(), backend, Arc::new(log.clone()));
    (orchestrator, log)
}

#[tokio::test]
async fn test_answer_with_injected_limit() {
    let db = FinanceDb::new();
    let backend = ScriptedGenerator::new(
        &[APRIL_EXPENSES],
        "You had 3 expenses totalling 40,500 CLP, the largest being 25,000 CLP.",
    );
    let (orchestrator, log) = orchestrator(&db, backend.clone());

    let answer = orchestrator
        .answer("Show expenses over 100 last month")
        .await
        .unwrap();

    assert!(answer.query_used.contains("FROM expenses"));
    assert!(answer.query_used.ends_with("LIMIT 100"));
    assert_eq!(answer.attempts_made, 1);
    assert_eq!(
        answer.packaged_result.columns,
        vec!["date", "category", "amount_clp"]
    );
    assert_eq!(answer.packaged_result.row_count, 3);
    assert!(!answer.packaged_result.truncated);
    assert_eq!(answer.packaged_result.result_shape, ResultShape::Detail);
    assert_eq!(
        answer.packaged_result.totals.get("amount_clp"),
        Some(&40500.0)
    );
    assert_eq!(answer.summary, SummaryStatus::Generated);
    assert_eq!(
        answer.summary_text.as_deref(),
        Some("You had 3 expenses totalling 40,500 CLP, the largest being 25,000 CLP.")
    );

    let records = log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, "answered");
    assert_eq!(records[0].final_query.as_deref(), Some(answer.query_used.as_str()));
    assert_eq!(records[0].row_count, Some(3));
    assert_eq!(records[0].request_id, answer.provenance.request_id);
}

#[tokio::test]
async fn test_rejection_feeds_back_into_retry() {
    let db = FinanceDb::new();
    let second = "SELECT date, amount_clp FROM expenses ORDER BY amount_clp DESC LIMIT 2";
    let backend = ScriptedGenerator::new(
        &["SELECT date, amount_clp FROM transactions", second],
        "Your two largest expenses were 25,000 and 12,000 CLP.",
    );
    let (orchestrator, log) = orchestrator(&db, backend.clone());

    let answer = orchestrator.answer("What were my biggest expenses?").await.unwrap();

    assert_eq!(answer.attempts_made, 2);
    assert_eq!(answer.query_used, second);
    assert_eq!(answer.packaged_result.rows[0][1], CellValue::Real(25000.0));

    let first = &answer.provenance.attempts[0];
    assert_eq!(first.attempt.attempt_index, 1);
    assert_eq!(
        first.verdict,
        GuardVerdict::Rejected {
            violations: BTreeSet::from([ViolationKind::UnknownTable])
        }
    );
    assert!(answer.provenance.attempts[1].verdict.is_approved());

    let prompts = backend.sql_prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].user.contains("UnknownTable"));
    assert!(prompts[1].user.contains("UnknownTable"));

    assert_eq!(log.records()[0].verdicts.len(), 2);
}

#[tokio::test]
async fn test_self_aliased_unknown_column_is_retried() {
    let db = FinanceDb::new();
    let second = "SELECT SUM(amount_clp) AS amount FROM expenses";
    let backend = ScriptedGenerator::new(
        &["SELECT SUM(amount) AS amount FROM expenses", second],
        "You spent 40,580 CLP in total.",
    );
    let (orchestrator, _log) = orchestrator(&db, backend.clone());

    let answer = orchestrator.answer("How much did I spend overall?").await.unwrap();

    assert_eq!(answer.attempts_made, 2);
    assert_eq!(answer.query_used, format!("{second} LIMIT 100"));
    assert_eq!(
        answer.provenance.attempts[0].verdict,
        GuardVerdict::Rejected {
            violations: BTreeSet::from([ViolationKind::UnknownColumn])
        }
    );
    assert_eq!(answer.packaged_result.rows, vec![vec![CellValue::Real(40580.0)]]);
    assert_eq!(answer.packaged_result.result_shape, ResultShape::ScalarAggregate);
    assert!(answer.packaged_result.totals.is_empty());

    let summary_prompts = backend.summary_prompts();
    assert_eq!(summary_prompts.len(), 1);
    assert!(summary_prompts[0].user.contains("Query Type: scalar_aggregate"));
}

#[tokio::test]
async fn test_grouped_answer_has_no_totals() {
    let db = FinanceDb::new();
    let backend = ScriptedGenerator::new(
        &["SELECT category, SUM(amount_clp) AS spent FROM expenses GROUP BY category ORDER BY spent DESC"],
        "Food led with 37,000 CLP.",
    );
    let (orchestrator, _log) = orchestrator(&db, backend.clone());

    let answer = orchestrator.answer("Spending by category").await.unwrap();

    assert_eq!(answer.packaged_result.result_shape, ResultShape::GroupedAggregate);
    assert_eq!(answer.packaged_result.row_count, 3);
    assert!(answer.packaged_result.totals.is_empty());
    assert_eq!(answer.summary, SummaryStatus::Generated);
    assert!(backend.summary_prompts()[0]
        .user
        .contains("Query Type: grouped_aggregate"));
}

#[tokio::test]
async fn test_multiple_statements_exhaust_attempts() {
    let db = FinanceDb::new();
    let backend = ScriptedGenerator::new(
        &["SELECT date FROM expenses; SELECT date FROM incomes"],
        "unused",
    );
    let (orchestrator, log) = orchestrator(&db, backend.clone());

    let failure = orchestrator.answer("List all dates").await.unwrap_err();

    let Failure::GuardRejected { attempts } = &failure else {
        panic!("expected guard rejection, got {failure:?}");
    };
    assert_eq!(attempts.len(), 3);
    for record in attempts {
        assert_eq!(
            record.verdict.violations(),
            BTreeSet::from([ViolationKind::MultipleStatements])
        );
    }
    assert_eq!(backend.sql_prompts().len(), 3);
    assert!(backend.summary_prompts().is_empty());

    let records = log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, "guard_rejected");
    assert_eq!(records[0].final_query, None);
    assert_eq!(records[0].row_count, None);
}

#[tokio::test]
async fn test_execution_timeout_is_not_retried() {
    let db = FinanceDb::new();
    let backend = ScriptedGenerator::new(
        &["WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n) SELECT COUNT(*) FROM n"],
        "unused",
    );
    let mut config = db.config();
    config.executor.timeout_ms = 100;
    let log = MemoryQueryLog::new();
    let orchestrator =
        Orchestrator::new(&config, db.schema(), backend.clone(), Arc::new(log.clone()));

    let failure = orchestrator.answer("Count forever").await.unwrap_err();

    assert_eq!(failure.kind(), "execution_timeout");
    assert_eq!(failure.attempts().len(), 1);
    assert_eq!(backend.sql_prompts().len(), 1);
    assert!(backend.summary_prompts().is_empty());
    assert!(log.records()[0].final_query.is_some());
}

#[tokio::test]
async fn test_empty_result_bypasses_summarizer() {
    let db = FinanceDb::new();
    let backend = ScriptedGenerator::new(
        &["SELECT date, amount_clp FROM expenses WHERE category = 'Travel'"],
        "You spent 1,000,000 CLP on travel.",
    );
    let (orchestrator, _log) = orchestrator(&db, backend.clone());

    let answer = orchestrator.answer("How much did I spend on travel?").await.unwrap();

    assert_eq!(answer.packaged_result.row_count, 0);
    assert_eq!(answer.summary_text.as_deref(), Some(EMPTY_RESULT_SUMMARY));
    assert_eq!(answer.summary, SummaryStatus::EmptyResult);
    assert!(backend.summary_prompts().is_empty());
}

#[tokio::test]
async fn test_invented_figures_are_replaced() {
    let db = FinanceDb::new();
    let backend = ScriptedGenerator::new(&[APRIL_EXPENSES], "You spent 999,999 CLP in April.");
    let (orchestrator, _log) = orchestrator(&db, backend);

    let answer = orchestrator.answer("How much did I spend in April?").await.unwrap();

    assert_eq!(
        answer.summary,
        SummaryStatus::Ungrounded {
            values: vec!["999,999".to_string()]
        }
    );
    let text = answer.summary_text.unwrap();
    assert!(text.starts_with("The query returned 3 rows"));
    assert!(!text.contains("999,999"));
}

#[tokio::test]
async fn test_summary_failure_still_answers() {
    let db = FinanceDb::new();
    let backend = ScriptedGenerator::with_summary(
        &[APRIL_EXPENSES],
        Err(CapabilityError::unavailable("connection refused")),
    );
    let (orchestrator, _log) = orchestrator(&db, backend);

    let answer = orchestrator.answer("Show April expenses").await.unwrap();

    assert_eq!(answer.summary_text, None);
    assert!(matches!(answer.summary, SummaryStatus::Unavailable { .. }));
    assert_eq!(answer.packaged_result.row_count, 3);
}

#[tokio::test]
async fn test_generator_unavailable_fails_fast() {
    let db = FinanceDb::new();
    let log = MemoryQueryLog::new();
    let orchestrator = Orchestrator::new(
        &db.config(),
        db.schema(),
        Arc::new(Unreachable(CapabilityError::Timeout {
            after: Duration::from_secs(30),
        })),
        Arc::new(log.clone()),
    );

    let failure = orchestrator.answer("Show expenses").await.unwrap_err();

    let Failure::GeneratorUnavailable { cause, attempts } = &failure else {
        panic!("expected generator failure, got {failure:?}");
    };
    assert!(cause.is_timeout());
    assert!(attempts.is_empty());
    assert_eq!(log.records()[0].outcome, "generator_unavailable");
}

#[tokio::test]
async fn test_write_attempts_never_reach_database() {
    let db = FinanceDb::new();
    let backend = ScriptedGenerator::new(&["DELETE FROM expenses"], "unused");
    let (orchestrator, _log) = orchestrator(&db, backend);

    let failure = orchestrator.answer("Delete my expenses").await.unwrap_err();
    assert_eq!(failure.kind(), "guard_rejected");
    assert!(failure.last_violations().contains(&ViolationKind::NotASelect));

    let conn = rusqlite::Connection::open(&db.path).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM expenses", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 4);
}

#[tokio::test]
async fn test_one_record_per_question() {
    let db = FinanceDb::new();
    let backend = ScriptedGenerator::new(&[APRIL_EXPENSES], "3 expenses.");
    let (orchestrator, log) = orchestrator(&db, backend);

    orchestrator.answer("Show April expenses").await.unwrap();
    orchestrator.answer("").await.unwrap_err();
    orchestrator.answer("Show April expenses again").await.unwrap();

    let records = log.records();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].outcome, "empty_question");
    assert_ne!(records[0].request_id, records[2].request_id);
}
