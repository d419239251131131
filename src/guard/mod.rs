//! # Query Guard
//!
//! The safety boundary between generated query text and the database.
//!
//! Checks run in a fixed order and the first failing step wins; every
//! violation found at that step is reported so a retry can address all of
//! them at once:
//!
//! 1. Exactly one statement that parses (`SyntaxError`, `MultipleStatements`)
//! 2. The statement is a read (`NotASelect`)
//! 3. Every table and column exists (`UnknownTable`, `UnknownColumn`)
//! 4. No forbidden keyword or function (`ForbiddenKeyword`, `ForbiddenFunction`)
//! 5. The top-level query is bounded by the row cap; a missing, too-large or
//!    computed limit is replaced in the parsed query instead of rejected
//!
//! Forbidden keywords are found on the token stream up front and attached to
//! whichever step rejects, so a write keyword is always reported even when
//! the statement also fails to parse.

mod lexer;
mod walker;

use crate::schema::SchemaModel;
use lexer::TokenStream;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, Query, Statement, Value, ValueWithSpan};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::fmt;
use walker::{References, Resolver};

pub use lexer::FORBIDDEN_KEYWORDS;
pub use walker::FORBIDDEN_FUNCTIONS;

/// Why a candidate query was (or would have been) refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    NotASelect,
    MultipleStatements,
    UnknownTable,
    UnknownColumn,
    ForbiddenKeyword,
    ForbiddenFunction,
    SyntaxError,
    /// Corrected in place, never part of a rejection
    RowLimitMissing,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::NotASelect => "NotASelect",
            ViolationKind::MultipleStatements => "MultipleStatements",
            ViolationKind::UnknownTable => "UnknownTable",
            ViolationKind::UnknownColumn => "UnknownColumn",
            ViolationKind::ForbiddenKeyword => "ForbiddenKeyword",
            ViolationKind::ForbiddenFunction => "ForbiddenFunction",
            ViolationKind::SyntaxError => "SyntaxError",
            ViolationKind::RowLimitMissing => "RowLimitMissing",
        }
    }

    /// Corrective instruction fed back to the generator on retry
    pub fn guidance(&self) -> &'static str {
        match self {
            ViolationKind::NotASelect => "write a single SELECT (optionally WITH ... SELECT) statement",
            ViolationKind::MultipleStatements => {
                "return exactly one statement with nothing after it"
            }
            ViolationKind::UnknownTable => "use only the tables and views listed in the schema",
            ViolationKind::UnknownColumn => {
                "use only columns listed for each table; quote text values with single quotes"
            }
            ViolationKind::ForbiddenKeyword => {
                "do not use write, DDL or administrative keywords anywhere in the query"
            }
            ViolationKind::ForbiddenFunction => {
                "do not call file, extension or randomness functions"
            }
            ViolationKind::SyntaxError => "write syntactically valid SQLite",
            ViolationKind::RowLimitMissing => "end the query with a LIMIT clause",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GuardVerdict {
    Approved {
        final_query_text: String,
        /// The row limit was appended or tightened by the guard
        row_limit_injected: bool,
    },
    Rejected {
        violations: BTreeSet<ViolationKind>,
    },
}

impl GuardVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, GuardVerdict::Approved { .. })
    }

    pub fn final_query_text(&self) -> Option<&str> {
        match self {
            GuardVerdict::Approved {
                final_query_text, ..
            } => Some(final_query_text),
            GuardVerdict::Rejected { .. } => None,
        }
    }

    /// Empty for an approval
    pub fn violations(&self) -> BTreeSet<ViolationKind> {
        match self {
            GuardVerdict::Approved { .. } => BTreeSet::new(),
            GuardVerdict::Rejected { violations } => violations.clone(),
        }
    }
}

/// Validates candidate queries against a schema and row cap
#[derive(Debug, Clone)]
pub struct QueryGuard {
    row_cap: usize,
}

impl QueryGuard {
    pub fn new(row_cap: usize) -> Self {
        QueryGuard { row_cap }
    }

    pub fn row_cap(&self) -> usize {
        self.row_cap
    }

    pub fn validate(&self, candidate: &str, schema: &SchemaModel) -> GuardVerdict {
        let verdict = self.check(candidate, schema);
        match &verdict {
            GuardVerdict::Approved {
                row_limit_injected, ..
            } => tracing::debug!(row_limit_injected, "guard_approved"),
            GuardVerdict::Rejected { violations } => {
                tracing::debug!(violations = ?violations, "guard_rejected");
            }
        }
        verdict
    }

    fn check(&self, candidate: &str, schema: &SchemaModel) -> GuardVerdict {
        // Step 1: lexical pass
        let tokens = match TokenStream::tokenize(candidate) {
            Ok(tokens) => tokens,
            Err(_) => return reject([ViolationKind::SyntaxError], false),
        };
        let keyword_hit = !tokens.forbidden_keywords().is_empty();

        if tokens.is_empty() {
            return reject([ViolationKind::SyntaxError], keyword_hit);
        }
        if tokens.has_trailing_statement() || tokens.has_adjacent_statement() {
            return reject([ViolationKind::MultipleStatements], keyword_hit);
        }

        let mut statements = match Parser::parse_sql(&SQLiteDialect {}, candidate) {
            Ok(statements) => statements,
            Err(_) => return reject([ViolationKind::SyntaxError], keyword_hit),
        };
        if statements.len() > 1 {
            return reject([ViolationKind::MultipleStatements], keyword_hit);
        }
        let Some(statement) = statements.pop() else {
            return reject([ViolationKind::SyntaxError], keyword_hit);
        };

        // Step 2: read-only root
        let Statement::Query(mut query) = statement else {
            return reject([ViolationKind::NotASelect], keyword_hit);
        };

        // Step 3: schema resolution
        let unresolved = Resolver::resolve(&query, schema);
        if !unresolved.is_empty() {
            return reject(unresolved, keyword_hit);
        }

        // Step 4: forbidden constructs
        let mut forbidden = References::collect(&*query).forbidden();
        if keyword_hit {
            forbidden.insert(ViolationKind::ForbiddenKeyword);
        }
        if !forbidden.is_empty() {
            return reject(forbidden, false);
        }

        // Step 5: row limit
        let cap = self.row_cap;
        if literal_limit(&query).is_some_and(|n| n <= cap as u64) {
            return GuardVerdict::Approved {
                final_query_text: if tokens.has_comments() {
                    query.to_string()
                } else {
                    strip_terminators(candidate).to_string()
                },
                row_limit_injected: false,
            };
        }
        query.limit = Some(Expr::value(Value::Number(cap.to_string(), false)));
        GuardVerdict::Approved {
            final_query_text: query.to_string(),
            row_limit_injected: true,
        }
    }
}

/// `LIMIT n` with a plain non-negative literal
fn literal_limit(query: &Query) -> Option<u64> {
    match &query.limit {
        Some(Expr::Value(ValueWithSpan {
            value: Value::Number(text, _),
            ..
        })) => text.parse().ok(),
        _ => None,
    }
}

fn reject(
    violations: impl IntoIterator<Item = ViolationKind>,
    keyword_hit: bool,
) -> GuardVerdict {
    let mut violations: BTreeSet<ViolationKind> = violations.into_iter().collect();
    if keyword_hit {
        violations.insert(ViolationKind::ForbiddenKeyword);
    }
    GuardVerdict::Rejected { violations }
}

fn strip_terminators(sql: &str) -> &str {
    let mut candidate = sql.trim();
    while let Some(stripped) = candidate.strip_suffix(';') {
        candidate = stripped.trim_end();
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::finance_schema;

    fn validate(sql: &str) -> GuardVerdict {
        QueryGuard::new(500).validate(sql, &finance_schema())
    }

    fn violations(sql: &str) -> BTreeSet<ViolationKind> {
        validate(sql).violations()
    }

    #[test]
    fn test_approves_and_appends_limit() {
        let verdict = validate("SELECT date, category, amount_clp FROM expenses WHERE amount_clp > 100");
        let GuardVerdict::Approved {
            final_query_text,
            row_limit_injected,
        } = verdict
        else {
            panic!("expected approval");
        };
        assert!(row_limit_injected);
        assert!(final_query_text.ends_with("LIMIT 500"));
        assert!(final_query_text.contains("FROM expenses"));
    }

    #[test]
    fn test_bounded_limit_kept_verbatim() {
        let sql = "SELECT date FROM expenses ORDER BY amount_clp DESC LIMIT 5";
        assert_eq!(
            validate(&format!("{sql};")),
            GuardVerdict::Approved {
                final_query_text: sql.to_string(),
                row_limit_injected: false,
            }
        );
    }

    #[test]
    fn test_oversized_limit_is_replaced() {
        assert_eq!(
            validate("SELECT date FROM expenses ORDER BY date LIMIT 100000 OFFSET 2")
                .final_query_text(),
            Some("SELECT date FROM expenses ORDER BY date LIMIT 500 OFFSET 2")
        );
        assert_eq!(
            validate("SELECT date, date FROM expenses LIMIT -1").final_query_text(),
            Some("SELECT date, date FROM expenses LIMIT 500")
        );
    }

    #[test]
    fn test_offset_without_limit_gets_one() {
        assert_eq!(
            validate("SELECT date FROM expenses OFFSET 3").final_query_text(),
            Some("SELECT date FROM expenses LIMIT 500 OFFSET 3")
        );
    }

    #[test]
    fn test_non_select_rejected() {
        assert_eq!(
            violations("DELETE FROM expenses"),
            BTreeSet::from([ViolationKind::NotASelect, ViolationKind::ForbiddenKeyword])
        );
        assert!(violations("PRAGMA table_info(expenses)").contains(&ViolationKind::ForbiddenKeyword));
    }

    #[test]
    fn test_multiple_statements_rejected() {
        assert_eq!(
            violations("SELECT date FROM expenses; SELECT date FROM incomes"),
            BTreeSet::from([ViolationKind::MultipleStatements])
        );
        assert_eq!(
            violations("SELECT date FROM expenses SELECT date FROM incomes"),
            BTreeSet::from([ViolationKind::MultipleStatements])
        );
        assert_eq!(
            violations("SELECT date FROM expenses; DROP TABLE expenses"),
            BTreeSet::from([
                ViolationKind::MultipleStatements,
                ViolationKind::ForbiddenKeyword
            ])
        );
    }

    #[test]
    fn test_syntax_error() {
        assert_eq!(
            violations("SELEC date FROM expenses"),
            BTreeSet::from([ViolationKind::SyntaxError])
        );
        assert_eq!(violations("   "), BTreeSet::from([ViolationKind::SyntaxError]));
    }

    #[test]
    fn test_unknown_references() {
        assert_eq!(
            violations("SELECT * FROM transactions"),
            BTreeSet::from([ViolationKind::UnknownTable])
        );
        assert_eq!(
            violations("SELECT amount FROM expenses"),
            BTreeSet::from([ViolationKind::UnknownColumn])
        );
        assert_eq!(
            violations("SELECT SUM(amount) AS amount FROM expenses"),
            BTreeSet::from([ViolationKind::UnknownColumn])
        );
    }

    #[test]
    fn test_forbidden_function_rejected() {
        assert_eq!(
            violations("SELECT randomblob(1000000000) FROM expenses"),
            BTreeSet::from([ViolationKind::ForbiddenFunction])
        );
    }

    #[test]
    fn test_keyword_inside_literal_is_fine() {
        assert!(validate("SELECT date FROM expenses WHERE description LIKE '%drop table%'")
            .is_approved());
    }

    #[test]
    fn test_comment_cannot_hide_second_statement() {
        assert_eq!(
            violations("SELECT date FROM expenses /* ok */; DELETE FROM expenses"),
            BTreeSet::from([
                ViolationKind::MultipleStatements,
                ViolationKind::ForbiddenKeyword
            ])
        );
    }

    #[test]
    fn test_verdict_serialization() {
        let json = serde_json::to_value(validate("SELECT * FROM transactions")).unwrap();
        assert_eq!(json["verdict"], "rejected");
        assert_eq!(json["violations"][0], "UnknownTable");
    }
}
