//! Shared fixtures: a scratch finance database and a scripted generator.

#![allow(dead_code)]

use async_trait::async_trait;
use finquery::generation::{CapabilityError, GenerationParams, Prompt, TextGenerator};
use finquery::{ColumnDescriptor, Config, SchemaModel, TableDescriptor};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const FINANCE_DDL: &str = "
    CREATE TABLE expenses (
        date DATE NOT NULL,
        category TEXT,
        tags TEXT,
        amount_clp REAL NOT NULL,
        description TEXT,
        day TEXT
    );
    CREATE TABLE incomes (
        date DATE NOT NULL,
        category TEXT,
        tags TEXT,
        amount_clp REAL NOT NULL,
        description TEXT,
        day TEXT
    );
    CREATE VIEW monthly_balance AS
        SELECT strftime('%Y-%m', date) AS month,
               SUM(CASE WHEN src = 'income' THEN amount_clp ELSE 0 END) AS income,
               SUM(CASE WHEN src = 'expense' THEN amount_clp ELSE 0 END) AS expense
        FROM (SELECT date, amount_clp, 'income' AS src FROM incomes
              UNION ALL
              SELECT date, amount_clp, 'expense' AS src FROM expenses)
        GROUP BY month;
    INSERT INTO expenses VALUES ('2024-04-03', 'Food', 'groceries', 12000.0, 'Supermarket', 'Wednesday');
    INSERT INTO expenses VALUES ('2024-04-10', 'Transport', 'metro', 3500.0, 'Metro card', 'Wednesday');
    INSERT INTO expenses VALUES ('2024-04-21', 'Food', 'restaurant', 25000.0, 'Dinner out', 'Sunday');
    INSERT INTO expenses VALUES ('2024-05-02', 'Health', NULL, 80.0, 'Pharmacy', 'Thursday');
    INSERT INTO incomes VALUES ('2024-04-30', 'Salary', NULL, 1500000.0, 'April salary', 'Tuesday');
";

/// The schema of [`FINANCE_DDL`] without touching disk
pub fn finance_schema() -> SchemaModel {
    let columns = || {
        vec![
            ColumnDescriptor::new("date", "DATE", false),
            ColumnDescriptor::new("category", "TEXT", true),
            ColumnDescriptor::new("tags", "TEXT", true),
            ColumnDescriptor::new("amount_clp", "REAL", false),
            ColumnDescriptor::new("description", "TEXT", true),
            ColumnDescriptor::new("day", "TEXT", true),
        ]
    };
    SchemaModel::new(vec![
        TableDescriptor::new("expenses", columns()),
        TableDescriptor::new("incomes", columns()),
        TableDescriptor::new(
            "monthly_balance",
            vec![
                ColumnDescriptor::new("month", "", true),
                ColumnDescriptor::new("income", "", true),
                ColumnDescriptor::new("expense", "", true),
            ],
        )
        .view(),
    ])
}

/// A scratch database populated with a handful of rows
pub struct FinanceDb {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl FinanceDb {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("finances.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(FINANCE_DDL).unwrap();
        FinanceDb { dir, path }
    }

    pub fn schema(&self) -> SchemaModel {
        let conn = Connection::open(&self.path).unwrap();
        SchemaModel::introspect(&conn, 2).unwrap()
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.database.path.clone_from(&self.path);
        config.guard.row_cap = 100;
        config.guard.max_attempts = 3;
        config
    }
}

/// Replays queued SQL replies in order (repeating the last one) and answers
/// every summary prompt with a fixed text
pub struct ScriptedGenerator {
    sql: Mutex<VecDeque<String>>,
    summary: Result<String, CapabilityError>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedGenerator {
    pub fn new(sql: &[&str], summary: &str) -> Arc<Self> {
        Self::with_summary(sql, Ok(summary.to_string()))
    }

    pub fn with_summary(sql: &[&str], summary: Result<String, CapabilityError>) -> Arc<Self> {
        Arc::new(ScriptedGenerator {
            sql: Mutex::new(sql.iter().map(ToString::to_string).collect()),
            summary,
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// Prompts that asked for SQL
    pub fn sql_prompts(&self) -> Vec<Prompt> {
        self.prompts
            .lock()
            .iter()
            .filter(|p| !is_summary_prompt(p))
            .cloned()
            .collect()
    }

    /// Prompts that asked for a summary
    pub fn summary_prompts(&self) -> Vec<Prompt> {
        self.prompts
            .lock()
            .iter()
            .filter(|p| is_summary_prompt(p))
            .cloned()
            .collect()
    }
}

fn is_summary_prompt(prompt: &Prompt) -> bool {
    prompt.user.contains("Query Results:")
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate_text(
        &self,
        prompt: &Prompt,
        _params: GenerationParams,
    ) -> Result<String, CapabilityError> {
        self.prompts.lock().push(prompt.clone());
        if is_summary_prompt(prompt) {
            return self.summary.clone();
        }
        let mut queue = self.sql.lock();
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        reply.ok_or_else(|| CapabilityError::unavailable("script exhausted"))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Always fails with the given error
pub struct Unreachable(pub CapabilityError);

#[async_trait]
impl TextGenerator for Unreachable {
    async fn generate_text(
        &self,
        _prompt: &Prompt,
        _params: GenerationParams,
    ) -> Result<String, CapabilityError> {
        Err(self.0.clone())
    }
}
