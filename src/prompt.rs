//! Prompt construction for query generation.
//!
//! `build` is a pure function of its inputs: the same question, schema and
//! prior violations always yield the same prompt text.

use crate::config::PromptConfig;
use crate::generation::Prompt;
use crate::guard::ViolationKind;
use crate::schema::SchemaModel;
use std::collections::BTreeSet;
use std::fmt::Write;

const SYSTEM_PROMPT: &str = "\
You are a careful SQLite query writer for a personal finance database.

STRICT RULES:
1. Use ONLY the tables and columns listed in the schema.
2. Write exactly one read-only SELECT statement (a leading WITH clause is allowed).
3. Never use INSERT, UPDATE, DELETE, DROP, ALTER, CREATE, ATTACH, PRAGMA or any other write or administrative operation.
4. Never call file, extension or randomness functions (load_extension, readfile, writefile, random, randomblob).
5. Use SQLite date functions for relative dates (e.g. 'last month', 'this year').
6. Never return a constant SELECT (e.g. SELECT 1).

GUIDELINES:
- Prefer filtering on date, category, tags and description when relevant.
- Use the views in the schema when they already compute what is asked.
- Keep queries compact and idiomatic for SQLite.
- Use aggregate functions (SUM, AVG, COUNT) with clear aliases when summarizing.";

/// Conventions every finance prompt carries
const BUILTIN_CONVENTIONS: &[&str] = &[
    "Amounts are stored in Chilean pesos in the amount_clp column.",
    "Dates are ISO-8601 text (YYYY-MM-DD); compare them with date('now', ...) modifiers.",
    "Spending lives in expenses, earnings in incomes; both share the same columns.",
    "Category and tag matching should be case-insensitive (use LOWER or LIKE).",
];

struct FewShot {
    question: &'static str,
    query: &'static str,
    /// Every table the query reads, with the columns it names there
    uses: &'static [(&'static str, &'static [&'static str])],
}

impl FewShot {
    fn fits(&self, schema: &SchemaModel) -> bool {
        self.uses.iter().all(|(table, columns)| {
            schema.has_table(table) && columns.iter().all(|c| schema.has_column(table, c))
        })
    }
}

const FEW_SHOTS: &[FewShot] = &[
    FewShot {
        question: "How much did I spend on food last month?",
        query: "SELECT SUM(amount_clp) AS total_clp FROM expenses \
                WHERE LOWER(category) = 'food' \
                AND date >= date('now', 'start of month', '-1 month') \
                AND date < date('now', 'start of month')",
        uses: &[("expenses", &["amount_clp", "category", "date"])],
    },
    FewShot {
        question: "List my incomes this year",
        query: "SELECT date, description, amount_clp FROM incomes \
                WHERE date >= date('now', 'start of year') ORDER BY date",
        uses: &[("incomes", &["date", "description", "amount_clp"])],
    },
    FewShot {
        question: "How much have I earned in total?",
        query: "SELECT SUM(amount_clp) AS total_clp FROM incomes",
        uses: &[("incomes", &["amount_clp"])],
    },
    FewShot {
        question: "What are my five biggest expenses?",
        query: "SELECT date, category, description, amount_clp FROM expenses \
                ORDER BY amount_clp DESC LIMIT 5",
        uses: &[("expenses", &["date", "category", "description", "amount_clp"])],
    },
];

/// Composes generation prompts from the question, schema and retry feedback
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    conventions: Vec<String>,
    max_samples_per_table: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        PromptBuilder::new(&PromptConfig::default())
    }
}

impl PromptBuilder {
    pub fn new(config: &PromptConfig) -> Self {
        PromptBuilder {
            conventions: config.conventions.clone(),
            max_samples_per_table: config.max_samples_per_table,
        }
    }

    /// Build the prompt for one generation attempt.
    ///
    /// `prior_violations` is the violation set of the previous rejected
    /// attempt; it is empty on the first attempt.
    pub fn build(
        &self,
        question: &str,
        schema: &SchemaModel,
        prior_violations: &BTreeSet<ViolationKind>,
    ) -> Prompt {
        let mut user = String::new();

        let _ = writeln!(user, "User question:\n{}\n", question.trim());
        let _ = writeln!(user, "Database schema:\n{schema}");

        let samples = self.render_samples(schema);
        if !samples.is_empty() {
            let _ = writeln!(user, "Sample rows:\n{samples}");
        }

        user.push_str("Conventions:\n");
        for convention in BUILTIN_CONVENTIONS
            .iter()
            .copied()
            .chain(self.conventions.iter().map(String::as_str))
        {
            let _ = writeln!(user, "- {convention}");
        }
        user.push('\n');

        let shots: Vec<&FewShot> = FEW_SHOTS.iter().filter(|shot| shot.fits(schema)).collect();
        if !shots.is_empty() {
            user.push_str("Examples:\n");
            for shot in shots {
                let _ = writeln!(user, "Q: {}\nSQL: {}", shot.question, shot.query);
            }
            user.push('\n');
        }

        if !prior_violations.is_empty() {
            user.push_str("Your previous query was rejected for:\n");
            for violation in prior_violations {
                let _ = writeln!(user, "- {violation}: {}", violation.guidance());
            }
            user.push_str("Write a corrected query that avoids every problem above.\n\n");
        }

        user.push_str("Output:\nReturn ONLY the SQL query (no Markdown, no comments).");

        Prompt {
            system: SYSTEM_PROMPT.to_string(),
            user,
        }
    }

    fn render_samples(&self, schema: &SchemaModel) -> String {
        let mut out = String::new();
        if self.max_samples_per_table == 0 {
            return out;
        }
        for table in schema.tables() {
            for row in table.samples.iter().take(self.max_samples_per_table) {
                let _ = writeln!(out, "{}: {row}", table.name);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::finance_schema;

    fn builder() -> PromptBuilder {
        PromptBuilder::default()
    }

    #[test]
    fn test_build_is_deterministic() {
        let schema = finance_schema();
        let a = builder().build("Show expenses", &schema, &BTreeSet::new());
        let b = builder().build("Show expenses", &schema, &BTreeSet::new());
        assert_eq!(a, b);
    }

    #[test]
    fn test_schema_embedded() {
        let prompt = builder().build("Show expenses", &finance_schema(), &BTreeSet::new());
        assert!(prompt.user.contains("TABLE expenses(date DATE NOT NULL"));
        assert!(prompt.user.contains("VIEW monthly_balance"));
        assert!(prompt.user.contains("User question:\nShow expenses"));
        assert!(!prompt.user.contains("previous query was rejected"));
    }

    #[test]
    fn test_prior_violations_change_prompt() {
        let schema = finance_schema();
        let first = builder().build("q", &schema, &BTreeSet::new());
        let violations: BTreeSet<_> =
            [ViolationKind::UnknownTable, ViolationKind::UnknownColumn].into();
        let retry = builder().build("q", &schema, &violations);
        assert_ne!(first, retry);
        assert!(retry.user.contains("UnknownTable"));
        assert!(retry.user.contains("UnknownColumn"));
    }

    #[test]
    fn test_samples_are_truncated() {
        let mut schema = finance_schema();
        let rows = (0..10)
            .map(|i| serde_json::json!({ "amount_clp": i }))
            .collect::<Vec<_>>();
        schema = SchemaModel::new(
            schema
                .tables()
                .iter()
                .cloned()
                .map(|t| {
                    if t.name == "expenses" {
                        t.with_samples(rows.clone())
                    } else {
                        t
                    }
                })
                .collect(),
        );
        let config = PromptConfig {
            max_samples_per_table: 2,
            ..PromptConfig::default()
        };
        let prompt = PromptBuilder::new(&config).build("q", &schema, &BTreeSet::new());
        assert_eq!(prompt.user.matches("expenses: {").count(), 2);
    }

    #[test]
    fn test_few_shots_follow_schema() {
        let schema = SchemaModel::new(vec![crate::schema::TableDescriptor::new(
            "incomes",
            vec![crate::schema::ColumnDescriptor::new("amount_clp", "REAL", false)],
        )]);
        let prompt = builder().build("q", &schema, &BTreeSet::new());
        assert!(prompt.user.contains("How much have I earned in total?"));
        assert!(!prompt.user.contains("List my incomes this year"));
        assert!(!prompt.user.contains("biggest expenses"));
        assert!(!prompt.user.contains("SELECT date"));
        assert!(!prompt.user.contains("description"));
    }

    #[test]
    fn test_every_few_shot_fits_the_full_schema() {
        let prompt = builder().build("q", &finance_schema(), &BTreeSet::new());
        for shot in FEW_SHOTS {
            assert!(shot.fits(&finance_schema()), "{}", shot.question);
            assert!(prompt.user.contains(shot.question));
        }
    }

    #[test]
    fn test_few_shots_need_every_named_column() {
        let schema = SchemaModel::new(vec![crate::schema::TableDescriptor::new(
            "expenses",
            vec![
                crate::schema::ColumnDescriptor::new("date", "DATE", false),
                crate::schema::ColumnDescriptor::new("amount_clp", "REAL", false),
            ],
        )]);
        let prompt = builder().build("q", &schema, &BTreeSet::new());
        assert!(!prompt.user.contains("Examples:"));
    }

    #[test]
    fn test_custom_conventions_appended() {
        let config = PromptConfig {
            conventions: vec!["Transfers between own accounts are tagged 'transfer'.".to_string()],
            ..PromptConfig::default()
        };
        let prompt = PromptBuilder::new(&config).build("q", &finance_schema(), &BTreeSet::new());
        assert!(prompt.user.contains("- Transfers between own accounts"));
    }
}
