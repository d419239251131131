//! Natural-language summaries of packaged results.
//!
//! The generator sees a bounded preview shaped by the result kind: scalar
//! aggregates in full, the leading groups of a grouped aggregate, or the
//! first detail rows plus their totals. Its answer is checked against the
//! full packaged result before it reaches the caller. Empty results never
//! reach the generator at all.

use crate::config::SummaryConfig;
use crate::generation::{generate_with_timeout, GenerationParams, Prompt, TextGenerator};
use crate::grounding;
use crate::packager::{PackagedResult, ResultShape};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Returned verbatim for results with no rows
pub const EMPTY_RESULT_SUMMARY: &str = "No matching data was found for your question.";

const SUMMARY_PROMPT: &str = "\
You are a helpful financial assistant. Summarize database query results
into a clear, concise and accurate answer of one or two sentences.

Guidelines:
- Use ONLY the numbers, dates and names present in the query results
- Include relevant totals and date ranges when available
- When only some rows are shown, use row_count and totals for overall figures
- Keep the summary factual and free from speculation
- Use plain language a non-technical person would understand
- Never make up or assume information not present in the results
- For monetary values, include the currency (CLP for Chilean pesos)";

/// How the summary text came to be
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SummaryStatus {
    /// Produced by the generator and fully grounded
    Generated,
    /// Zero rows; the fixed message was used
    EmptyResult,
    /// Generator cited values absent from the result; a fallback was used
    Ungrounded { values: Vec<String> },
    /// Generator failed; no summary
    Unavailable { detail: String },
    /// Summaries are switched off
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub text: Option<String>,
    pub status: SummaryStatus,
}

pub struct Summarizer {
    backend: Arc<dyn TextGenerator>,
    params: GenerationParams,
    timeout: Duration,
    enabled: bool,
    max_groups: usize,
    preview_rows: usize,
}

impl Summarizer {
    pub fn new(backend: Arc<dyn TextGenerator>, config: &SummaryConfig, timeout: Duration) -> Self {
        Summarizer {
            backend,
            params: GenerationParams {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
            },
            timeout,
            enabled: config.enabled,
            max_groups: config.max_groups,
            preview_rows: config.preview_rows,
        }
    }

    /// Summarize `packaged` as an answer to `question`.
    ///
    /// Never fails: a generator error degrades to a summary-less answer.
    pub async fn summarize(&self, question: &str, query: &str, packaged: &PackagedResult) -> Summary {
        if packaged.is_empty() {
            return Summary {
                text: Some(EMPTY_RESULT_SUMMARY.to_string()),
                status: SummaryStatus::EmptyResult,
            };
        }
        if !self.enabled {
            return Summary {
                text: None,
                status: SummaryStatus::Disabled,
            };
        }

        let prompt = self.build_prompt(question, query, packaged);
        let text = match generate_with_timeout(self.backend.as_ref(), &prompt, self.params, self.timeout)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => return unavailable("generator returned an empty summary".to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "summary_unavailable");
                return unavailable(e.to_string());
            }
        };

        let missing = grounding::ungrounded_values(&text, packaged);
        if missing.is_empty() {
            Summary {
                text: Some(text),
                status: SummaryStatus::Generated,
            }
        } else {
            tracing::warn!(values = ?missing, "summary_ungrounded");
            Summary {
                text: Some(grounding::fallback_summary(packaged)),
                status: SummaryStatus::Ungrounded { values: missing },
            }
        }
    }

    fn build_prompt(&self, question: &str, query: &str, packaged: &PackagedResult) -> Prompt {
        let results = self.preview(packaged);
        Prompt {
            system: SUMMARY_PROMPT.to_string(),
            user: format!(
                "Question: {}\nSQL Query: {query}\nQuery Type: {}\nQuery Results:\n{results}",
                question.trim(),
                packaged.result_shape
            ),
        }
    }

    fn preview(&self, packaged: &PackagedResult) -> serde_json::Value {
        let shown = match packaged.result_shape {
            ResultShape::ScalarAggregate => packaged.rows.len(),
            ResultShape::GroupedAggregate => packaged.rows.len().min(self.max_groups),
            ResultShape::Detail => packaged.rows.len().min(self.preview_rows),
        };
        let mut results = serde_json::json!({
            "columns": packaged.columns,
            "rows": &packaged.rows[..shown],
            "rows_shown": shown,
            "row_count": packaged.row_count,
            "truncated": packaged.truncated,
        });
        if packaged.result_shape == ResultShape::Detail && !packaged.totals.is_empty() {
            results["totals"] = serde_json::json!(packaged.totals);
        }
        results
    }
}

fn unavailable(detail: String) -> Summary {
    Summary {
        text: None,
        status: SummaryStatus::Unavailable { detail },
    }
}
