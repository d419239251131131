//! Grounding check for generated summaries.
//!
//! A summary is grounded when every number, ISO date and double-quoted
//! string it mentions can be found in the packaged result: its cells, its
//! totals, or its row count. Numbers may carry thousand separators (`12,000`
//! or `12.000`) and may be rounded to the precision they are written with.

use crate::execution::CellValue;
use crate::packager::PackagedResult;
use regex::Regex;
use std::sync::OnceLock;

fn iso_date() -> &'static Regex {
    static DATE: OnceLock<Regex> = OnceLock::new();
    DATE.get_or_init(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").expect("static regex"))
}

fn quoted() -> &'static Regex {
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    QUOTED.get_or_init(|| Regex::new(r#""([^"]+)"|“([^”]+)”"#).expect("static regex"))
}

fn number() -> &'static Regex {
    // A leading letter or underscore marks an identifier such as `q1`; those are skipped
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    NUMBER.get_or_init(|| Regex::new(r"[A-Za-z_]*\d+(?:[.,]\d+)*").expect("static regex"))
}

/// Values of one packaged result that a summary may cite
struct Facts {
    numbers: Vec<f64>,
    texts: Vec<String>,
}

impl Facts {
    fn from_result(result: &PackagedResult) -> Self {
        let mut numbers = vec![result.row_count as f64];
        let mut texts: Vec<String> = result.columns.iter().map(|c| c.to_lowercase()).collect();

        for cell in result.rows.iter().flatten() {
            match cell {
                CellValue::Integer(_) | CellValue::Real(_) => {
                    numbers.extend(cell.as_f64().map(f64::abs));
                }
                CellValue::Text(text) => {
                    for literal in numeric_literals(text) {
                        numbers.extend(interpretations(literal).into_iter().map(|(v, _)| v));
                    }
                    texts.push(text.to_lowercase());
                }
                CellValue::Null | CellValue::Blob(_) => {}
            }
        }
        numbers.extend(result.totals.values().map(|v| v.abs()));

        Facts { numbers, texts }
    }

    fn has_text(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        !needle.is_empty() && self.texts.iter().any(|t| t.contains(&needle))
    }

    fn has_number(&self, literal: &str) -> bool {
        interpretations(literal).into_iter().any(|(value, decimals)| {
            let tolerance = 0.5 * 10f64.powi(-(decimals as i32)) + 1e-9;
            self.numbers.iter().any(|n| (n - value).abs() <= tolerance)
        })
    }
}

/// Values cited in `summary` that do not occur in `result`, in order of appearance
pub fn ungrounded_values(summary: &str, result: &PackagedResult) -> Vec<String> {
    let facts = Facts::from_result(result);
    let mut missing: Vec<String> = Vec::new();
    let mut note = |value: &str| {
        if !missing.iter().any(|m| m == value) {
            missing.push(value.to_string());
        }
    };

    for m in iso_date().find_iter(summary) {
        if !facts.has_text(m.as_str()) {
            note(m.as_str());
        }
    }
    for captures in quoted().captures_iter(summary) {
        if let Some(inner) = captures.get(1).or_else(|| captures.get(2)) {
            if !facts.has_text(inner.as_str()) {
                note(inner.as_str());
            }
        }
    }

    let without_dates = iso_date().replace_all(summary, " ");
    for literal in numeric_literals(&without_dates) {
        if !facts.has_number(literal) {
            note(literal);
        }
    }

    missing
}

/// Deterministic summary built only from the result itself
pub fn fallback_summary(result: &PackagedResult) -> String {
    let plural = if result.row_count == 1 { "row" } else { "rows" };
    let mut text = format!(
        "The query returned {} {plural} (columns: {}).",
        result.row_count,
        result.columns.join(", ")
    );
    for (column, total) in &result.totals {
        text.push_str(&format!(" Total {column}: {total}."));
    }
    if result.truncated {
        text.push_str(" More rows matched than are shown.");
    }
    text
}

fn numeric_literals(text: &str) -> impl Iterator<Item = &str> {
    number()
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|s| s.starts_with(|c: char| c.is_ascii_digit()))
}

/// Candidate values of a written number, each with its displayed decimal places
fn interpretations(literal: &str) -> Vec<(f64, usize)> {
    let mut out = Vec::new();
    let decimals_after = |s: &str, sep: char| s.rsplit_once(sep).map_or(0, |(_, d)| d.len());

    // `12,000.50`: comma groups, dot decimals
    let english = literal.replace(',', "");
    if let Ok(value) = english.parse::<f64>() {
        out.push((value, decimals_after(&english, '.')));
    }

    // `12.000,50`: dot groups, comma decimals
    if literal.contains('.') || literal.contains(',') {
        let european = literal.replace('.', "").replace(',', ".");
        if let Ok(value) = european.parse::<f64>() {
            out.push((value, decimals_after(&european, '.')));
        }
    }

    out
}
