//! Result packaging: raw rows to a bounded, display-ready structure.

use crate::config::PackagerConfig;
use crate::execution::{CellValue, ColumnKind, QueryResult};
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Expr, Function, FunctionArguments, GroupByExpr, ObjectNamePart, Query, SetExpr, Statement,
    Visit, Visitor,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;
use std::time::Duration;

/// What the rows of a result stand for, read from the top-level SELECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    /// Aggregates without GROUP BY (one summary row)
    ScalarAggregate,
    /// One row per group
    GroupedAggregate,
    /// Individual records
    #[default]
    Detail,
}

impl ResultShape {
    /// Classify an approved query. Anything that does not parse as a single
    /// plain SELECT (set operations included) counts as detail.
    pub fn classify(sql: &str) -> Self {
        let Ok(statements) = Parser::parse_sql(&SQLiteDialect {}, sql) else {
            return ResultShape::Detail;
        };
        let [Statement::Query(query)] = statements.as_slice() else {
            return ResultShape::Detail;
        };
        let SetExpr::Select(select) = query.body.as_ref() else {
            return ResultShape::Detail;
        };

        let grouped = match &select.group_by {
            GroupByExpr::All(_) => true,
            GroupByExpr::Expressions(exprs, _) => !exprs.is_empty(),
        };
        if grouped {
            return ResultShape::GroupedAggregate;
        }

        let mut finder = AggregateFinder::default();
        if select.projection.visit(&mut finder).is_break() {
            ResultShape::ScalarAggregate
        } else {
            ResultShape::Detail
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultShape::ScalarAggregate => "scalar_aggregate",
            ResultShape::GroupedAggregate => "grouped_aggregate",
            ResultShape::Detail => "detail",
        }
    }
}

impl fmt::Display for ResultShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stops at the first aggregate call outside any subquery
#[derive(Default)]
struct AggregateFinder {
    depth: usize,
}

impl Visitor for AggregateFinder {
    type Break = ();

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Function(function) if self.depth == 0 && is_aggregate(function) => {
                ControlFlow::Break(())
            }
            _ => ControlFlow::Continue(()),
        }
    }
}

fn is_aggregate(function: &Function) -> bool {
    // window calls keep one row per input row
    if function.over.is_some() {
        return false;
    }
    let Some(ObjectNamePart::Identifier(name)) = function.name.0.last() else {
        return false;
    };
    let arity = match &function.args {
        FunctionArguments::List(list) => list.args.len(),
        _ => 0,
    };
    match name.value.to_ascii_lowercase().as_str() {
        "count" | "sum" | "avg" | "total" | "group_concat" | "string_agg" => true,
        // min/max with several arguments are the scalar functions
        "min" | "max" => arity == 1,
        _ => false,
    }
}

/// Display-ready projection of a [`QueryResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackagedResult {
    pub columns: Vec<String>,
    /// Kind of the first non-null value per column
    pub column_kinds: Vec<ColumnKind>,
    pub rows: Vec<Vec<CellValue>>,
    pub row_count: usize,
    pub truncated: bool,
    #[serde(default)]
    pub result_shape: ResultShape,
    /// Sums of the configured total columns, multi-row detail results only
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub totals: BTreeMap<String, f64>,
    pub elapsed_ms: u64,
}

impl PackagedResult {
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Pure transformation from raw to packaged results
#[derive(Debug, Clone)]
pub struct ResultPackager {
    max_cell_chars: usize,
    total_columns: Vec<String>,
}

impl Default for ResultPackager {
    fn default() -> Self {
        ResultPackager::new(&PackagerConfig::default())
    }
}

impl ResultPackager {
    pub fn new(config: &PackagerConfig) -> Self {
        ResultPackager {
            max_cell_chars: config.max_cell_chars,
            total_columns: config.total_columns.clone(),
        }
    }

    pub fn package(
        &self,
        result: QueryResult,
        result_shape: ResultShape,
        elapsed: Duration,
    ) -> PackagedResult {
        let column_kinds = (0..result.columns.len())
            .map(|idx| {
                result
                    .rows
                    .iter()
                    .filter_map(|row| row.get(idx))
                    .find(|cell| !cell.is_null())
                    .map_or(ColumnKind::Null, CellValue::kind)
            })
            .collect();

        let totals = if result_shape == ResultShape::Detail && result.rows.len() > 1 {
            self.totals(&result)
        } else {
            BTreeMap::new()
        };

        let rows: Vec<Vec<CellValue>> = result
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(|cell| self.clip(cell)).collect())
            .collect();

        PackagedResult {
            columns: result.columns,
            column_kinds,
            row_count: rows.len(),
            rows,
            truncated: result.truncated,
            result_shape,
            totals,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    fn totals(&self, result: &QueryResult) -> BTreeMap<String, f64> {
        let mut totals = BTreeMap::new();
        for (idx, column) in result.columns.iter().enumerate() {
            if !self
                .total_columns
                .iter()
                .any(|c| c.eq_ignore_ascii_case(column))
            {
                continue;
            }
            let values: Vec<f64> = result
                .rows
                .iter()
                .filter_map(|row| row.get(idx).and_then(CellValue::as_f64))
                .collect();
            if !values.is_empty() {
                totals.insert(column.clone(), values.iter().sum());
            }
        }
        totals
    }

    fn clip(&self, cell: CellValue) -> CellValue {
        match cell {
            CellValue::Text(text)
                if self.max_cell_chars > 0 && text.chars().count() > self.max_cell_chars =>
            {
                let mut clipped: String = text.chars().take(self.max_cell_chars).collect();
                clipped.push('…');
                CellValue::Text(clipped)
            }
            other => other,
        }
    }
}
