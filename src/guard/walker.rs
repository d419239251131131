//! AST walks over a parsed query.
//!
//! [`References`] gathers function calls and nested statements for the
//! forbidden-construct check. [`Resolver`] checks table and column names
//! against the schema one SELECT at a time: a column must come from the FROM
//! clause of its own SELECT or of an enclosing one, and a select-list alias
//! is only visible in ORDER BY, GROUP BY and HAVING.

use super::ViolationKind;
use crate::schema::SchemaModel;
use sqlparser::ast::{
    Expr, Ident, ObjectName, ObjectNamePart, Query, Select, SelectItem,
    SelectItemQualifiedWildcardKind, SetExpr, Statement, TableAlias, TableFactor, TableWithJoins,
    Visit, Visitor,
};
use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;

/// Functions that touch the filesystem, load code, or generate unbounded data
pub const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "load_extension",
    "readfile",
    "writefile",
    "edit",
    "fts3_tokenizer",
    "random",
    "randomblob",
    "zeroblob",
];

/// Names SQLite resolves without any table column behind them
const IMPLICIT_NAMES: &[&str] = &[
    "current_date",
    "current_time",
    "current_timestamp",
    "rowid",
    "oid",
    "_rowid_",
];

/// Function calls and nested statements anywhere in a statement, lower-cased
#[derive(Debug, Default)]
pub(crate) struct References {
    functions: BTreeSet<String>,
    nested_statements: usize,
}

impl References {
    pub(crate) fn collect<V: Visit>(node: &V) -> Self {
        let mut refs = References::default();
        let _ = node.visit(&mut refs);
        refs
    }

    /// Forbidden calls and nested write statements (step 4, AST half)
    pub(crate) fn forbidden(&self) -> BTreeSet<ViolationKind> {
        let mut violations = BTreeSet::new();
        if self
            .functions
            .iter()
            .any(|f| FORBIDDEN_FUNCTIONS.contains(&f.as_str()))
        {
            violations.insert(ViolationKind::ForbiddenFunction);
        }
        if self.nested_statements > 0 {
            violations.insert(ViolationKind::ForbiddenKeyword);
        }
        violations
    }

    pub(crate) fn functions(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(String::as_str)
    }
}

impl Visitor for References {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Function(function) = expr {
            if let Some(name) = last_part(&function.name) {
                self.functions.insert(name);
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        if !matches!(statement, Statement::Query(_)) {
            self.nested_statements += 1;
        }
        ControlFlow::Continue(())
    }
}

/// Output columns of a relation; `None` when they cannot be known statically
type Columns = Option<Vec<String>>;

#[derive(Debug)]
struct Relation {
    /// Alias, else the table name; `None` for an unaliased subquery
    name: Option<String>,
    columns: Columns,
}

impl Relation {
    fn has(&self, column: &str) -> bool {
        self.columns
            .as_ref()
            .is_none_or(|columns| columns.iter().any(|c| c == column))
    }
}

/// Names visible inside one SELECT
#[derive(Debug, Default)]
struct Scope {
    relations: Vec<Relation>,
    aliases: HashSet<String>,
}

impl Scope {
    /// A scope over the output of a compound query
    fn over(columns: Columns) -> Self {
        Scope {
            relations: vec![Relation {
                name: None,
                columns,
            }],
            aliases: HashSet::new(),
        }
    }
}

/// Scoped name resolution (step 3)
pub(crate) struct Resolver<'s> {
    schema: &'s SchemaModel,
    /// Innermost last
    scopes: Vec<Scope>,
    /// CTEs in view, innermost last
    ctes: Vec<(String, Columns)>,
    violations: BTreeSet<ViolationKind>,
}

impl<'s> Resolver<'s> {
    /// Unknown tables and columns of `query`
    pub(crate) fn resolve(query: &Query, schema: &'s SchemaModel) -> BTreeSet<ViolationKind> {
        let mut resolver = Resolver {
            schema,
            scopes: Vec::new(),
            ctes: Vec::new(),
            violations: BTreeSet::new(),
        };
        resolver.query(query);
        resolver.violations
    }

    /// Resolve `query` under the current scopes and return its output columns
    fn query(&mut self, query: &Query) -> Columns {
        let cte_mark = self.ctes.len();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = lower(&cte.alias.name);
                let declared = alias_columns(&cte.alias);
                if with.recursive {
                    self.ctes.push((name.clone(), declared.clone()));
                }
                let produced = self.query(&cte.query);
                if with.recursive {
                    self.ctes.pop();
                }
                self.ctes.push((name, declared.or(produced)));
            }
        }

        let (columns, order_scope) = self.set_expr(&query.body);
        if query.order_by.is_some() {
            self.scopes.push(order_scope);
            self.walk(&query.order_by, true);
            self.scopes.pop();
        }
        self.walk(&query.limit, false);
        self.walk(&query.offset, false);

        self.ctes.truncate(cte_mark);
        columns
    }

    /// Output columns plus the scope ORDER BY resolves against
    fn set_expr(&mut self, body: &SetExpr) -> (Columns, Scope) {
        match body {
            SetExpr::Select(select) => self.select(select),
            SetExpr::Query(query) => {
                let columns = self.query(query);
                (columns.clone(), Scope::over(columns))
            }
            SetExpr::SetOperation { left, right, .. } => {
                let (columns, _) = self.set_expr(left);
                self.set_expr(right);
                (columns.clone(), Scope::over(columns))
            }
            SetExpr::Values(values) => {
                self.walk(values, false);
                let width = values.rows.first().map_or(0, Vec::len);
                let columns = Some((1..=width).map(|i| format!("column{i}")).collect());
                (columns.clone(), Scope::over(columns))
            }
            // Writes nested in a query are reported by the forbidden check
            _ => (None, Scope::default()),
        }
    }

    fn select(&mut self, select: &Select) -> (Columns, Scope) {
        let mut scope = Scope::default();
        for table in &select.from {
            self.from_item(table, &mut scope);
        }
        scope.aliases = select
            .projection
            .iter()
            .filter_map(|item| match item {
                SelectItem::ExprWithAlias { alias, .. } => Some(lower(alias)),
                _ => None,
            })
            .collect();
        self.scopes.push(scope);

        for table in &select.from {
            self.join_constraints(table);
        }
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    self.walk(expr, false);
                }
                SelectItem::QualifiedWildcard(SelectItemQualifiedWildcardKind::ObjectName(name), _) => {
                    if self.qualified_relation(name).is_none() {
                        self.violations.insert(ViolationKind::UnknownTable);
                    }
                }
                SelectItem::QualifiedWildcard(..) | SelectItem::Wildcard(_) => {}
            }
        }
        self.walk(&select.selection, false);
        self.walk(&select.group_by, true);
        self.walk(&select.having, true);

        let columns = self.output_columns(select);
        let scope = self.scopes.pop().unwrap_or_default();
        (columns, scope)
    }

    /// Relations of one FROM item, resolved against the enclosing scopes only
    fn from_item(&mut self, table: &TableWithJoins, scope: &mut Scope) {
        self.relation(&table.relation, scope);
        for join in &table.joins {
            self.relation(&join.relation, scope);
        }
    }

    fn relation(&mut self, factor: &TableFactor, scope: &mut Scope) {
        match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                let Some(table) = last_part(name) else {
                    return;
                };
                let columns = if args.is_some() {
                    // Table-valued function such as json_each
                    None
                } else if let Some(columns) = self.cte(&table) {
                    columns
                } else if let Some(descriptor) = self.schema.table(&table) {
                    Some(
                        descriptor
                            .column_names()
                            .map(str::to_ascii_lowercase)
                            .collect(),
                    )
                } else {
                    self.violations.insert(ViolationKind::UnknownTable);
                    return;
                };
                scope.relations.push(Relation {
                    name: Some(alias.as_ref().map_or(table, |a| lower(&a.name))),
                    columns: alias.as_ref().and_then(alias_columns).or(columns),
                });
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                let produced = self.query(subquery);
                scope.relations.push(Relation {
                    name: alias.as_ref().map(|a| lower(&a.name)),
                    columns: alias.as_ref().and_then(alias_columns).or(produced),
                });
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.from_item(table_with_joins, scope),
            _ => scope.relations.push(Relation {
                name: None,
                columns: None,
            }),
        }
    }

    /// ON conditions see every relation of the FROM clause
    fn join_constraints(&mut self, table: &TableWithJoins) {
        if let TableFactor::NestedJoin {
            table_with_joins, ..
        } = &table.relation
        {
            self.join_constraints(table_with_joins);
        }
        for join in &table.joins {
            self.walk(&join.join_operator, false);
        }
    }

    fn output_columns(&self, select: &Select) -> Columns {
        let scope = self.scopes.last()?;
        let mut columns = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::ExprWithAlias { alias, .. } => columns.push(lower(alias)),
                SelectItem::UnnamedExpr(Expr::Identifier(ident)) => columns.push(lower(ident)),
                SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                    columns.push(lower(parts.last()?));
                }
                SelectItem::UnnamedExpr(expr) => columns.push(expr.to_string().to_ascii_lowercase()),
                SelectItem::Wildcard(_) => {
                    for relation in &scope.relations {
                        columns.extend(relation.columns.clone()?);
                    }
                }
                SelectItem::QualifiedWildcard(SelectItemQualifiedWildcardKind::ObjectName(name), _) => {
                    let qualifier = last_part(name)?;
                    let relation = scope
                        .relations
                        .iter()
                        .find(|r| r.name.as_deref() == Some(qualifier.as_str()))?;
                    columns.extend(relation.columns.clone()?);
                }
                SelectItem::QualifiedWildcard(..) => return None,
            }
        }
        Some(columns)
    }

    fn cte(&self, name: &str) -> Option<Columns> {
        self.ctes
            .iter()
            .rev()
            .find(|(cte, _)| cte == name)
            .map(|(_, columns)| columns.clone())
    }

    fn qualified_relation(&self, name: &ObjectName) -> Option<&Relation> {
        let qualifier = last_part(name)?;
        self.find_relation(&qualifier)
    }

    fn find_relation(&self, qualifier: &str) -> Option<&Relation> {
        self.scopes.iter().rev().find_map(|scope| {
            scope
                .relations
                .iter()
                .find(|r| r.name.as_deref() == Some(qualifier))
        })
    }

    fn check_column(&mut self, column: &str, aliases_visible: bool) {
        if IMPLICIT_NAMES.contains(&column) {
            return;
        }
        let found = self.scopes.iter().rev().enumerate().any(|(depth, scope)| {
            scope.relations.iter().any(|r| r.has(column))
                || (depth == 0 && aliases_visible && scope.aliases.contains(column))
        });
        if !found {
            self.violations.insert(ViolationKind::UnknownColumn);
        }
    }

    fn check_qualified(&mut self, qualifier: &str, column: &str) {
        let violation = match self.find_relation(qualifier) {
            None => Some(ViolationKind::UnknownTable),
            Some(relation) if relation.has(column) || IMPLICIT_NAMES.contains(&column) => None,
            Some(_) => Some(ViolationKind::UnknownColumn),
        };
        if let Some(violation) = violation {
            self.violations.insert(violation);
        }
    }

    fn walk<V: Visit>(&mut self, node: &V, aliases_visible: bool) {
        let mut walk = ExprWalk {
            resolver: self,
            aliases_visible,
            depth: 0,
        };
        let _ = node.visit(&mut walk);
    }
}

/// Checks the identifiers of one clause; subqueries met on the way are
/// resolved as queries of their own with this clause's scopes around them
struct ExprWalk<'r, 's> {
    resolver: &'r mut Resolver<'s>,
    aliases_visible: bool,
    depth: usize,
}

impl Visitor for ExprWalk<'_, '_> {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if self.depth == 0 {
            self.resolver.query(query);
        }
        self.depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if self.depth > 0 {
            return ControlFlow::Continue(());
        }
        match expr {
            Expr::Identifier(ident) => {
                self.resolver.check_column(&lower(ident), self.aliases_visible);
            }
            Expr::CompoundIdentifier(parts) => {
                let parts: Vec<String> = parts.iter().map(lower).collect();
                if let [.., qualifier, column] = parts.as_slice() {
                    self.resolver.check_qualified(qualifier, column);
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// Column names declared on an alias, e.g. `WITH m(month, total) AS (...)`
fn alias_columns(alias: &TableAlias) -> Columns {
    if alias.columns.is_empty() {
        None
    } else {
        Some(alias.columns.iter().map(|c| lower(&c.name)).collect())
    }
}

#[allow(unreachable_patterns)]
fn last_part(name: &ObjectName) -> Option<String> {
    match name.0.last()? {
        ObjectNamePart::Identifier(ident) => Some(lower(ident)),
        _ => None,
    }
}

fn lower(ident: &Ident) -> String {
    ident.value.to_ascii_lowercase()
}
