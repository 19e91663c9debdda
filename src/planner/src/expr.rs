// Copyright 2025 ShardBridge Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Expression analysis: splitting WHERE/ON/HAVING conjunctions into filter
//! and join tuples, classifying select items, and extracting the literals
//! that narrow shard routes.

use std::fmt;
use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions, BinaryOperator, DuplicateTreatment, Expr, Function, FunctionArg,
    FunctionArgExpr, FunctionArguments, Query, SelectItem, Statement, Value,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use shardbridge_common::error::{Error, Result};
use shardbridge_common::types::Datum;

use crate::plan::aggregate::AggrType;

/// A possibly-qualified column reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub name: String,
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(t) => write!(f, "{}.{}", t, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A conjunct of WHERE/ON/HAVING that touches at most one side of any join.
///
/// When the predicate is a shard-key equality (or IN list), `col` names the
/// column and `vals` carries the literals the router consumes to narrow the
/// route.
#[derive(Debug, Clone)]
pub struct FilterTuple {
    pub expr: Expr,
    /// Scope idents referenced by the expression.
    pub referred_tables: Vec<String>,
    /// An unqualified column could not be attributed to a single table.
    pub unresolved: bool,
    pub col: Option<ColumnRef>,
    pub vals: Vec<Datum>,
}

/// An equality whose two sides reference different tables.
#[derive(Debug, Clone)]
pub struct JoinTuple {
    pub expr: Expr,
    pub left: ColumnRef,
    pub right: ColumnRef,
}

/// An aggregate call in the select list.
#[derive(Debug, Clone)]
pub struct AggCall {
    pub kind: AggrType,
    pub distinct: bool,
    /// `None` for `COUNT(*)`.
    pub arg: Option<Expr>,
}

/// A projected expression with its bookkeeping.
#[derive(Debug, Clone)]
pub struct SelectTuple {
    pub item: SelectItem,
    /// Bare column name, or the rendered expression.
    pub field: String,
    /// Alias when present, `field` otherwise.
    pub label: String,
    pub referred_tables: Vec<String>,
    pub agg: Option<AggCall>,
    pub is_column: bool,
    /// Qualifier of a plain column reference.
    pub qualifier: Option<String>,
    /// An unqualified column could not be attributed (multi-table scope).
    pub unresolved: bool,
}

/// One conjunct of a boolean expression, classified.
#[derive(Debug, Clone)]
pub enum Condition {
    Join(JoinTuple),
    Filter(FilterTuple),
}

/// Flattens a conjunction into its conjuncts, unwrapping parentheses.
pub fn split_and_exprs(expr: Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = split_and_exprs(*left);
            out.extend(split_and_exprs(*right));
            out
        }
        Expr::Nested(inner) => split_and_exprs(*inner),
        other => vec![other],
    }
}

/// Folds expressions back into one conjunction.
pub fn and_exprs(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
    exprs.into_iter().reduce(|acc, e| Expr::BinaryOp {
        left: Box::new(acc),
        op: BinaryOperator::And,
        right: Box::new(e),
    })
}

/// Stable structural key for an expression. AST node identity is not
/// meaningful across rewrites, so filters are deduplicated by this form.
pub fn canonical(expr: &Expr) -> String {
    expr.to_string()
}

/// Builds a (possibly qualified) column reference expression.
pub fn column_expr(table: Option<&str>, name: &str) -> Expr {
    use sqlparser::ast::Ident;
    match table {
        Some(t) => Expr::CompoundIdentifier(vec![Ident::new(t), Ident::new(name)]),
        None => Expr::Identifier(Ident::new(name)),
    }
}

pub fn as_column(expr: &Expr) -> Option<ColumnRef> {
    match expr {
        Expr::Identifier(ident) => Some(ColumnRef {
            table: None,
            name: ident.value.clone(),
        }),
        Expr::CompoundIdentifier(idents) if idents.len() >= 2 => Some(ColumnRef {
            table: Some(idents[idents.len() - 2].value.clone()),
            name: idents[idents.len() - 1].value.clone(),
        }),
        Expr::Nested(inner) => as_column(inner),
        _ => None,
    }
}

pub fn literal_datum(expr: &Expr) -> Option<Datum> {
    let Expr::Value(value) = expr else {
        return None;
    };
    match value {
        Value::Number(repr, _) => {
            if let Ok(v) = repr.parse::<i64>() {
                Some(Datum::Int(v))
            } else if let Ok(v) = repr.parse::<u64>() {
                Some(Datum::UInt(v))
            } else {
                repr.parse::<f64>().ok().map(Datum::Float)
            }
        }
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => {
            Some(Datum::Str(s.clone()))
        }
        Value::Boolean(b) => Some(Datum::Int(*b as i64)),
        Value::Null => Some(Datum::Null),
        _ => None,
    }
}

/// Column references found in an expression, resolved against a scope of
/// table idents.
#[derive(Debug, Default)]
pub struct ExprScan {
    pub tables: Vec<String>,
    /// Some unqualified column could not be attributed (multi-table scope).
    pub unresolved: bool,
}

pub fn scan_expr_tables(expr: &Expr, scope: &[&str]) -> Result<ExprScan> {
    let mut scan = ExprScan::default();
    let flow = visit_expressions(expr, |e| {
        match e {
            Expr::Identifier(_) => {
                if scope.len() == 1 {
                    push_unique(&mut scan.tables, scope[0]);
                } else {
                    scan.unresolved = true;
                }
            }
            Expr::CompoundIdentifier(idents) if idents.len() >= 2 => {
                let qualifier = &idents[idents.len() - 2].value;
                match scope.iter().find(|t| t.eq_ignore_ascii_case(qualifier)) {
                    Some(t) => push_unique(&mut scan.tables, t),
                    None => {
                        return ControlFlow::Break(Error::ColumnUnknown(format!(
                            "{}.{}",
                            qualifier,
                            idents[idents.len() - 1].value
                        )))
                    }
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(err) => Err(err),
        ControlFlow::Continue(()) => Ok(scan),
    }
}

fn push_unique(tables: &mut Vec<String>, ident: &str) {
    if !tables.iter().any(|t| t == ident) {
        tables.push(ident.to_string());
    }
}

const AGGREGATE_NAMES: [&str; 5] = ["avg", "count", "max", "min", "sum"];

pub fn contains_aggregate(expr: &Expr) -> bool {
    let flow = visit_expressions(expr, |e| {
        if let Expr::Function(func) = e {
            if AGGREGATE_NAMES.contains(&func.name.to_string().to_lowercase().as_str()) {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    });
    flow.is_break()
}

/// Recognizes `MIN`/`MAX`/`SUM`/`COUNT`/`AVG`. Returns `Ok(None)` for other
/// functions; rejects malformed aggregate calls.
pub fn parse_agg(func: &Function) -> Result<Option<AggCall>> {
    let name = func.name.to_string().to_lowercase();
    let kind = match name.as_str() {
        "avg" => AggrType::Avg,
        "count" => AggrType::Count,
        "max" => AggrType::Max,
        "min" => AggrType::Min,
        "sum" => AggrType::Sum,
        _ => return Ok(None),
    };
    if func.over.is_some() {
        return Err(Error::Unsupported(format!("window function [{func}]")));
    }
    let FunctionArguments::List(list) = &func.args else {
        return Err(Error::UnsupportedAggregate(func.to_string()));
    };
    if !list.clauses.is_empty() || list.args.len() != 1 {
        return Err(Error::UnsupportedAggregate(func.to_string()));
    }
    let distinct = matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct));
    let arg = match &list.args[0] {
        FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => {
            if kind != AggrType::Count {
                return Err(Error::UnsupportedAggregate(func.to_string()));
            }
            None
        }
        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => {
            if contains_aggregate(e) {
                return Err(Error::UnsupportedAggregate(func.to_string()));
            }
            Some(e.clone())
        }
        _ => return Err(Error::UnsupportedAggregate(func.to_string())),
    };
    Ok(Some(AggCall {
        kind,
        distinct,
        arg,
    }))
}

/// Classifies one conjunct: a column-to-column equality across two distinct
/// tables is a join candidate, everything else is a filter.
pub fn classify_condition(expr: Expr, scope: &[&str]) -> Result<Condition> {
    if let Expr::BinaryOp {
        left,
        op: BinaryOperator::Eq,
        right,
    } = &expr
    {
        if let (Some(lcol), Some(rcol)) = (as_column(left), as_column(right)) {
            let scan = scan_expr_tables(&expr, scope)?;
            if scan.unresolved {
                return Err(Error::ColumnUnknown(format!(
                    "ambiguous column in [{expr}]"
                )));
            }
            if scan.tables.len() == 2 {
                // Two distinct tables means both sides carry a qualifier;
                // resolve each against the scope's canonical ident.
                let resolve = |col: ColumnRef| {
                    let table = scope
                        .iter()
                        .find(|t| {
                            col.table
                                .as_deref()
                                .is_some_and(|q| t.eq_ignore_ascii_case(q))
                        })
                        .map(|t| t.to_string());
                    ColumnRef {
                        table,
                        name: col.name,
                    }
                };
                return Ok(Condition::Join(JoinTuple {
                    expr,
                    left: resolve(lcol),
                    right: resolve(rcol),
                }));
            }
        }
    }
    parse_filter(expr, scope).map(Condition::Filter)
}

/// Builds a filter tuple, extracting the distinguished column and literal
/// values when the conjunct is an equality or IN list usable for routing.
pub fn parse_filter(expr: Expr, scope: &[&str]) -> Result<FilterTuple> {
    let scan = scan_expr_tables(&expr, scope)?;
    let mut col = None;
    let mut vals = Vec::new();
    match &expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let pair = match (as_column(left), literal_datum(right)) {
                (Some(c), Some(v)) => Some((c, v)),
                _ => match (as_column(right), literal_datum(left)) {
                    (Some(c), Some(v)) => Some((c, v)),
                    _ => None,
                },
            };
            if let Some((c, v)) = pair {
                col = Some(c);
                vals.push(v);
            }
        }
        Expr::InList {
            expr: target,
            list,
            negated: false,
        } => {
            if let Some(c) = as_column(target) {
                let literals: Option<Vec<_>> = list.iter().map(literal_datum).collect();
                if let Some(literals) = literals {
                    col = Some(c);
                    vals = literals;
                }
            }
        }
        _ => {}
    }
    Ok(FilterTuple {
        expr,
        referred_tables: scan.tables,
        unresolved: scan.unresolved,
        col,
        vals,
    })
}

/// Classifies the projection into the node field list.
pub fn parse_select_items(items: &[SelectItem], scope: &[&str]) -> Result<Vec<SelectTuple>> {
    items.iter().map(|item| parse_select_item(item, scope)).collect()
}

fn parse_select_item(item: &SelectItem, scope: &[&str]) -> Result<SelectTuple> {
    match item {
        SelectItem::UnnamedExpr(expr) => parse_select_expr(item, expr, None, scope),
        SelectItem::ExprWithAlias { expr, alias } => {
            parse_select_expr(item, expr, Some(alias.value.clone()), scope)
        }
        SelectItem::Wildcard(_) => Ok(SelectTuple {
            item: item.clone(),
            field: "*".to_string(),
            label: "*".to_string(),
            referred_tables: scope.iter().map(|t| t.to_string()).collect(),
            agg: None,
            is_column: false,
            qualifier: None,
            unresolved: false,
        }),
        SelectItem::QualifiedWildcard(name, _) => {
            let qualifier = name
                .0
                .last()
                .map(|i| i.value.clone())
                .ok_or_else(|| Error::Internal("empty qualified wildcard".into()))?;
            let table = scope
                .iter()
                .find(|t| t.eq_ignore_ascii_case(&qualifier))
                .ok_or_else(|| Error::ColumnUnknown(format!("{qualifier}.*")))?;
            Ok(SelectTuple {
                item: item.clone(),
                field: format!("{qualifier}.*"),
                label: format!("{qualifier}.*"),
                referred_tables: vec![table.to_string()],
                agg: None,
                is_column: false,
                qualifier: Some(qualifier),
                unresolved: false,
            })
        }
    }
}

fn parse_select_expr(
    item: &SelectItem,
    expr: &Expr,
    alias: Option<String>,
    scope: &[&str],
) -> Result<SelectTuple> {
    let scan = scan_expr_tables(expr, scope)?;
    let (agg, field, is_column, qualifier) = if let Some(col) = as_column(expr) {
        (None, col.name.clone(), true, col.table)
    } else if let Expr::Function(func) = expr {
        match parse_agg(func)? {
            Some(call) => (Some(call), canonical(expr), false, None),
            None => (None, canonical(expr), false, None),
        }
    } else {
        if contains_aggregate(expr) {
            // Aggregates buried in arithmetic would need proxy-side
            // expression evaluation over partial results.
            return Err(Error::UnsupportedAggregate(canonical(expr)));
        }
        (None, canonical(expr), false, None)
    };
    Ok(SelectTuple {
        item: item.clone(),
        label: alias.unwrap_or_else(|| field.clone()),
        field,
        referred_tables: scan.tables,
        agg,
        is_column,
        qualifier,
        unresolved: scan.unresolved,
    })
}

/// Parses a synthesized SQL string. Only ever called on text the planner
/// itself produced, so a failure is an internal invariant violation.
pub(crate) fn parse_query(sql: &str) -> Result<Query> {
    let mut stmts = Parser::parse_sql(&MySqlDialect {}, sql)
        .map_err(|e| Error::Internal(format!("synthesized sql [{sql}] failed to parse: {e}")))?;
    if stmts.len() != 1 {
        return Err(Error::Internal(format!(
            "synthesized sql [{sql}] is not a single statement"
        )));
    }
    match stmts.pop() {
        Some(Statement::Query(query)) => Ok(*query),
        _ => Err(Error::Internal(format!(
            "synthesized sql [{sql}] is not a query"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::test_utils::{parse_expr, parse_projection};

    #[test]
    fn test_split_and_exprs() {
        let exprs = split_and_exprs(parse_expr("a = 1 AND (b = 2 AND c > 3)"));
        assert_eq!(exprs.len(), 3);
        assert_eq!(canonical(&exprs[2]), "c > 3");

        let rejoined = and_exprs(exprs).unwrap();
        assert_eq!(canonical(&rejoined), "a = 1 AND b = 2 AND c > 3");
    }

    #[test]
    fn test_parse_filter_extracts_shard_values() {
        let t = parse_filter(parse_expr("id = 7"), &["t"]).unwrap();
        assert_eq!(t.col.as_ref().unwrap().name, "id");
        assert_eq!(t.vals, vec![Datum::Int(7)]);
        assert_eq!(t.referred_tables, vec!["t"]);

        let t = parse_filter(parse_expr("7 = t.id"), &["t", "g"]).unwrap();
        assert_eq!(t.col.as_ref().unwrap().table.as_deref(), Some("t"));
        assert_eq!(t.vals, vec![Datum::Int(7)]);

        let t = parse_filter(parse_expr("id IN (1, 2, 3)"), &["t"]).unwrap();
        assert_eq!(t.vals.len(), 3);

        // Non-equality comparisons carry no routing literals.
        let t = parse_filter(parse_expr("id > 7"), &["t"]).unwrap();
        assert!(t.col.is_none());
        assert!(t.vals.is_empty());
    }

    #[test]
    fn test_classify_condition() {
        let cond = classify_condition(parse_expr("t1.a = t2.b"), &["t1", "t2"]).unwrap();
        assert_matches!(cond, Condition::Join(ref j) if j.left.name == "a" && j.right.name == "b");

        // Swapped qualifier order still orients to scope order.
        let cond = classify_condition(parse_expr("t2.b = t1.a"), &["t1", "t2"]).unwrap();
        assert_matches!(
            cond,
            Condition::Join(ref j)
                if j.left.table.as_deref() == Some("t2") && j.left.name == "b"
        );

        let cond = classify_condition(parse_expr("t1.a = t1.b"), &["t1", "t2"]).unwrap();
        assert_matches!(cond, Condition::Filter(_));

        assert_matches!(
            classify_condition(parse_expr("x.a = t1.b"), &["t1", "t2"]),
            Err(Error::ColumnUnknown(_))
        );
    }

    #[test]
    fn test_unqualified_ambiguity() {
        let t = parse_filter(parse_expr("a = 1"), &["t1", "t2"]).unwrap();
        assert!(t.unresolved);
        let t = parse_filter(parse_expr("a = 1"), &["t1"]).unwrap();
        assert!(!t.unresolved);
    }

    #[test]
    fn test_parse_select_items() {
        let items = parse_projection("a, t.b AS x, COUNT(*), AVG(a) avg_a, *");
        let tuples = parse_select_items(&items, &["t"]).unwrap();

        assert!(tuples[0].is_column);
        assert_eq!(tuples[0].label, "a");

        assert_eq!(tuples[1].label, "x");
        assert_eq!(tuples[1].field, "b");
        assert_eq!(tuples[1].qualifier.as_deref(), Some("t"));

        let count = tuples[2].agg.as_ref().unwrap();
        assert_eq!(count.kind, AggrType::Count);
        assert!(count.arg.is_none());

        let avg = tuples[3].agg.as_ref().unwrap();
        assert_eq!(avg.kind, AggrType::Avg);
        assert_eq!(tuples[3].label, "avg_a");

        assert_eq!(tuples[4].field, "*");
    }

    #[test]
    fn test_aggregate_rejections() {
        let items = parse_projection("SUM(a) + 1");
        assert_matches!(
            parse_select_items(&items, &["t"]),
            Err(Error::UnsupportedAggregate(_))
        );

        let items = parse_projection("MIN(*)");
        assert_matches!(
            parse_select_items(&items, &["t"]),
            Err(Error::UnsupportedAggregate(_))
        );

        let items = parse_projection("COUNT(DISTINCT a)");
        let tuples = parse_select_items(&items, &["t"]).unwrap();
        assert!(tuples[0].agg.as_ref().unwrap().distinct);
    }
}
