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

//! Top-level orchestration: analyze, route, split post-processing between
//! shards and proxy, emit the shard-bound fragments and the explain
//! document.

use std::fmt;
use std::ops::ControlFlow;

use itertools::Itertools;
use serde::Serialize;
use sqlparser::ast::{
    visit_expressions, Distinct, Expr, GroupByExpr, LockClause, OrderByExpr, Query, SelectItem,
    SetExpr,
};

use shardbridge_common::error::{Error, Result};
use shardbridge_common::types::Datum;

use crate::builder::PlanBuilder;
use crate::expr::{
    as_column, canonical, contains_aggregate, literal_datum, parse_select_items,
    scan_expr_tables, split_and_exprs, ColumnRef, SelectTuple,
};
use crate::node::{PlanNode, QueryTuple};
use crate::plan::{
    ChildPlan, FilterPlan, GroupItem, LimitPlan, OrderByPlan, OrderField, OrderType,
};
use crate::router::Router;

/// Plan-kind tag exposed to the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanType {
    Select,
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanType::Select => write!(f, "select"),
        }
    }
}

/// A fully built distributed plan for one `SELECT`.
#[derive(Debug)]
pub struct SelectPlan {
    raw_query: String,
    database: String,
    root: PlanNode,
    project: String,
}

impl SelectPlan {
    /// Analyzes and builds the plan. Any error discards the plan; partial
    /// side effects are irrelevant because nothing else sees the tree.
    pub fn build(
        database: &str,
        raw_query: &str,
        query: Query,
        router: &dyn Router,
    ) -> Result<SelectPlan> {
        PlanBuilder::reject_unsupported(&query)?;
        let parts = QueryParts::extract(&query)?;

        let mut builder = PlanBuilder::new(router, database);
        let mut root = {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return Err(Error::Internal("validated query is not a select".into()));
            };
            builder.scan_from(&select.from)?
        };
        let narrow_only = root.as_merge().is_some();
        builder.process_where(&mut root, parts.selection.as_ref(), narrow_only)?;
        let root = root.calc_route(router)?;

        let mut plan = SelectPlan {
            raw_query: raw_query.to_string(),
            database: database.to_string(),
            root,
            project: String::new(),
        };

        if let PlanNode::Merge(node) = &mut plan.root {
            node.attach_select(query)?;
            if node.route_len() == 1 {
                // Single pushdown: the original statement goes out as-is
                // (physical names substituted) and no post-ops exist.
                plan.root.build_query()?;
                return Ok(plan);
            }
        }

        plan.analyze_post_ops(&parts)?;
        plan.root.prepare_join(router)?;
        plan.root.build_query()?;
        Ok(plan)
    }

    fn analyze_post_ops(&mut self, parts: &QueryParts) -> Result<()> {
        let scope = self.root.table_idents();
        let scope_refs: Vec<&str> = scope.iter().map(String::as_str).collect();
        let tuples = parse_select_items(&parts.projection, &scope_refs)?;
        self.project = tuples.iter().map(|t| t.label.clone()).join(", ");
        let has_agg = tuples.iter().any(|t| t.agg.is_some());

        match &mut self.root {
            PlanNode::Merge(node) => {
                let groups = if parts.distinct {
                    check_distinct(&tuples)?
                } else {
                    check_group_by(&parts.group_exprs, &tuples)?
                };
                let fully_pushable = !parts.distinct
                    && !groups.is_empty()
                    && is_shard_key_grouping(node.tables(), &groups);
                let push_down = !tuples
                    .iter()
                    .any(|t| t.agg.as_ref().is_some_and(|a| a.distinct));
                if let Some(having) = &parts.having {
                    check_merge_having(having, &scope_refs, &tuples)?;
                }
                node.push_select_exprs(tuples, &groups, push_down, fully_pushable)?;
            }
            PlanNode::Join(_) => {
                if has_agg {
                    return Err(Error::UnsupportedAggregate(
                        "aggregate over a cross-shard join".into(),
                    ));
                }
                if parts.distinct {
                    return Err(Error::UnsupportedDistinct(
                        "distinct over a cross-shard join".into(),
                    ));
                }
                if !parts.group_exprs.is_empty() {
                    return Err(Error::UnsupportedGroupBy(
                        "group by over a cross-shard join".into(),
                    ));
                }
                for tuple in &tuples {
                    self.root.push_select_expr(tuple)?;
                }
                if let Some(having) = parts.having.clone() {
                    push_join_having(&mut self.root, having, &scope_refs)?;
                }
            }
        }

        if !parts.order_by.is_empty() {
            let plan = build_order_plan(&parts.order_by, self.root.fields())?;
            self.root.push_child(ChildPlan::OrderBy(plan));
        }

        if let Some((offset, count)) = parts.limit {
            let plan = LimitPlan::new(offset, count);
            let (_, shipped) = plan.rewritten();
            match &mut self.root {
                PlanNode::Merge(node) => {
                    let aggregated = node
                        .children()
                        .iter()
                        .any(|c| matches!(c, ChildPlan::Aggregate(_)));
                    if aggregated {
                        // Aggregation changes cardinality; the proxy limits
                        // after combining.
                        node.clear_shipped_limit();
                    } else {
                        node.set_shipped_limit(shipped);
                    }
                }
                PlanNode::Join(_) => self.root.push_shipped_limit(shipped),
            }
            self.root.push_child(ChildPlan::Limit(plan));
        }

        if !parts.locks.is_empty() && self.root.as_join().is_some() {
            self.root.push_misc(&parts.locks);
        }
        Ok(())
    }

    pub fn plan_type(&self) -> PlanType {
        PlanType::Select
    }

    /// Memory heuristic used by the plan cache.
    pub fn size(&self) -> usize {
        self.raw_query.len()
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn root(&self) -> &PlanNode {
        &self.root
    }

    pub fn children(&self) -> &[ChildPlan] {
        self.root.children()
    }

    pub fn querys(&self) -> Vec<&QueryTuple> {
        self.root.querys()
    }

    /// The explain document; keys are omitted when empty.
    pub fn json(&self) -> serde_json::Value {
        let mut doc = Document {
            raw_query: self.raw_query.clone(),
            project: self.project.clone(),
            partitions: self.root.querys().into_iter().cloned().collect(),
            join: self.root.as_join().map(|j| JoinSummary {
                join_type: j.kind().to_string(),
                strategy: j.strategy().to_string(),
            }),
            aggregate: vec![],
            hash_group_by: vec![],
            gather_merge: vec![],
            limit: None,
        };
        for child in self.root.children() {
            match child {
                ChildPlan::Aggregate(plan) => {
                    doc.aggregate = plan.aggr_labels();
                    doc.hash_group_by = plan.group_labels();
                }
                ChildPlan::OrderBy(plan) => {
                    doc.gather_merge = plan.gather_merge_labels();
                }
                ChildPlan::Limit(plan) => {
                    doc.limit = Some(LimitSummary {
                        offset: plan.offset(),
                        limit: plan.count(),
                    });
                }
                ChildPlan::Filter(_) => {}
            }
        }
        serde_json::to_value(doc).expect("explain document serializes")
    }
}

#[derive(Serialize)]
struct Document {
    #[serde(rename = "RawQuery", skip_serializing_if = "String::is_empty")]
    raw_query: String,
    #[serde(rename = "Project", skip_serializing_if = "String::is_empty")]
    project: String,
    #[serde(rename = "Partitions", skip_serializing_if = "Vec::is_empty")]
    partitions: Vec<QueryTuple>,
    #[serde(rename = "Join", skip_serializing_if = "Option::is_none")]
    join: Option<JoinSummary>,
    #[serde(rename = "Aggregate", skip_serializing_if = "Vec::is_empty")]
    aggregate: Vec<String>,
    #[serde(rename = "HashGroupBy", skip_serializing_if = "Vec::is_empty")]
    hash_group_by: Vec<String>,
    #[serde(rename = "GatherMerge", skip_serializing_if = "Vec::is_empty")]
    gather_merge: Vec<String>,
    #[serde(rename = "Limit", skip_serializing_if = "Option::is_none")]
    limit: Option<LimitSummary>,
}

#[derive(Serialize)]
struct JoinSummary {
    #[serde(rename = "Type")]
    join_type: String,
    #[serde(rename = "Strategy")]
    strategy: String,
}

#[derive(Serialize)]
struct LimitSummary {
    #[serde(rename = "Offset")]
    offset: u64,
    #[serde(rename = "Limit")]
    limit: u64,
}

/// The clauses of the original statement the post-op analysis consumes.
struct QueryParts {
    projection: Vec<SelectItem>,
    distinct: bool,
    group_exprs: Vec<Expr>,
    having: Option<Expr>,
    order_by: Vec<OrderByExpr>,
    limit: Option<(u64, u64)>,
    locks: Vec<LockClause>,
    selection: Option<Expr>,
}

impl QueryParts {
    fn extract(query: &Query) -> Result<QueryParts> {
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(Error::Internal("validated query is not a select".into()));
        };
        let distinct = match &select.distinct {
            None => false,
            Some(Distinct::Distinct) => true,
            Some(Distinct::On(_)) => {
                return Err(Error::UnsupportedDistinct("distinct on".into()))
            }
        };
        let group_exprs = match &select.group_by {
            GroupByExpr::Expressions(exprs, modifiers) => {
                if !modifiers.is_empty() {
                    return Err(Error::UnsupportedGroupBy("group by modifier".into()));
                }
                exprs.clone()
            }
            GroupByExpr::All(_) => {
                return Err(Error::UnsupportedGroupBy("group by all".into()))
            }
        };
        let order_by = match &query.order_by {
            None => vec![],
            Some(order_by) => {
                if order_by.interpolate.is_some() {
                    return Err(Error::Unsupported("order by interpolate".into()));
                }
                for expr in &order_by.exprs {
                    if expr.with_fill.is_some() {
                        return Err(Error::Unsupported("order by with fill".into()));
                    }
                }
                order_by.exprs.clone()
            }
        };
        if !query.limit_by.is_empty() {
            return Err(Error::Unsupported("limit by".into()));
        }
        if query.fetch.is_some() {
            return Err(Error::Unsupported("fetch clause".into()));
        }
        let limit = match &query.limit {
            None => {
                if query.offset.is_some() {
                    return Err(Error::Unsupported("offset without limit".into()));
                }
                None
            }
            Some(expr) => {
                let count = limit_value(expr)?;
                let offset = query
                    .offset
                    .as_ref()
                    .map(|o| limit_value(&o.value))
                    .transpose()?
                    .unwrap_or(0);
                Some((offset, count))
            }
        };
        Ok(QueryParts {
            projection: select.projection.clone(),
            distinct,
            group_exprs,
            having: select.having.clone(),
            order_by,
            limit,
            locks: query.locks.clone(),
            selection: select.selection.clone(),
        })
    }
}

fn limit_value(expr: &Expr) -> Result<u64> {
    match literal_datum(expr) {
        Some(Datum::Int(v)) if v >= 0 => Ok(v as u64),
        Some(Datum::UInt(v)) => Ok(v),
        _ => Err(Error::Unsupported(format!("limit expression [{expr}]"))),
    }
}

/// Every GROUP BY entry must be a plain column resolving to a projected
/// field that is not itself an aggregate.
fn check_group_by(group_exprs: &[Expr], tuples: &[SelectTuple]) -> Result<Vec<GroupItem>> {
    let mut groups = Vec::new();
    for expr in group_exprs {
        let col = as_column(expr)
            .ok_or_else(|| Error::UnsupportedGroupBy(canonical(expr)))?;
        let index = tuples
            .iter()
            .position(|t| tuple_matches_column(t, &col))
            .ok_or_else(|| {
                Error::UnsupportedGroupBy(format!(
                    "column [{col}] must appear in the select list"
                ))
            })?;
        if tuples[index].agg.is_some() {
            return Err(Error::UnsupportedGroupBy(format!(
                "aggregate column [{col}]"
            )));
        }
        groups.push(GroupItem {
            index,
            table: col.table,
            field: col.name,
        });
    }
    Ok(groups)
}

/// `SELECT DISTINCT …` groups over every projected expression; aggregates
/// and wildcards have no grouping form.
fn check_distinct(tuples: &[SelectTuple]) -> Result<Vec<GroupItem>> {
    let mut groups = Vec::new();
    for (index, tuple) in tuples.iter().enumerate() {
        if tuple.agg.is_some() {
            return Err(Error::UnsupportedDistinct(tuple.label.clone()));
        }
        if tuple.field.ends_with('*') {
            return Err(Error::UnsupportedDistinct(tuple.field.clone()));
        }
        groups.push(GroupItem {
            index,
            table: tuple.qualifier.clone(),
            field: tuple.field.clone(),
        });
    }
    Ok(groups)
}

fn tuple_matches_column(tuple: &SelectTuple, col: &ColumnRef) -> bool {
    match &col.table {
        Some(qualifier) => {
            tuple.is_column
                && tuple.field.eq_ignore_ascii_case(&col.name)
                && tuple
                    .qualifier
                    .as_deref()
                    .is_some_and(|q| q.eq_ignore_ascii_case(qualifier))
        }
        None => {
            tuple.label.eq_ignore_ascii_case(&col.name)
                || (tuple.is_column && tuple.field.eq_ignore_ascii_case(&col.name))
        }
    }
}

/// Grouping exactly on the shard key of the only sharded table keeps every
/// group on one shard; the whole aggregation pushes down untouched.
fn is_shard_key_grouping(tables: &[crate::table::TableInfo], groups: &[GroupItem]) -> bool {
    let mut sharded = tables.iter().filter(|t| !t.is_global());
    let (Some(table), None) = (sharded.next(), sharded.next()) else {
        return false;
    };
    if table.shard_key.is_empty() {
        return false;
    }
    groups.iter().all(|g| {
        g.field.eq_ignore_ascii_case(&table.shard_key)
            && g.table
                .as_deref()
                .map_or(true, |q| table.matches_qualifier(q))
    })
}

/// HAVING over a fan-out merge stays in the shipped statement, so it must
/// not reference aggregates (directly or through a select alias) — those
/// would filter partial results.
fn check_merge_having(
    having: &Expr,
    scope: &[&str],
    tuples: &[SelectTuple],
) -> Result<()> {
    if contains_aggregate(having) {
        return Err(Error::UnsupportedAggregate(format!(
            "having clause [{having}]"
        )));
    }
    scan_expr_tables(having, scope)?;
    let flow = visit_expressions(having, |e| {
        if let Expr::Identifier(ident) = e {
            let aliased_agg = tuples.iter().any(|t| {
                t.agg.is_some() && t.label.eq_ignore_ascii_case(&ident.value)
            });
            if aliased_agg {
                return ControlFlow::Break(Error::UnsupportedAggregate(format!(
                    "having clause [{having}]"
                )));
            }
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(err) => Err(err),
        ControlFlow::Continue(()) => Ok(()),
    }
}

/// HAVING over a surviving join: single-side conjuncts push into that
/// side's statement, cross-side conjuncts become a proxy-side filter over
/// the joined fields.
fn push_join_having(root: &mut PlanNode, having: Expr, scope: &[&str]) -> Result<()> {
    for part in split_and_exprs(having) {
        if contains_aggregate(&part) {
            return Err(Error::UnsupportedAggregate(format!(
                "having clause [{part}]"
            )));
        }
        let scan = scan_expr_tables(&part, scope)?;
        if scan.unresolved {
            return Err(Error::ColumnUnknown(format!(
                "ambiguous column in [{part}]"
            )));
        }
        if scan.tables.len() <= 1 {
            root.push_having(part, &scan.tables)?;
        } else {
            let refs = resolve_filter_refs(&part, root.fields())?;
            root.push_child(ChildPlan::Filter(FilterPlan::new(part, refs)));
        }
    }
    Ok(())
}

fn resolve_filter_refs(
    expr: &Expr,
    fields: &[SelectTuple],
) -> Result<Vec<(ColumnRef, usize)>> {
    let mut refs = Vec::new();
    let flow = visit_expressions(expr, |e| {
        if let Some(col) = as_column(e) {
            if matches!(e, Expr::Identifier(_) | Expr::CompoundIdentifier(_)) {
                match resolve_field(&col, fields) {
                    Ok(index) => refs.push((col, index)),
                    Err(err) => return ControlFlow::Break(err),
                }
            }
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(err) => Err(err),
        ControlFlow::Continue(()) => Ok(refs),
    }
}

fn build_order_plan(order_by: &[OrderByExpr], fields: &[SelectTuple]) -> Result<OrderByPlan> {
    let mut orders = Vec::new();
    for entry in order_by {
        let col = as_column(&entry.expr).ok_or_else(|| {
            Error::Unsupported(format!("order by expression [{}]", entry.expr))
        })?;
        let index = resolve_field(&col, fields)?;
        orders.push(OrderField {
            index,
            order_type: if entry.asc.unwrap_or(true) {
                OrderType::Ascending
            } else {
                OrderType::Descending
            },
            table: col.table,
            field: col.name,
        });
    }
    Ok(OrderByPlan::new(orders))
}

fn resolve_field(col: &ColumnRef, fields: &[SelectTuple]) -> Result<usize> {
    let found = fields.iter().position(|t| tuple_matches_column(t, col));
    if let Some(index) = found {
        return Ok(index);
    }
    if fields.iter().any(|t| t.field.ends_with('*')) {
        return Err(Error::Unsupported(format!(
            "column [{col}] must be projected explicitly alongside a wildcard"
        )));
    }
    Err(Error::ColumnUnknown(col.to_string()))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::node::JoinStrategy;
    use crate::plan::AggrType;
    use crate::test_utils::{build_plan, sbtest_router};

    #[test]
    fn test_single_route_pushdown() {
        let router = sbtest_router();
        let plan = build_plan("SELECT * FROM t WHERE id = 7", &router).unwrap();

        let node = plan.root().as_merge().unwrap();
        assert_eq!(node.route_len(), 1);
        assert_eq!(node.backend(), Some("b3"));
        assert!(plan.children().is_empty());
        assert_eq!(node.querys().len(), 1);
        assert_eq!(node.querys()[0].query, "SELECT * FROM t_0003 WHERE id = 7");
        assert_eq!(node.querys()[0].backend, "b3");
        assert_eq!(node.parsed_querys().len(), node.route_len());
    }

    #[test]
    fn test_full_scan_fans_out() {
        let router = sbtest_router();
        let plan = build_plan("SELECT * FROM t", &router).unwrap();

        let node = plan.root().as_merge().unwrap();
        assert_eq!(node.route_len(), 4);
        let backends: Vec<_> = node.querys().iter().map(|q| q.backend.as_str()).collect();
        assert_eq!(backends, vec!["b0", "b1", "b2", "b3"]);
        assert_eq!(node.querys()[2].query, "SELECT * FROM t_0002");

        let doc = plan.json();
        assert!(doc.get("Aggregate").is_none());
        assert!(doc.get("Join").is_none());
        assert_eq!(doc["Partitions"].as_array().unwrap().len(), 4);
        for table in node.tables() {
            assert_eq!(table.segments.len(), node.route_len());
        }
    }

    #[test]
    fn test_count_push_down() {
        let router = sbtest_router();
        let plan = build_plan("SELECT COUNT(*) FROM t", &router).unwrap();

        let node = plan.root().as_merge().unwrap();
        assert_eq!(node.route_len(), 4);
        assert_eq!(node.querys()[0].query, "SELECT COUNT(*) FROM t_0000");

        let aggregate = plan
            .children()
            .iter()
            .find_map(|c| c.as_aggregate())
            .unwrap();
        assert_eq!(aggregate.normal_aggrs().len(), 1);
        let aggr = &aggregate.normal_aggrs()[0];
        assert_eq!(aggr.kind, AggrType::Count);
        assert!(aggr.push_down);
        assert_eq!(aggr.index, 0);
    }

    #[test]
    fn test_avg_decomposes_to_sum_count() {
        let router = sbtest_router();
        let plan = build_plan("SELECT AVG(a) FROM t", &router).unwrap();

        let node = plan.root().as_merge().unwrap();
        assert_eq!(
            node.querys()[0].query,
            "SELECT AVG(a), SUM(a), COUNT(a) FROM t_0000"
        );
        let aggregate = plan
            .children()
            .iter()
            .find_map(|c| c.as_aggregate())
            .unwrap();
        let kinds: Vec<_> = aggregate.normal_aggrs().iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AggrType::Avg, AggrType::Sum, AggrType::Count]);
    }

    #[test]
    fn test_global_join_fuses_per_shard() {
        let router = sbtest_router();
        let plan =
            build_plan("SELECT t.a, g.y FROM t JOIN g ON t.a = g.x", &router).unwrap();

        let node = plan.root().as_merge().unwrap();
        assert_eq!(node.route_len(), 4);
        assert_eq!(
            node.querys()[1].query,
            "SELECT t_0001.a, g.y FROM t_0001 JOIN g ON t_0001.a = g.x"
        );
        let doc = plan.json();
        assert!(doc.get("Join").is_none());
    }

    #[test]
    fn test_sort_merge_join_with_order_and_limit() {
        let router = sbtest_router();
        let plan = build_plan(
            "SELECT t1.a FROM t t1 JOIN t t2 ON t1.a = t2.b ORDER BY t1.a LIMIT 5,10",
            &router,
        )
        .unwrap();

        let join = plan.root().as_join().unwrap();
        assert_eq!(join.strategy(), JoinStrategy::SortMerge);
        assert!(!join.is_left_join());
        assert_eq!(join.left_keys()[0].index, 0);
        assert_eq!(join.right_keys()[0].field, "b");

        let left = join.left().as_merge().unwrap();
        assert_eq!(
            left.querys()[0].query,
            "SELECT t1.a FROM t_0000 AS t1 ORDER BY t1.a ASC LIMIT 15"
        );
        let right = join.right().as_merge().unwrap();
        assert_eq!(
            right.querys()[3].query,
            "SELECT t2.b FROM t_0003 AS t2 ORDER BY t2.b ASC LIMIT 15"
        );

        let doc = plan.json();
        assert_eq!(doc["GatherMerge"], json!(["t1.a"]));
        assert_eq!(doc["Limit"], json!({"Offset": 5, "Limit": 10}));
        assert_eq!(
            doc["Join"],
            json!({"Type": "INNER JOIN", "Strategy": "Sort Merge Join"})
        );
    }

    #[test]
    fn test_left_join_takes_nested_loop() {
        let router = sbtest_router();
        let plan = build_plan(
            "SELECT t1.a FROM t t1 LEFT JOIN t t2 ON t1.a = t2.b",
            &router,
        )
        .unwrap();

        let join = plan.root().as_join().unwrap();
        assert_eq!(join.strategy(), JoinStrategy::NestedLoop);
        assert!(join.is_left_join());
        assert_eq!(join.vars()[0].var, "t1_a");
        assert_eq!(join.vars()[0].left_index, 0);

        let right = join.right().as_merge().unwrap();
        assert_eq!(
            right.querys()[0].query,
            "SELECT 1 FROM t_0000 AS t2 WHERE t2.b = :t1_a"
        );
        let parsed = &right.parsed_querys()[0];
        assert_eq!(parsed.bind_locations.len(), 1);
        assert_eq!(parsed.bind_locations[0].var, "t1_a");
        assert_eq!(
            &parsed.raw[parsed.bind_locations[0].offset..],
            ":t1_a"
        );
    }

    #[test]
    fn test_same_backend_join_fuses() {
        let router = sbtest_router();
        let plan = build_plan(
            "SELECT t.a, s.b FROM t JOIN s ON t.a = s.b WHERE t.id = 0",
            &router,
        )
        .unwrap();

        let node = plan.root().as_merge().unwrap();
        assert_eq!(node.route_len(), 1);
        assert_eq!(node.backend(), Some("b0"));
        assert_eq!(
            node.querys()[0].query,
            "SELECT t_0000.a, s.b FROM t_0000 JOIN s ON t_0000.a = s.b WHERE t_0000.id = 0"
        );
    }

    #[test]
    fn test_group_by_attaches_plans() {
        let router = sbtest_router();
        let plan =
            build_plan("SELECT a, COUNT(*) AS cnt FROM t GROUP BY a", &router).unwrap();

        let node = plan.root().as_merge().unwrap();
        assert_eq!(
            node.querys()[0].query,
            "SELECT a, COUNT(*) AS cnt FROM t_0000 GROUP BY a ORDER BY a ASC"
        );
        let doc = plan.json();
        assert_eq!(doc["Aggregate"], json!(["cnt"]));
        assert_eq!(doc["HashGroupBy"], json!(["a"]));
        assert_eq!(doc["GatherMerge"], json!(["a"]));
    }

    #[test]
    fn test_shard_key_grouping_is_fully_pushable() {
        let router = sbtest_router();
        let plan =
            build_plan("SELECT id, COUNT(*) FROM t GROUP BY id", &router).unwrap();

        assert!(plan.children().is_empty());
        let node = plan.root().as_merge().unwrap();
        assert_eq!(
            node.querys()[0].query,
            "SELECT id, COUNT(*) FROM t_0000 GROUP BY id"
        );
    }

    #[test]
    fn test_distinct_aggregate_gathers_values() {
        let router = sbtest_router();
        let plan = build_plan("SELECT COUNT(DISTINCT a) FROM t", &router).unwrap();

        let node = plan.root().as_merge().unwrap();
        assert_eq!(node.querys()[0].query, "SELECT a FROM t_0000");
        let aggregate = plan
            .children()
            .iter()
            .find_map(|c| c.as_aggregate())
            .unwrap();
        assert!(!aggregate.is_push_down());
        assert!(aggregate.normal_aggrs()[0].distinct);
    }

    #[test]
    fn test_select_distinct_becomes_grouping() {
        let router = sbtest_router();
        let plan = build_plan("SELECT DISTINCT a, b FROM t", &router).unwrap();

        let aggregate = plan
            .children()
            .iter()
            .find_map(|c| c.as_aggregate())
            .unwrap();
        assert!(aggregate.normal_aggrs().is_empty());
        assert_eq!(aggregate.group_aggrs().len(), 2);
        assert_eq!(
            plan.root().as_merge().unwrap().querys()[0].query,
            "SELECT DISTINCT a, b FROM t_0000 ORDER BY a ASC, b ASC"
        );
    }

    #[test]
    fn test_limit_dropped_under_aggregation() {
        let router = sbtest_router();
        let plan = build_plan(
            "SELECT a, COUNT(*) FROM t GROUP BY a LIMIT 3",
            &router,
        )
        .unwrap();
        let node = plan.root().as_merge().unwrap();
        assert!(!node.querys()[0].query.contains("LIMIT"));
        let limit = plan.children().iter().find_map(|c| c.as_limit()).unwrap();
        assert_eq!((limit.offset(), limit.count()), (0, 3));
    }

    #[test]
    fn test_route_narrowing_and_conflicts() {
        let router = sbtest_router();
        let plan = build_plan("SELECT * FROM t WHERE id IN (1, 2)", &router).unwrap();
        assert_eq!(plan.root().as_merge().unwrap().route_len(), 2);

        assert_matches!(
            build_plan("SELECT * FROM t WHERE id = 1 AND id = 2", &router),
            Err(Error::RouteUnresolvable(_))
        );
    }

    #[test]
    fn test_global_only_routes_to_one_replica() {
        let router = sbtest_router();
        let plan = build_plan("SELECT * FROM g", &router).unwrap();
        let node = plan.root().as_merge().unwrap();
        assert_eq!(node.route_len(), 1);
        assert_eq!(node.querys()[0].query, "SELECT * FROM g");
        assert!(["b0", "b1", "b2", "b3"].contains(&node.querys()[0].backend.as_str()));
    }

    #[test]
    fn test_structural_rejections() {
        let router = sbtest_router();
        assert_matches!(
            build_plan("SELECT * FROM t WHERE a = (SELECT 1)", &router),
            Err(Error::UnsupportedSubquery)
        );
        assert_matches!(
            build_plan("SELECT * FROM (SELECT * FROM t) x", &router),
            Err(Error::UnsupportedSubquery)
        );
        assert_matches!(
            build_plan("SELECT * FROM nope", &router),
            Err(Error::TableUnknown(_))
        );
        assert_matches!(
            build_plan("SELECT b FROM t GROUP BY a", &router),
            Err(Error::UnsupportedGroupBy(_))
        );
        assert_matches!(
            build_plan(
                "SELECT t1.a FROM t t1 JOIN t t2 ON t1.a = t2.b ORDER BY t2.missing",
                &router,
            ),
            Err(Error::ColumnUnknown(_))
        );
        assert_matches!(
            build_plan("SELECT COUNT(*) FROM t t1 JOIN t t2 ON t1.a = t2.b", &router),
            Err(Error::UnsupportedAggregate(_))
        );
    }

    #[test]
    fn test_having_splits_between_shard_and_proxy() {
        let router = sbtest_router();

        // A single-side predicate travels with that side's fragment.
        let plan = build_plan(
            "SELECT t1.a, t2.b FROM t t1 JOIN t t2 ON t1.a = t2.b HAVING t1.a > 5",
            &router,
        )
        .unwrap();
        let join = plan.root().as_join().unwrap();
        assert!(join.left().as_merge().unwrap().querys()[0]
            .query
            .contains("HAVING t1.a > 5"));

        // A cross-side predicate becomes a proxy-side filter over the
        // joined field list.
        let plan = build_plan(
            "SELECT t1.a, t2.b FROM t t1 JOIN t t2 ON t1.a = t2.b HAVING t1.a > t2.b",
            &router,
        )
        .unwrap();
        let filter = plan
            .children()
            .iter()
            .find_map(|c| match c {
                ChildPlan::Filter(f) => Some(f),
                _ => None,
            })
            .unwrap();
        let indexes: Vec<_> = filter.refs().iter().map(|(_, i)| *i).collect();
        assert_eq!(indexes, vec![0, 1]);

        assert_matches!(
            build_plan("SELECT a FROM t GROUP BY a HAVING COUNT(*) > 2", &router),
            Err(Error::UnsupportedAggregate(_))
        );
    }

    #[test]
    fn test_build_query_is_idempotent() {
        let router = sbtest_router();
        let mut plan = build_plan("SELECT * FROM t WHERE id = 7", &router).unwrap();
        let first: Vec<_> = plan.querys().into_iter().cloned().collect();
        plan.root.build_query().unwrap();
        let second: Vec<_> = plan.querys().into_iter().cloned().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_for_update_propagates_to_fragments() {
        let router = sbtest_router();
        let plan = build_plan(
            "SELECT t1.a FROM t t1 JOIN t t2 ON t1.a = t2.b FOR UPDATE",
            &router,
        )
        .unwrap();
        let join = plan.root().as_join().unwrap();
        assert!(join.left().as_merge().unwrap().querys()[0]
            .query
            .ends_with("FOR UPDATE"));
    }

    #[test]
    fn test_plan_surface() {
        let router = sbtest_router();
        let plan = build_plan("SELECT a FROM t", &router).unwrap();
        assert_eq!(plan.plan_type(), PlanType::Select);
        assert_eq!(plan.plan_type().to_string(), "select");
        assert_eq!(plan.size(), "SELECT a FROM t".len());
        assert_eq!(plan.database(), "sbtest");
        assert_eq!(plan.json()["Project"], json!("a"));
    }
}
