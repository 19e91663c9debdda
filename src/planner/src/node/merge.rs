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

use std::collections::HashSet;
use std::ops::ControlFlow;

use rand::Rng;
use serde::Serialize;
use sqlparser::ast::{
    visit_expressions_mut, Expr, GroupByExpr, Ident, Join, JoinOperator, LockClause, ObjectName,
    OrderBy, OrderByExpr, Query, Select, SelectItem, SetExpr, TableFactor, TableWithJoins, Value,
};
use tracing::debug;

use shardbridge_common::error::{Error, Result};

use crate::expr::{
    and_exprs, canonical, column_expr, parse_query, FilterTuple, JoinTuple, SelectTuple,
};
use crate::plan::{AggregatePlan, ChildPlan, GroupItem, OrderByPlan, OrderField, OrderType};
use crate::router::Router;
use crate::table::TableInfo;

/// One rendered shard-bound fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryTuple {
    #[serde(rename = "Query")]
    pub query: String,
    #[serde(rename = "Backend")]
    pub backend: String,
    #[serde(rename = "Range")]
    pub range: String,
}

/// Position of a bind variable inside a rendered fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindLocation {
    pub offset: usize,
    pub length: usize,
    pub var: String,
}

/// A rendered fragment with the positions the join driver patches
/// per outer row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub raw: String,
    pub bind_locations: Vec<BindLocation>,
}

/// Leaf plan node: this subtree is sent verbatim to one or more backends
/// and the results concatenated.
///
/// Nodes created for one side of a surviving join hold a synthesized
/// statement that the planner populates; when the whole tree collapses to a
/// single merge node the original statement is attached wholesale instead.
#[derive(Debug)]
pub struct MergeNode {
    query: Query,
    synthetic: bool,
    tables: Vec<TableInfo>,
    route_len: usize,
    backend: Option<String>,
    index: Vec<usize>,
    filters: Vec<Expr>,
    filter_keys: HashSet<String>,
    fields: Vec<SelectTuple>,
    children: Vec<ChildPlan>,
    querys: Vec<QueryTuple>,
    parsed_querys: Vec<ParsedQuery>,
    bind_vars: Vec<String>,
    has_paren: bool,
    order: usize,
}

impl MergeNode {
    /// A leaf for a single table reference; the factor keeps the user's
    /// alias so qualified references stay valid after renaming.
    pub(crate) fn new(table: TableInfo, factor: TableFactor, order: usize) -> Result<MergeNode> {
        let mut query = parse_query("SELECT * FROM t")?;
        let select = select_mut(&mut query);
        select.projection.clear();
        select.from = vec![TableWithJoins {
            relation: factor,
            joins: vec![],
        }];
        Ok(MergeNode {
            query,
            synthetic: true,
            tables: vec![table],
            route_len: 0,
            backend: None,
            index: vec![],
            filters: vec![],
            filter_keys: HashSet::new(),
            fields: vec![],
            children: vec![],
            querys: vec![],
            parsed_querys: vec![],
            bind_vars: vec![],
            has_paren: false,
            order,
        })
    }

    pub fn tables(&self) -> &[TableInfo] {
        &self.tables
    }

    pub fn route_len(&self) -> usize {
        self.route_len
    }

    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    pub fn shard_index(&self) -> &[usize] {
        &self.index
    }

    pub fn querys(&self) -> &[QueryTuple] {
        &self.querys
    }

    pub fn parsed_querys(&self) -> &[ParsedQuery] {
        &self.parsed_querys
    }

    pub fn fields(&self) -> &[SelectTuple] {
        &self.fields
    }

    pub fn children(&self) -> &[ChildPlan] {
        &self.children
    }

    pub fn push_child(&mut self, child: ChildPlan) {
        self.children.push(child);
    }

    pub fn has_paren(&self) -> bool {
        self.has_paren
    }

    pub fn set_paren(&mut self) {
        self.has_paren = true;
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn contains_table(&self, ident: &str) -> bool {
        self.tables.iter().any(|t| t.matches_qualifier(ident))
    }

    pub fn non_global_count(&self) -> usize {
        self.tables.iter().filter(|t| !t.is_global()).count()
    }

    /// Records a filter (deduplicated by structural form) and narrows the
    /// route when it is a shard-key equality.
    pub fn push_filter(&mut self, tuple: FilterTuple, router: &dyn Router) -> Result<()> {
        if !self.filter_keys.insert(canonical(&tuple.expr)) {
            return Ok(());
        }
        self.narrow(&tuple, router)?;
        self.filters.push(tuple.expr);
        Ok(())
    }

    /// Shard-key narrowing without recording the filter, for predicates
    /// that already live in this node's statement.
    pub fn narrow(&mut self, tuple: &FilterTuple, router: &dyn Router) -> Result<()> {
        let Some(col) = &tuple.col else {
            return Ok(());
        };
        if tuple.vals.is_empty() {
            return Ok(());
        }
        let table = match &col.table {
            Some(qualifier) => self.tables.iter_mut().find(|t| t.matches_qualifier(qualifier)),
            None if self.tables.len() == 1 => self.tables.first_mut(),
            None => None,
        };
        let Some(table) = table else {
            return Ok(());
        };
        if table.shard_key.is_empty() || !col.name.eq_ignore_ascii_case(&table.shard_key) {
            return Ok(());
        }
        let mut indexes = Vec::new();
        for val in &tuple.vals {
            if val.is_null() {
                continue;
            }
            indexes.extend(router.lookup(
                &table.database,
                &table.name,
                &table.shard_key,
                val,
            )?);
        }
        debug!(
            table = %table.ident(),
            ?indexes,
            "narrowed route by shard-key filter"
        );
        table.narrow(indexes);
        Ok(())
    }

    /// An equality whose two sides both live in this node is an ordinary
    /// local filter.
    pub fn push_equal_cmpr(&mut self, tuple: JoinTuple, router: &dyn Router) -> Result<()> {
        let mut referred_tables = Vec::new();
        for col in [&tuple.left, &tuple.right] {
            if let Some(t) = &col.table {
                if !referred_tables.contains(t) {
                    referred_tables.push(t.clone());
                }
            }
        }
        self.push_filter(
            FilterTuple {
                expr: tuple.expr,
                referred_tables,
                unresolved: false,
                col: None,
                vals: vec![],
            },
            router,
        )
    }

    /// Resolves the shard segments this node must contact.
    pub fn calc_route(&mut self, router: &dyn Router) -> Result<()> {
        if self.non_global_count() == 0 {
            // Any replica of a global table serves reads; pick one backend
            // at random with a fresh generator.
            let table = self
                .tables
                .first()
                .ok_or_else(|| Error::Internal("merge node without tables".into()))?;
            let segments = router.segments(&table.database, &table.name, &[])?;
            if segments.is_empty() {
                return Err(Error::RouteUnresolvable(format!(
                    "global table [{}] has no replicas",
                    table.name
                )));
            }
            let pick = rand::rng().random_range(0..segments.len());
            self.backend = Some(segments[pick].backend.clone());
            self.index = vec![pick];
            self.route_len = 1;
            debug!(backend = ?self.backend, "routed all-global node");
            return Ok(());
        }

        // Intersect the narrowed index sets of the sharded tables.
        let mut constraint: Option<Vec<usize>> = None;
        for table in self.tables.iter().filter(|t| !t.is_global()) {
            if let Some(index) = &table.index {
                constraint = Some(match constraint {
                    None => index.clone(),
                    Some(prev) => prev.into_iter().filter(|i| index.contains(i)).collect(),
                });
            }
        }
        if let Some(c) = &constraint {
            if c.is_empty() {
                return Err(Error::RouteUnresolvable(format!(
                    "filters on [{}] exclude every shard",
                    self.tables[0].name
                )));
            }
        }
        let constraint = constraint.unwrap_or_default();

        let mut route_len = None;
        for table in self.tables.iter_mut().filter(|t| !t.is_global()) {
            table.segments = router.segments(&table.database, &table.name, &constraint)?;
            if table.segments.is_empty() {
                return Err(Error::RouteUnresolvable(format!(
                    "table [{}] resolved to no segments",
                    table.name
                )));
            }
            match route_len {
                None => route_len = Some(table.segments.len()),
                Some(len) if len != table.segments.len() => {
                    return Err(Error::Internal(format!(
                        "tables of one fragment are not co-partitioned ({} vs {})",
                        len,
                        table.segments.len()
                    )));
                }
                Some(_) => {}
            }
            table.index = Some(if constraint.is_empty() {
                (0..table.segments.len()).collect()
            } else {
                constraint.clone()
            });
        }
        self.route_len = route_len.unwrap_or(0);
        self.index = if constraint.is_empty() {
            (0..self.route_len).collect()
        } else {
            constraint
        };
        if self.route_len == 1 {
            let backends: Vec<_> = self
                .tables
                .iter()
                .filter(|t| !t.is_global())
                .map(|t| t.segments[0].backend.as_str())
                .collect();
            if backends.windows(2).all(|w| w[0] == w[1]) {
                self.backend = backends.first().map(|b| b.to_string());
            }
        }
        debug!(route_len = self.route_len, backend = ?self.backend, "routed merge node");
        Ok(())
    }

    /// Replaces the synthesized statement with the client's original one;
    /// used when this node is the whole plan. Table metadata is reordered
    /// to the statement's FROM walk so renaming hits the right factors.
    pub(crate) fn attach_select(&mut self, mut query: Query) -> Result<()> {
        let mut found: Vec<(String, Option<String>)> = Vec::new();
        let select = select_mut(&mut query);
        for_each_factor_mut(&mut select.from, &mut |_, factor| {
            if let TableFactor::Table { name, alias, .. } = factor {
                let logical = name.0.last().map(|i| i.value.clone()).unwrap_or_default();
                found.push((logical, alias.as_ref().map(|a| a.name.value.clone())));
            }
        });
        if found.len() != self.tables.len() {
            return Err(Error::Internal(format!(
                "statement has {} table factors, node has {}",
                found.len(),
                self.tables.len()
            )));
        }
        let mut remaining: Vec<TableInfo> = std::mem::take(&mut self.tables);
        for (name, alias) in found {
            let pos = remaining
                .iter()
                .position(|t| t.name == name && t.alias == alias)
                .ok_or_else(|| Error::Internal(format!("table [{name}] lost during scan")))?;
            self.tables.push(remaining.remove(pos));
        }
        self.query = query;
        self.synthetic = false;
        Ok(())
    }

    /// Appends a projected expression, mirroring it into the synthesized
    /// statement; returns the field index.
    pub fn push_select_expr(&mut self, tuple: &SelectTuple) -> usize {
        if self.synthetic {
            select_mut(&mut self.query).projection.push(tuple.item.clone());
        }
        self.fields.push(tuple.clone());
        self.fields.len() - 1
    }

    /// Ensures a plain column is projected; reuses an existing field.
    pub fn push_join_column(&mut self, table: &str, name: &str) -> Result<usize> {
        if !self.contains_table(table) {
            return Err(Error::Internal(format!(
                "column [{table}.{name}] pushed to a node without its table"
            )));
        }
        let existing = self.fields.iter().position(|f| {
            f.is_column
                && f.field.eq_ignore_ascii_case(name)
                && f.qualifier
                    .as_deref()
                    .map_or(self.tables.len() == 1, |q| q.eq_ignore_ascii_case(table))
        });
        if let Some(index) = existing {
            return Ok(index);
        }
        let expr = column_expr(Some(table), name);
        let tuple = SelectTuple {
            item: SelectItem::UnnamedExpr(expr),
            field: name.to_string(),
            label: name.to_string(),
            referred_tables: vec![table.to_string()],
            agg: None,
            is_column: true,
            qualifier: Some(table.to_string()),
            unresolved: false,
        };
        Ok(self.push_select_expr(&tuple))
    }

    /// Select-list analysis for a fan-out merge node: attaches the
    /// aggregate plan, substitutes the rewritten shard select list and
    /// synthesizes the implicit grouping order.
    pub fn push_select_exprs(
        &mut self,
        tuples: Vec<SelectTuple>,
        groups: &[GroupItem],
        push_down: bool,
        fully_pushable: bool,
    ) -> Result<()> {
        let has_agg = tuples.iter().any(|t| t.agg.is_some());
        self.fields = tuples;
        if fully_pushable || (!has_agg && groups.is_empty()) {
            return Ok(());
        }
        let plan = AggregatePlan::build(&self.fields, groups, push_down)?;
        if push_down {
            if !groups.is_empty() && self.query.order_by.is_none() {
                // Grouped streams arrive sorted so the gather can feed
                // aggregation without buffering whole shards.
                let exprs = groups
                    .iter()
                    .map(|g| column_expr(g.table.as_deref(), &g.field))
                    .collect();
                self.set_shipped_order(exprs);
                let orders = plan
                    .group_aggrs()
                    .iter()
                    .zip(groups)
                    .map(|(aggr, g)| OrderField {
                        table: g.table.clone(),
                        field: g.field.clone(),
                        index: aggr.index,
                        order_type: OrderType::Ascending,
                    })
                    .collect();
                self.children.push(ChildPlan::OrderBy(OrderByPlan::new(orders)));
            }
        } else {
            // Shards deliver raw values; grouping and ordering happen in
            // the proxy.
            self.clear_shipped_group_by();
            self.query.order_by = None;
        }
        self.set_projection(plan.rewritten().to_vec());
        self.children.push(ChildPlan::Aggregate(plan));
        Ok(())
    }

    pub fn push_having(&mut self, expr: Expr) {
        if !self.synthetic {
            // The original statement already carries its HAVING clause.
            return;
        }
        let select = select_mut(&mut self.query);
        let existing = select.having.take();
        select.having = and_exprs(existing.into_iter().chain([expr]));
    }

    pub fn set_projection(&mut self, items: Vec<SelectItem>) {
        select_mut(&mut self.query).projection = items;
    }

    pub fn set_shipped_order(&mut self, exprs: Vec<Expr>) {
        self.query.order_by = Some(OrderBy {
            exprs: exprs
                .into_iter()
                .map(|expr| OrderByExpr {
                    expr,
                    asc: Some(true),
                    nulls_first: None,
                    with_fill: None,
                })
                .collect(),
            interpolate: None,
        });
    }

    pub fn set_shipped_limit(&mut self, count: u64) {
        self.query.limit = Some(Expr::Value(Value::Number(count.to_string(), false)));
        self.query.offset = None;
    }

    pub fn clear_shipped_limit(&mut self) {
        self.query.limit = None;
        self.query.offset = None;
    }

    pub fn clear_shipped_group_by(&mut self) {
        select_mut(&mut self.query).group_by = GroupByExpr::Expressions(vec![], vec![]);
    }

    pub fn set_locks(&mut self, locks: &[LockClause]) {
        if self.synthetic {
            self.query.locks = locks.to_vec();
        }
    }

    pub fn register_bind_var(&mut self, var: String) {
        if !self.bind_vars.contains(&var) {
            self.bind_vars.push(var);
        }
    }

    /// Absorbs `right` as a join operand of this node's FROM clause,
    /// merging table metadata and filters. Used both for scan-time fusion
    /// with global tables and for route-time same-backend fusion.
    pub(crate) fn fuse_right(&mut self, right: MergeNode, op: JoinOperator) -> Result<()> {
        let MergeNode {
            query,
            tables,
            filters,
            bind_vars,
            has_paren,
            ..
        } = right;
        let mut twjs = into_select(query)?.from;
        let twj = twjs
            .pop()
            .ok_or_else(|| Error::Internal("fused node without a FROM clause".into()))?;
        if !twjs.is_empty() {
            return Err(Error::Internal("fused node with a comma-join FROM".into()));
        }
        let relation = if twj.joins.is_empty() && !has_paren {
            twj.relation
        } else {
            TableFactor::NestedJoin {
                table_with_joins: Box::new(twj),
                alias: None,
            }
        };
        select_mut(&mut self.query).from[0].joins.push(Join {
            relation,
            global: false,
            join_operator: op,
        });
        self.tables.extend(tables);
        for filter in filters {
            if self.filter_keys.insert(canonical(&filter)) {
                self.filters.push(filter);
            }
        }
        for var in bind_vars {
            self.register_bind_var(var);
        }
        Ok(())
    }

    /// Renders one fragment per route target, substituting physical table
    /// names. The statement itself is never mutated here, so repeated
    /// builds produce identical output.
    pub fn build_query(&mut self) -> Result<()> {
        if self.route_len == 0 {
            return Err(Error::Internal("route not computed before emission".into()));
        }
        if self.synthetic {
            let filters = self.filters.clone();
            let select = select_mut(&mut self.query);
            if select.projection.is_empty() {
                // A side that contributes no columns still needs a valid
                // select list, e.g. a pure existence probe.
                select.projection.push(SelectItem::UnnamedExpr(Expr::Value(Value::Number(
                    "1".into(),
                    false,
                ))));
            }
            select.selection = and_exprs(filters);
        }

        self.querys.clear();
        self.parsed_querys.clear();
        for i in 0..self.route_len {
            let mut query = self.query.clone();
            let mut rewrites: Vec<(String, String)> = Vec::new();
            let mut walk_err = None;
            {
                let select = select_mut(&mut query);
                let tables = &self.tables;
                for_each_factor_mut(&mut select.from, &mut |ordinal, factor| {
                    let Some(table) = tables.get(ordinal) else {
                        walk_err = Some(Error::Internal(format!(
                            "table factor {ordinal} has no metadata"
                        )));
                        return;
                    };
                    if table.is_global() {
                        return;
                    }
                    let Some(segment) = table.segments.get(i) else {
                        walk_err = Some(Error::Internal(format!(
                            "table [{}] has no segment {i}",
                            table.name
                        )));
                        return;
                    };
                    if let TableFactor::Table { name, .. } = factor {
                        *name = ObjectName(vec![Ident::new(segment.table.clone())]);
                    }
                    if table.alias.is_none() && table.name != segment.table {
                        rewrites.push((table.name.clone(), segment.table.clone()));
                    }
                });
            }
            if let Some(err) = walk_err {
                return Err(err);
            }
            if !rewrites.is_empty() {
                // Qualified references to an unaliased table must follow
                // the physical rename.
                let _ = visit_expressions_mut(&mut query, |e| {
                    if let Expr::CompoundIdentifier(idents) = e {
                        if idents.len() >= 2 {
                            let pos = idents.len() - 2;
                            if let Some((_, physical)) = rewrites
                                .iter()
                                .find(|(logical, _)| logical.eq_ignore_ascii_case(&idents[pos].value))
                            {
                                idents[pos] = Ident::new(physical.clone());
                            }
                        }
                    }
                    ControlFlow::<()>::Continue(())
                });
            }

            let (backend, range) = self.route_target(i)?;
            let raw = query.to_string();
            let bind_locations = scan_bind_locations(&raw, &self.bind_vars);
            self.querys.push(QueryTuple {
                query: raw.clone(),
                backend,
                range,
            });
            self.parsed_querys.push(ParsedQuery {
                raw,
                bind_locations,
            });
        }
        Ok(())
    }

    fn route_target(&self, i: usize) -> Result<(String, String)> {
        for table in &self.tables {
            if !table.is_global() {
                let segment = table.segments.get(i).ok_or_else(|| {
                    Error::Internal(format!("table [{}] has no segment {i}", table.name))
                })?;
                return Ok((segment.backend.clone(), segment.range.clone()));
            }
        }
        let backend = self
            .backend
            .clone()
            .ok_or_else(|| Error::Internal("all-global node without a pinned backend".into()))?;
        Ok((backend, String::new()))
    }

}

fn select_mut(query: &mut Query) -> &mut Select {
    match query.body.as_mut() {
        SetExpr::Select(select) => select,
        // Guarded by statement validation before any node is built.
        _ => unreachable!("merge node holds a plain select"),
    }
}

fn into_select(query: Query) -> Result<Select> {
    match *query.body {
        SetExpr::Select(select) => Ok(*select),
        _ => Err(Error::Internal("merge node holds a plain select".into())),
    }
}

/// Visits every table factor in FROM-walk order (relation first, then each
/// join operand, recursing through parenthesized groups), passing its
/// ordinal. The ordinal order matches the node's table list.
fn for_each_factor_mut(
    from: &mut [TableWithJoins],
    f: &mut impl FnMut(usize, &mut TableFactor),
) {
    let mut ordinal = 0;
    for twj in from {
        walk_table_with_joins(twj, &mut ordinal, f);
    }
}

fn walk_table_with_joins(
    twj: &mut TableWithJoins,
    ordinal: &mut usize,
    f: &mut impl FnMut(usize, &mut TableFactor),
) {
    walk_factor(&mut twj.relation, ordinal, f);
    for join in &mut twj.joins {
        walk_factor(&mut join.relation, ordinal, f);
    }
}

fn walk_factor(
    factor: &mut TableFactor,
    ordinal: &mut usize,
    f: &mut impl FnMut(usize, &mut TableFactor),
) {
    match factor {
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => walk_table_with_joins(table_with_joins, ordinal, f),
        other => {
            f(*ordinal, other);
            *ordinal += 1;
        }
    }
}

fn scan_bind_locations(raw: &str, vars: &[String]) -> Vec<BindLocation> {
    let mut out = Vec::new();
    for var in vars {
        let pattern = format!(":{var}");
        for (offset, matched) in raw.match_indices(&pattern) {
            let end = offset + matched.len();
            let boundary = raw[end..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_ascii_alphanumeric() && c != '_');
            if boundary {
                out.push(BindLocation {
                    offset,
                    length: matched.len(),
                    var: var.clone(),
                });
            }
        }
    }
    out.sort_by_key(|l| l.offset);
    out
}
