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

//! FROM-clause scanning and WHERE analysis: turns table expressions into
//! the plan-node tree and distributes predicate conjuncts over it.

use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions, Expr, JoinConstraint, JoinOperator, ObjectName, Query, SetExpr,
    TableAlias, TableFactor, TableWithJoins,
};

use shardbridge_common::error::{Error, Result};

use crate::expr::{classify_condition, split_and_exprs, Condition};
use crate::node::{JoinKind, JoinNode, MergeNode, PlanNode};
use crate::router::Router;
use crate::table::TableInfo;

pub(crate) struct PlanBuilder<'a> {
    router: &'a dyn Router,
    database: String,
    order: usize,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(router: &'a dyn Router, database: &str) -> Self {
        Self {
            router,
            database: database.to_string(),
            order: 0,
        }
    }

    /// Structural rejection. Runs before anything touches the router.
    pub fn reject_unsupported(query: &Query) -> Result<()> {
        if query.with.is_some() {
            return Err(Error::UnsupportedSubquery);
        }
        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            SetExpr::Query(_) => return Err(Error::UnsupportedSubquery),
            SetExpr::SetOperation { .. } => {
                return Err(Error::Unsupported("union in select statement".into()))
            }
            other => {
                return Err(Error::Unsupported(format!(
                    "query body [{other}] in select statement"
                )))
            }
        };
        for twj in &select.from {
            reject_factor(&twj.relation)?;
            for join in &twj.joins {
                reject_factor(&join.relation)?;
            }
        }
        let flow = visit_expressions(query, |e| match e {
            Expr::Subquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. } => {
                ControlFlow::Break(Error::UnsupportedSubquery)
            }
            _ => ControlFlow::Continue(()),
        });
        match flow {
            ControlFlow::Break(err) => Err(err),
            ControlFlow::Continue(()) => Ok(()),
        }
    }

    /// Walks the FROM clause into a plan-node tree; comma-separated items
    /// plan as cross joins.
    pub fn scan_from(&mut self, from: &[TableWithJoins]) -> Result<PlanNode> {
        let mut items = from.iter();
        let first = items
            .next()
            .ok_or_else(|| Error::Unsupported("select without a FROM clause".into()))?;
        let mut root = self.scan_table_with_joins(first)?;
        for twj in items {
            let right = self.scan_table_with_joins(twj)?;
            root = self.join(root, right, &JoinOperator::CrossJoin)?;
        }
        Ok(root)
    }

    fn scan_table_with_joins(&mut self, twj: &TableWithJoins) -> Result<PlanNode> {
        let mut root = self.scan_factor(&twj.relation)?;
        for join in &twj.joins {
            let right = self.scan_factor(&join.relation)?;
            root = self.join(root, right, &join.join_operator)?;
        }
        Ok(root)
    }

    fn scan_factor(&mut self, factor: &TableFactor) -> Result<PlanNode> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let info = self.table_info(name, alias.as_ref())?;
                let order = self.next_order();
                let node = MergeNode::new(info, factor.clone(), order)?;
                Ok(PlanNode::Merge(Box::new(node)))
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                let mut node = self.scan_table_with_joins(table_with_joins)?;
                node.set_paren();
                Ok(node)
            }
            TableFactor::Derived { .. } => Err(Error::UnsupportedSubquery),
            other => Err(Error::Unsupported(format!(
                "table expression [{other}]"
            ))),
        }
    }

    fn table_info(&self, name: &ObjectName, alias: Option<&TableAlias>) -> Result<TableInfo> {
        let idents: Vec<&str> = name.0.iter().map(|i| i.value.as_str()).collect();
        let (database, table) = match idents.as_slice() {
            [table] => {
                if self.database.is_empty() {
                    return Err(Error::TableUnknown(format!(
                        "{table}: no database selected"
                    )));
                }
                (self.database.clone(), table.to_string())
            }
            [database, table] => (database.to_string(), table.to_string()),
            _ => {
                return Err(Error::Unsupported(format!(
                    "table name [{name}]"
                )))
            }
        };
        let shard = self.router.table(&database, &table)?;
        Ok(TableInfo {
            database,
            name: table,
            alias: alias.map(|a| a.name.value.clone()),
            shard_type: shard.shard_type,
            shard_key: shard.shard_key,
            segments: vec![],
            index: None,
        })
    }

    /// Combines two scanned sides under a join operator. A side referring
    /// only to replicated tables fuses into the other side so the join runs
    /// shard-locally; otherwise a join node is produced and its ON clause
    /// is split over the tree.
    fn join(&mut self, left: PlanNode, right: PlanNode, op: &JoinOperator) -> Result<PlanNode> {
        let (constraint, kind, swapped) = match op {
            JoinOperator::Inner(c) => (Some(c), JoinKind::Inner, false),
            JoinOperator::CrossJoin => (None, JoinKind::Cross, false),
            JoinOperator::LeftOuter(c) => (Some(c), JoinKind::Left, false),
            // RIGHT JOIN plans as LEFT JOIN with the sides swapped.
            JoinOperator::RightOuter(c) => (Some(c), JoinKind::Left, true),
            other => {
                return Err(Error::Unsupported(format!("join operator [{other:?}]")))
            }
        };
        let on_expr = match constraint {
            None | Some(JoinConstraint::None) => None,
            Some(JoinConstraint::On(expr)) => Some(expr.clone()),
            Some(JoinConstraint::Natural) => {
                return Err(Error::Unsupported("natural join".into()))
            }
            Some(JoinConstraint::Using(_)) => {
                return Err(Error::Unsupported("join with USING".into()))
            }
        };
        let (left, right) = if swapped { (right, left) } else { (left, right) };
        let is_left = kind == JoinKind::Left;

        // Scan-time fusion: a replicated right side joins locally on every
        // shard of the left; a replicated left side does too unless the
        // join is LEFT (unmatched replicated rows would duplicate per
        // shard).
        let fusable = left.as_merge().is_some()
            && right.as_merge().is_some()
            && (right.non_global_count() == 0
                || (left.non_global_count() == 0 && !is_left));
        if fusable {
            let (PlanNode::Merge(mut lm), PlanNode::Merge(rm)) = (left, right) else {
                return Err(Error::Internal("fusable sides are not merges".into()));
            };
            let op_ast = match (kind, on_expr.clone()) {
                (JoinKind::Cross, _) => JoinOperator::CrossJoin,
                (JoinKind::Inner, Some(e)) => JoinOperator::Inner(JoinConstraint::On(e)),
                (JoinKind::Inner, None) => JoinOperator::Inner(JoinConstraint::None),
                (JoinKind::Left, Some(e)) => JoinOperator::LeftOuter(JoinConstraint::On(e)),
                (JoinKind::Left, None) => JoinOperator::LeftOuter(JoinConstraint::None),
            };
            lm.fuse_right(*rm, op_ast)?;
            // The ON text stays in the fused statement; its shard-key
            // equalities still narrow the route.
            if let Some(on) = on_expr {
                let scope: Vec<String> =
                    lm.tables().iter().map(|t| t.ident().to_string()).collect();
                let scope_refs: Vec<&str> = scope.iter().map(String::as_str).collect();
                for part in split_and_exprs(on) {
                    if let Condition::Filter(tuple) = classify_condition(part, &scope_refs)? {
                        lm.narrow(&tuple, self.router)?;
                    }
                }
            }
            return Ok(PlanNode::Merge(lm));
        }

        let order = self.next_order();
        let mut node = PlanNode::Join(Box::new(JoinNode::new(left, right, kind, order)));
        if let Some(on) = on_expr {
            let scope = node.table_idents();
            let scope_refs: Vec<&str> = scope.iter().map(String::as_str).collect();
            let mut saw_column_filter = false;
            let mut saw_equality = false;
            for part in split_and_exprs(on) {
                match classify_condition(part, &scope_refs)? {
                    Condition::Join(tuple) => {
                        saw_equality = true;
                        node.push_equal_cmpr(tuple, self.router)?;
                    }
                    Condition::Filter(tuple) => {
                        if tuple.unresolved {
                            return Err(Error::ColumnUnknown(format!(
                                "ambiguous column in [{}]",
                                tuple.expr
                            )));
                        }
                        if !tuple.referred_tables.is_empty() {
                            saw_column_filter = true;
                            if is_left {
                                // Filtering one side of a LEFT JOIN inside
                                // ON is not equivalent to a WHERE push.
                                return Err(Error::Unsupported(format!(
                                    "on clause [{}] in left join",
                                    tuple.expr
                                )));
                            }
                        }
                        node.push_filter(tuple, self.router)?;
                    }
                }
            }
            if saw_column_filter && !saw_equality {
                if let PlanNode::Join(join) = &mut node {
                    join.mark_nested_loop();
                }
            }
        }
        Ok(node)
    }

    /// Splits WHERE into conjuncts and distributes them: filters sink to
    /// the deepest covering node, cross-side equalities attach at their
    /// join. For a tree that is already a single merge node the predicates
    /// stay in its statement and only narrow the route.
    pub fn process_where(
        &mut self,
        root: &mut PlanNode,
        selection: Option<&Expr>,
        narrow_only: bool,
    ) -> Result<()> {
        let Some(selection) = selection else {
            return Ok(());
        };
        let scope = root.table_idents();
        let scope_refs: Vec<&str> = scope.iter().map(String::as_str).collect();
        for part in split_and_exprs(selection.clone()) {
            match classify_condition(part, &scope_refs)? {
                Condition::Join(tuple) => {
                    if !narrow_only {
                        root.push_equal_cmpr(tuple, self.router)?;
                    }
                }
                Condition::Filter(tuple) => {
                    if narrow_only {
                        let node = root
                            .as_merge_mut()
                            .ok_or_else(|| Error::Internal("narrow-only on a join".into()))?;
                        node.narrow(&tuple, self.router)?;
                    } else {
                        root.push_filter(tuple, self.router)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn next_order(&mut self) -> usize {
        let order = self.order;
        self.order += 1;
        order
    }
}

fn reject_factor(factor: &TableFactor) -> Result<()> {
    match factor {
        TableFactor::Table { .. } => Ok(()),
        TableFactor::Derived { .. } => Err(Error::UnsupportedSubquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            reject_factor(&table_with_joins.relation)?;
            for join in &table_with_joins.joins {
                reject_factor(&join.relation)?;
            }
            Ok(())
        }
        other => Err(Error::Unsupported(format!("table expression [{other}]"))),
    }
}
