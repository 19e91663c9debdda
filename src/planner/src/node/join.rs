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

use std::fmt;

use sqlparser::ast::{Expr, JoinConstraint, JoinOperator, Value};
use tracing::debug;

use shardbridge_common::error::{Error, Result};

use crate::expr::{and_exprs, column_expr, FilterTuple, JoinTuple, SelectTuple};
use crate::plan::ChildPlan;
use crate::router::Router;

use super::PlanNode;

/// The syntactic join shape, for explain output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Cross,
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Cross => "CROSS JOIN",
        };
        write!(f, "{s}")
    }
}

/// How the proxy executes a cross-shard join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStrategy {
    Cartesian,
    NestedLoop,
    SortMerge,
}

impl fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JoinStrategy::Cartesian => "Cartesian Join",
            JoinStrategy::NestedLoop => "Nested Loop Join",
            JoinStrategy::SortMerge => "Sort Merge Join",
        };
        write!(f, "{s}")
    }
}

/// A sort-merge key, resolved to an index in the owning side's field list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKey {
    pub table: String,
    pub field: String,
    pub index: usize,
}

/// A column procured from the outer side and substituted as a bind
/// variable into the inner side's fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinVar {
    pub var: String,
    /// Index of the procured column in the outer side's field list.
    pub left_index: usize,
}

/// Which side of the join an output field comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSide {
    pub is_left: bool,
    /// Index in that side's field list.
    pub index: usize,
}

/// Internal plan node: a join the proxy must execute itself.
#[derive(Debug)]
pub struct JoinNode {
    left: PlanNode,
    right: PlanNode,
    kind: JoinKind,
    strategy: JoinStrategy,
    is_left_join: bool,
    join_on: Vec<JoinTuple>,
    left_keys: Vec<JoinKey>,
    right_keys: Vec<JoinKey>,
    vars: Vec<JoinVar>,
    fields: Vec<SelectTuple>,
    field_sides: Vec<FieldSide>,
    children: Vec<ChildPlan>,
    has_paren: bool,
    order: usize,
}

impl JoinNode {
    pub(crate) fn new(left: PlanNode, right: PlanNode, kind: JoinKind, order: usize) -> JoinNode {
        JoinNode {
            left,
            right,
            kind,
            strategy: JoinStrategy::Cartesian,
            is_left_join: kind == JoinKind::Left,
            join_on: vec![],
            left_keys: vec![],
            right_keys: vec![],
            vars: vec![],
            fields: vec![],
            field_sides: vec![],
            children: vec![],
            has_paren: false,
            order,
        }
    }

    pub fn left(&self) -> &PlanNode {
        &self.left
    }

    pub fn left_mut(&mut self) -> &mut PlanNode {
        &mut self.left
    }

    pub fn right(&self) -> &PlanNode {
        &self.right
    }

    pub fn right_mut(&mut self) -> &mut PlanNode {
        &mut self.right
    }

    pub fn kind(&self) -> JoinKind {
        self.kind
    }

    pub fn strategy(&self) -> JoinStrategy {
        self.strategy
    }

    pub fn is_left_join(&self) -> bool {
        self.is_left_join
    }

    pub fn join_on(&self) -> &[JoinTuple] {
        &self.join_on
    }

    pub fn left_keys(&self) -> &[JoinKey] {
        &self.left_keys
    }

    pub fn right_keys(&self) -> &[JoinKey] {
        &self.right_keys
    }

    pub fn vars(&self) -> &[JoinVar] {
        &self.vars
    }

    pub fn fields(&self) -> &[SelectTuple] {
        &self.fields
    }

    pub fn field_sides(&self) -> &[FieldSide] {
        &self.field_sides
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

    /// An ON clause with column references but no cross-side equality still
    /// drives the inner side per outer row.
    pub(crate) fn mark_nested_loop(&mut self) {
        if self.strategy == JoinStrategy::Cartesian {
            self.strategy = JoinStrategy::NestedLoop;
        }
    }

    /// Attaches an equality join predicate. A predicate whose sides both
    /// live in one child descends; one crossing this join upgrades the
    /// strategy and is recorded for key/bind bookkeeping.
    pub fn push_equal_cmpr(&mut self, tuple: JoinTuple, router: &dyn Router) -> Result<()> {
        let (lt, rt) = match (&tuple.left.table, &tuple.right.table) {
            (Some(l), Some(r)) => (l.clone(), r.clone()),
            _ => {
                return Err(Error::ColumnUnknown(format!(
                    "ambiguous column in [{}]",
                    tuple.expr
                )))
            }
        };
        if self.left.contains_table(&lt) && self.left.contains_table(&rt) {
            return self.left.push_equal_cmpr(tuple, router);
        }
        if self.right.contains_table(&lt) && self.right.contains_table(&rt) {
            return self.right.push_equal_cmpr(tuple, router);
        }
        let oriented = if self.left.contains_table(&lt) && self.right.contains_table(&rt) {
            tuple
        } else if self.left.contains_table(&rt) && self.right.contains_table(&lt) {
            JoinTuple {
                expr: tuple.expr,
                left: tuple.right,
                right: tuple.left,
            }
        } else {
            return Err(Error::ColumnUnknown(format!(
                "join predicate [{}] references tables outside the join",
                tuple.expr
            )));
        };
        if self.strategy == JoinStrategy::Cartesian {
            self.strategy = if self.is_left_join {
                JoinStrategy::NestedLoop
            } else {
                JoinStrategy::SortMerge
            };
        }
        self.join_on.push(oriented);
        Ok(())
    }

    /// Routes both sides; if they pin to the same backend the whole join
    /// collapses into one fused merge node executed shard-locally. This is
    /// the single most important pushdown optimization.
    pub(crate) fn calc_route(mut self: Box<Self>, router: &dyn Router) -> Result<PlanNode> {
        self.left = self.left.calc_route(router)?;
        self.right = self.right.calc_route(router)?;

        let fusable = match (self.left.as_merge(), self.right.as_merge()) {
            (Some(l), Some(r)) => {
                l.route_len() == 1
                    && r.route_len() == 1
                    && l.backend().is_some()
                    && l.backend() == r.backend()
            }
            _ => false,
        };
        if !fusable {
            return Ok(PlanNode::Join(self));
        }

        let JoinNode {
            left,
            right,
            is_left_join,
            join_on,
            has_paren,
            ..
        } = *self;
        let (PlanNode::Merge(mut left), PlanNode::Merge(right)) = (left, right) else {
            return Err(Error::Internal("fusable join sides are not merges".into()));
        };
        let on = and_exprs(join_on.into_iter().map(|t| t.expr));
        let op = match (is_left_join, on) {
            (false, None) => JoinOperator::CrossJoin,
            (false, Some(e)) => JoinOperator::Inner(JoinConstraint::On(e)),
            (true, Some(e)) => JoinOperator::LeftOuter(JoinConstraint::On(e)),
            (true, None) => JoinOperator::LeftOuter(JoinConstraint::None),
        };
        debug!(backend = ?left.backend(), "fused single-backend join into one fragment");
        left.fuse_right(*right, op)?;
        if has_paren {
            left.set_paren();
        }
        Ok(PlanNode::Merge(left))
    }

    /// Appends a projected expression to the side covering it.
    pub fn push_select_expr(&mut self, tuple: &SelectTuple) -> Result<usize> {
        if tuple.unresolved {
            return Err(Error::ColumnUnknown(format!(
                "ambiguous column [{}] in a cross-shard join",
                tuple.field
            )));
        }
        if tuple.field == "*" && tuple.qualifier.is_none() {
            return Err(Error::Unsupported(
                "wildcard select in a cross-shard join".into(),
            ));
        }
        let (side, is_left) = if tuple.referred_tables.is_empty()
            || self.left.covers(&tuple.referred_tables)
        {
            (&mut self.left, true)
        } else if self.right.covers(&tuple.referred_tables) {
            (&mut self.right, false)
        } else {
            return Err(Error::Unsupported(format!(
                "select expression [{}] spans tables of a cross-shard join",
                tuple.field
            )));
        };
        let index = side.push_select_expr(tuple)?;
        self.fields.push(tuple.clone());
        self.field_sides.push(FieldSide { is_left, index });
        Ok(self.fields.len() - 1)
    }

    /// Ensures a plain column is part of this join's output, descending to
    /// the side holding its table.
    pub fn push_join_column(&mut self, table: &str, name: &str) -> Result<usize> {
        let existing = self.fields.iter().position(|f| {
            f.is_column
                && f.field.eq_ignore_ascii_case(name)
                && f.qualifier
                    .as_deref()
                    .is_some_and(|q| q.eq_ignore_ascii_case(table))
        });
        if let Some(index) = existing {
            return Ok(index);
        }
        let (side, is_left) = if self.left.contains_table(table) {
            (&mut self.left, true)
        } else if self.right.contains_table(table) {
            (&mut self.right, false)
        } else {
            return Err(Error::Internal(format!(
                "column [{table}.{name}] pushed to a join without its table"
            )));
        };
        let index = side.push_join_column(table, name)?;
        self.fields.push(SelectTuple {
            item: sqlparser::ast::SelectItem::UnnamedExpr(column_expr(Some(table), name)),
            field: name.to_string(),
            label: name.to_string(),
            referred_tables: vec![table.to_string()],
            agg: None,
            is_column: true,
            qualifier: Some(table.to_string()),
            unresolved: false,
        });
        self.field_sides.push(FieldSide { is_left, index });
        Ok(self.fields.len() - 1)
    }

    /// Finalizes strategy bookkeeping once the select list is in place:
    /// sort-merge keys get projected and shipped as per-side orderings,
    /// nested-loop predicates become bind-variable filters on the inner
    /// side.
    pub(crate) fn prepare(&mut self, router: &dyn Router) -> Result<()> {
        match self.strategy {
            JoinStrategy::SortMerge => {
                for tuple in self.join_on.clone() {
                    let (lt, ln) = (
                        tuple.left.table.clone().unwrap_or_default(),
                        tuple.left.name.clone(),
                    );
                    let (rt, rn) = (
                        tuple.right.table.clone().unwrap_or_default(),
                        tuple.right.name.clone(),
                    );
                    let li = self.left.push_join_column(&lt, &ln)?;
                    let ri = self.right.push_join_column(&rt, &rn)?;
                    self.left_keys.push(JoinKey {
                        table: lt,
                        field: ln,
                        index: li,
                    });
                    self.right_keys.push(JoinKey {
                        table: rt,
                        field: rn,
                        index: ri,
                    });
                }
                // Each side arrives sorted by its join keys so the driver
                // can merge the streams.
                Self::ship_key_order(&mut self.left, &self.left_keys);
                Self::ship_key_order(&mut self.right, &self.right_keys);
            }
            JoinStrategy::NestedLoop => {
                for tuple in self.join_on.clone() {
                    let (lt, ln) = (
                        tuple.left.table.clone().unwrap_or_default(),
                        tuple.left.name.clone(),
                    );
                    let (rt, rn) = (
                        tuple.right.table.clone().unwrap_or_default(),
                        tuple.right.name.clone(),
                    );
                    let left_index = self.left.push_join_column(&lt, &ln)?;
                    let var = format!("{lt}_{ln}");
                    let filter = Expr::BinaryOp {
                        left: Box::new(column_expr(Some(&rt), &rn)),
                        op: sqlparser::ast::BinaryOperator::Eq,
                        right: Box::new(Expr::Value(Value::Placeholder(format!(":{var}")))),
                    };
                    self.right.push_filter(
                        FilterTuple {
                            expr: filter,
                            referred_tables: vec![rt.clone()],
                            unresolved: false,
                            col: None,
                            vals: vec![],
                        },
                        router,
                    )?;
                    self.right.register_bind_var(&rt, var.clone())?;
                    self.vars.push(JoinVar {
                        var,
                        left_index,
                    });
                }
            }
            JoinStrategy::Cartesian => {}
        }
        self.left.prepare_join(router)?;
        self.right.prepare_join(router)
    }

    fn ship_key_order(side: &mut PlanNode, keys: &[JoinKey]) {
        if keys.is_empty() {
            return;
        }
        if let PlanNode::Merge(node) = side {
            let exprs = keys
                .iter()
                .map(|k| column_expr(Some(&k.table), &k.field))
                .collect();
            node.set_shipped_order(exprs);
        }
    }
}
