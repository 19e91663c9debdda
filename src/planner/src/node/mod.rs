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

//! The plan-node tree: leaves are shard-bound [`MergeNode`]s, internal
//! nodes are proxy-executed [`JoinNode`]s.

mod join;
mod merge;

pub use join::{FieldSide, JoinKey, JoinKind, JoinNode, JoinStrategy, JoinVar};
pub use merge::{BindLocation, MergeNode, ParsedQuery, QueryTuple};

use sqlparser::ast::{Expr, LockClause};

use shardbridge_common::error::{Error, Result};

use crate::expr::{FilterTuple, JoinTuple, SelectTuple};
use crate::plan::ChildPlan;
use crate::router::Router;

/// A validated item of the FROM clause tree. Every node exposes the same
/// capability set; a join may collapse into a merge during routing, so the
/// route step consumes and returns the node.
#[derive(Debug)]
pub enum PlanNode {
    Merge(Box<MergeNode>),
    Join(Box<JoinNode>),
}

impl PlanNode {
    pub fn as_merge(&self) -> Option<&MergeNode> {
        match self {
            PlanNode::Merge(node) => Some(node),
            PlanNode::Join(_) => None,
        }
    }

    pub fn as_merge_mut(&mut self) -> Option<&mut MergeNode> {
        match self {
            PlanNode::Merge(node) => Some(node),
            PlanNode::Join(_) => None,
        }
    }

    pub fn as_join(&self) -> Option<&JoinNode> {
        match self {
            PlanNode::Join(node) => Some(node),
            PlanNode::Merge(_) => None,
        }
    }

    /// Idents of every table in this subtree, in FROM order.
    pub fn table_idents(&self) -> Vec<String> {
        match self {
            PlanNode::Merge(node) => {
                node.tables().iter().map(|t| t.ident().to_string()).collect()
            }
            PlanNode::Join(node) => {
                let mut idents = node.left().table_idents();
                idents.extend(node.right().table_idents());
                idents
            }
        }
    }

    pub fn contains_table(&self, ident: &str) -> bool {
        match self {
            PlanNode::Merge(node) => node.contains_table(ident),
            PlanNode::Join(node) => {
                node.left().contains_table(ident) || node.right().contains_table(ident)
            }
        }
    }

    pub fn covers(&self, idents: &[String]) -> bool {
        idents.iter().all(|t| self.contains_table(t))
    }

    pub fn non_global_count(&self) -> usize {
        match self {
            PlanNode::Merge(node) => node.non_global_count(),
            PlanNode::Join(node) => {
                node.left().non_global_count() + node.right().non_global_count()
            }
        }
    }

    pub fn order(&self) -> usize {
        match self {
            PlanNode::Merge(node) => node.order(),
            PlanNode::Join(node) => node.order(),
        }
    }

    pub fn has_paren(&self) -> bool {
        match self {
            PlanNode::Merge(node) => node.has_paren(),
            PlanNode::Join(node) => node.has_paren(),
        }
    }

    pub fn set_paren(&mut self) {
        match self {
            PlanNode::Merge(node) => node.set_paren(),
            PlanNode::Join(node) => node.set_paren(),
        }
    }

    /// Attaches a filter at the deepest node whose tables cover it.
    pub fn push_filter(&mut self, tuple: FilterTuple, router: &dyn Router) -> Result<()> {
        match self {
            PlanNode::Merge(node) => node.push_filter(tuple, router),
            PlanNode::Join(node) => {
                if tuple.unresolved {
                    return Err(Error::ColumnUnknown(format!(
                        "ambiguous column in [{}]",
                        tuple.expr
                    )));
                }
                if tuple.referred_tables.is_empty()
                    || node.left_mut().covers(&tuple.referred_tables)
                {
                    node.left_mut().push_filter(tuple, router)
                } else if node.right_mut().covers(&tuple.referred_tables) {
                    node.right_mut().push_filter(tuple, router)
                } else {
                    Err(Error::Unsupported(format!(
                        "clause [{}] spans tables of a cross-shard join",
                        tuple.expr
                    )))
                }
            }
        }
    }

    /// Attaches an equality join predicate at the lowest common ancestor of
    /// its two sides.
    pub fn push_equal_cmpr(&mut self, tuple: JoinTuple, router: &dyn Router) -> Result<()> {
        match self {
            PlanNode::Merge(node) => node.push_equal_cmpr(tuple, router),
            PlanNode::Join(node) => node.push_equal_cmpr(tuple, router),
        }
    }

    /// Resolves shard segments bottom-up; a join whose sides pin to the
    /// same backend collapses into a fused merge node.
    pub fn calc_route(self, router: &dyn Router) -> Result<PlanNode> {
        match self {
            PlanNode::Merge(mut node) => {
                node.calc_route(router)?;
                Ok(PlanNode::Merge(node))
            }
            PlanNode::Join(node) => node.calc_route(router),
        }
    }

    /// Appends a projected expression; returns its index in this node's
    /// field list.
    pub fn push_select_expr(&mut self, tuple: &SelectTuple) -> Result<usize> {
        match self {
            PlanNode::Merge(node) => Ok(node.push_select_expr(tuple)),
            PlanNode::Join(node) => node.push_select_expr(tuple),
        }
    }

    /// Ensures a plain column is projected (used for join keys and bind
    /// variables); returns its index in this node's field list.
    pub fn push_join_column(&mut self, table: &str, name: &str) -> Result<usize> {
        match self {
            PlanNode::Merge(node) => node.push_join_column(table, name),
            PlanNode::Join(node) => node.push_join_column(table, name),
        }
    }

    /// Registers a bind variable on the merge node holding `table`.
    pub fn register_bind_var(&mut self, table: &str, var: String) -> Result<()> {
        match self {
            PlanNode::Merge(node) => {
                node.register_bind_var(var);
                Ok(())
            }
            PlanNode::Join(node) => {
                if node.left_mut().contains_table(table) {
                    node.left_mut().register_bind_var(table, var)
                } else if node.right_mut().contains_table(table) {
                    node.right_mut().register_bind_var(table, var)
                } else {
                    Err(Error::Internal(format!(
                        "bind variable target [{table}] not in subtree"
                    )))
                }
            }
        }
    }

    /// Attaches a HAVING conjunct to the merge node covering its tables.
    pub fn push_having(&mut self, expr: Expr, tables: &[String]) -> Result<()> {
        match self {
            PlanNode::Merge(node) => {
                node.push_having(expr);
                Ok(())
            }
            PlanNode::Join(node) => {
                if node.left_mut().covers(tables) {
                    node.left_mut().push_having(expr, tables)
                } else if node.right_mut().covers(tables) {
                    node.right_mut().push_having(expr, tables)
                } else {
                    Err(Error::Internal(format!(
                        "having clause [{expr}] does not cover one side"
                    )))
                }
            }
        }
    }

    /// Ships the widened `LIMIT 0, n` window to every fragment.
    pub fn push_shipped_limit(&mut self, count: u64) {
        match self {
            PlanNode::Merge(node) => node.set_shipped_limit(count),
            PlanNode::Join(node) => {
                node.left_mut().push_shipped_limit(count);
                node.right_mut().push_shipped_limit(count);
            }
        }
    }

    /// Propagates lock clauses (`FOR UPDATE`) to every fragment.
    pub fn push_misc(&mut self, locks: &[LockClause]) {
        match self {
            PlanNode::Merge(node) => node.set_locks(locks),
            PlanNode::Join(node) => {
                node.left_mut().push_misc(locks);
                node.right_mut().push_misc(locks);
            }
        }
    }

    /// Finalizes join bookkeeping (sort keys, bind variables) on every
    /// surviving join node.
    pub fn prepare_join(&mut self, router: &dyn Router) -> Result<()> {
        match self {
            PlanNode::Merge(_) => Ok(()),
            PlanNode::Join(node) => node.prepare(router),
        }
    }

    /// Renders the shard-bound SQL fragments.
    pub fn build_query(&mut self) -> Result<()> {
        match self {
            PlanNode::Merge(node) => node.build_query(),
            PlanNode::Join(node) => {
                node.left_mut().build_query()?;
                node.right_mut().build_query()
            }
        }
    }

    /// All rendered fragments, leaves left to right.
    pub fn querys(&self) -> Vec<&QueryTuple> {
        match self {
            PlanNode::Merge(node) => node.querys().iter().collect(),
            PlanNode::Join(node) => {
                let mut out = node.left().querys();
                out.extend(node.right().querys());
                out
            }
        }
    }

    pub fn fields(&self) -> &[SelectTuple] {
        match self {
            PlanNode::Merge(node) => node.fields(),
            PlanNode::Join(node) => node.fields(),
        }
    }

    pub fn children(&self) -> &[ChildPlan] {
        match self {
            PlanNode::Merge(node) => node.children(),
            PlanNode::Join(node) => node.children(),
        }
    }

    pub fn push_child(&mut self, child: ChildPlan) {
        match self {
            PlanNode::Merge(node) => node.push_child(child),
            PlanNode::Join(node) => node.push_child(child),
        }
    }
}
