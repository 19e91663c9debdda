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

use sqlparser::ast::Expr;

use crate::expr::ColumnRef;

/// A HAVING predicate that crosses join sides and therefore runs in the
/// proxy, after the join, against the gathered field list.
#[derive(Debug, Clone)]
pub struct FilterPlan {
    expr: Expr,
    /// Column references with their resolved field-list indexes.
    refs: Vec<(ColumnRef, usize)>,
}

impl FilterPlan {
    pub fn new(expr: Expr, refs: Vec<(ColumnRef, usize)>) -> Self {
        Self { expr, refs }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn refs(&self) -> &[(ColumnRef, usize)] {
        &self.refs
    }
}
