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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Ascending,
    Descending,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Ascending => write!(f, "ASC"),
            OrderType::Descending => write!(f, "DESC"),
        }
    }
}

/// One ordering key, resolved to an index into the gathered field list.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderField {
    pub table: Option<String>,
    pub field: String,
    pub index: usize,
    pub order_type: OrderType,
}

impl OrderField {
    pub fn label(&self) -> String {
        match &self.table {
            Some(t) => format!("{}.{}", t, self.field),
            None => self.field.clone(),
        }
    }
}

/// Multi-key sort of the gathered stream; for fan-out plans the shards
/// deliver pre-sorted streams and the proxy runs a streaming k-way merge.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByPlan {
    orders: Vec<OrderField>,
}

impl OrderByPlan {
    pub fn new(orders: Vec<OrderField>) -> Self {
        Self { orders }
    }

    pub fn orders(&self) -> &[OrderField] {
        &self.orders
    }

    /// Ordering-key labels for the explain document.
    pub fn gather_merge_labels(&self) -> Vec<String> {
        self.orders.iter().map(|o| o.label()).collect()
    }
}
