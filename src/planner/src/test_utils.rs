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

//! Test scaffolding: an in-memory router with deterministic modulo
//! partitioning and SQL parse helpers.

use std::collections::HashMap;

use sqlparser::ast::{Expr, Query, SelectItem, SetExpr, Statement};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use shardbridge_common::error::{Error, Result};
use shardbridge_common::types::Datum;

use crate::router::{Router, Segment, ShardTable, ShardType};
use crate::select::SelectPlan;

struct MockTable {
    config: ShardTable,
    segments: Vec<Segment>,
}

/// Deterministic in-memory router: hash tables partition by
/// `value mod shard_count`, one segment per backend in declaration order.
#[derive(Default)]
pub struct MockRouter {
    tables: HashMap<(String, String), MockTable>,
}

impl MockRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hash(&mut self, database: &str, name: &str, shard_key: &str, backends: &[&str]) {
        let step = 32;
        let segments = backends
            .iter()
            .enumerate()
            .map(|(i, backend)| Segment {
                table: format!("{name}_{i:04}"),
                backend: backend.to_string(),
                range: format!("[{}-{})", i * step, (i + 1) * step),
            })
            .collect();
        self.insert(database, name, ShardType::Hash, shard_key, segments);
    }

    pub fn add_global(&mut self, database: &str, name: &str, backends: &[&str]) {
        let segments = backends
            .iter()
            .map(|backend| Segment {
                table: name.to_string(),
                backend: backend.to_string(),
                range: String::new(),
            })
            .collect();
        self.insert(database, name, ShardType::Global, "", segments);
    }

    pub fn add_single(&mut self, database: &str, name: &str, backend: &str) {
        let segments = vec![Segment {
            table: name.to_string(),
            backend: backend.to_string(),
            range: String::new(),
        }];
        self.insert(database, name, ShardType::Single, "", segments);
    }

    fn insert(
        &mut self,
        database: &str,
        name: &str,
        shard_type: ShardType,
        shard_key: &str,
        segments: Vec<Segment>,
    ) {
        self.tables.insert(
            (database.to_string(), name.to_string()),
            MockTable {
                config: ShardTable {
                    database: database.to_string(),
                    name: name.to_string(),
                    shard_type,
                    shard_key: shard_key.to_string(),
                },
                segments,
            },
        );
    }

    fn get(&self, database: &str, table: &str) -> Result<&MockTable> {
        self.tables
            .get(&(database.to_string(), table.to_string()))
            .ok_or_else(|| Error::TableUnknown(format!("{database}.{table}")))
    }
}

impl Router for MockRouter {
    fn table(&self, database: &str, table: &str) -> Result<ShardTable> {
        Ok(self.get(database, table)?.config.clone())
    }

    fn lookup(
        &self,
        database: &str,
        table: &str,
        _shard_key: &str,
        value: &Datum,
    ) -> Result<Vec<usize>> {
        let entry = self.get(database, table)?;
        let count = entry.segments.len();
        match entry.config.shard_type {
            ShardType::Hash => {
                let hash = match value {
                    Datum::Int(v) => v.rem_euclid(count as i64) as usize,
                    Datum::UInt(v) => (*v % count as u64) as usize,
                    Datum::Str(s) => {
                        s.bytes().fold(0usize, |acc, b| acc.wrapping_add(b as usize)) % count
                    }
                    other => {
                        return Err(Error::RouteUnresolvable(format!(
                            "shard-key value [{other}] is not hashable"
                        )))
                    }
                };
                Ok(vec![hash])
            }
            _ => Ok((0..count).collect()),
        }
    }

    fn segments(&self, database: &str, table: &str, indexes: &[usize]) -> Result<Vec<Segment>> {
        let entry = self.get(database, table)?;
        match entry.config.shard_type {
            ShardType::Hash if !indexes.is_empty() => indexes
                .iter()
                .map(|&i| {
                    entry.segments.get(i).cloned().ok_or_else(|| {
                        Error::RouteUnresolvable(format!(
                            "shard index {i} out of range for [{table}]"
                        ))
                    })
                })
                .collect(),
            _ => Ok(entry.segments.clone()),
        }
    }
}

/// The fixture schema most planner tests use: `t(id, …)` hash-sharded over
/// `b0..b3`, `g` replicated everywhere, `s` unpartitioned on `b0`.
pub fn sbtest_router() -> MockRouter {
    let backends = ["b0", "b1", "b2", "b3"];
    let mut router = MockRouter::new();
    router.add_hash("sbtest", "t", "id", &backends);
    router.add_global("sbtest", "g", &backends);
    router.add_single("sbtest", "s", "b0");
    router
}

pub fn parse_statement(sql: &str) -> Query {
    let mut stmts = Parser::parse_sql(&MySqlDialect {}, sql).expect("test sql parses");
    match stmts.pop() {
        Some(Statement::Query(query)) => *query,
        other => panic!("test sql is not a query: {other:?}"),
    }
}

pub fn parse_expr(fragment: &str) -> Expr {
    let query = parse_statement(&format!("SELECT * FROM __scratch WHERE {fragment}"));
    match *query.body {
        SetExpr::Select(select) => select.selection.expect("fragment is an expression"),
        _ => unreachable!(),
    }
}

pub fn parse_projection(fragment: &str) -> Vec<SelectItem> {
    let query = parse_statement(&format!("SELECT {fragment}"));
    match *query.body {
        SetExpr::Select(select) => select.projection,
        _ => unreachable!(),
    }
}

pub fn build_plan(sql: &str, router: &dyn Router) -> Result<SelectPlan> {
    SelectPlan::build("sbtest", sql, parse_statement(sql), router)
}
