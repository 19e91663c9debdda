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

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use shardbridge_common::catalog::Schema;
use shardbridge_common::types::Datum;
use shardbridge_planner::plan::Aggregator;

use crate::aggregate::{AggEvaluateContext, Aggregation};

/// Hash GROUP BY driver: buckets rows by the encoded bytes of the group
/// columns and drives one context vector per bucket. Output preserves
/// first-seen group order.
#[derive(Debug)]
pub struct HashAggregator {
    agg: Aggregation,
    group_indexes: Vec<usize>,
    buckets: HashMap<Vec<u8>, usize>,
    states: Vec<(Vec<Datum>, Vec<AggEvaluateContext>)>,
}

impl HashAggregator {
    pub fn new(normal: &[Aggregator], group: &[Aggregator]) -> HashAggregator {
        HashAggregator {
            agg: Aggregation::new(normal.to_vec()),
            group_indexes: group.iter().map(|g| g.index).collect(),
            buckets: HashMap::new(),
            states: Vec::new(),
        }
    }

    /// Promotes aggregate field metadata; apply before streaming rows.
    pub fn fix_fields(&self, schema: &mut Schema) {
        self.agg.fix_fields(schema);
    }

    pub fn push_row(&mut self, row: Vec<Datum>) {
        let mut key = Vec::new();
        for &index in &self.group_indexes {
            row.get(index).unwrap_or(&Datum::Null).encode_into(&mut key);
        }
        match self.buckets.entry(key) {
            Entry::Occupied(entry) => {
                let (_, ctxs) = &mut self.states[*entry.get()];
                self.agg.update(&row, ctxs);
            }
            Entry::Vacant(entry) => {
                let ctxs = self.agg.init_eval_contexts(&row);
                entry.insert(self.states.len());
                self.states.push((row, ctxs));
            }
        }
    }

    /// Finishes every group: aggregate results overwrite their columns and
    /// combined-AVG sibling columns are stripped. An ungrouped aggregation
    /// over an empty stream still yields its one row (`COUNT` of nothing
    /// is 0).
    pub fn finalize(mut self, schema: &Schema) -> Vec<Vec<Datum>> {
        if self.states.is_empty() && self.group_indexes.is_empty() {
            let nulls = vec![Datum::Null; schema.len()];
            let ctxs = self.agg.init_eval_contexts(&nulls);
            self.states.push((nulls, ctxs));
        }
        let mut out = Vec::with_capacity(self.states.len());
        for (mut row, ctxs) in self.states {
            let deleted = self.agg.get_results(&ctxs, schema, &mut row);
            remove_columns(&mut row, &deleted);
            out.push(row);
        }
        out
    }
}

/// Strips the given column positions (as reported by
/// [`Aggregation::get_results`]) from a row or a field list.
pub fn remove_columns<T>(items: &mut Vec<T>, deleted: &[usize]) {
    let mut deleted = deleted.to_vec();
    deleted.sort_unstable();
    deleted.dedup();
    for index in deleted.into_iter().rev() {
        if index < items.len() {
            items.remove(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use sqlparser::ast::{SelectItem, SetExpr, Statement};
    use sqlparser::dialect::MySqlDialect;
    use sqlparser::parser::Parser;

    use shardbridge_common::catalog::{Field, Schema};
    use shardbridge_common::types::DataType;
    use shardbridge_planner::expr::parse_select_items;
    use shardbridge_planner::plan::{AggregatePlan, AggrType, GroupItem};

    use super::*;

    fn projection(sql: &str) -> Vec<SelectItem> {
        let mut stmts = Parser::parse_sql(&MySqlDialect {}, sql).unwrap();
        let Some(Statement::Query(query)) = stmts.pop() else {
            panic!("not a query");
        };
        match *query.body {
            SetExpr::Select(select) => select.projection,
            _ => panic!("not a select"),
        }
    }

    #[test]
    fn test_grouped_combine() {
        // Partial per-shard counts grouped by the first column.
        let group = vec![Aggregator {
            label: "k".into(),
            index: 0,
            kind: AggrType::GroupBy,
            distinct: false,
            push_down: true,
        }];
        let normal = vec![Aggregator {
            label: "count(*)".into(),
            index: 1,
            kind: AggrType::Count,
            distinct: false,
            push_down: true,
        }];
        let mut driver = HashAggregator::new(&normal, &group);
        let mut schema = Schema::new(vec![
            Field::with_name(DataType::VarChar, "k"),
            Field::with_name(DataType::Int64, "count(*)"),
        ]);
        driver.fix_fields(&mut schema);

        for (k, n) in [("x", 2i64), ("y", 3), ("x", 5)] {
            driver.push_row(vec![Datum::Str(k.into()), Datum::Int(n)]);
        }
        let rows = driver.finalize(&schema);
        assert_eq!(
            rows,
            vec![
                vec![Datum::Str("x".into()), Datum::Int(7)],
                vec![Datum::Str("y".into()), Datum::Int(3)],
            ]
        );
    }

    #[test]
    fn test_empty_stream_counts_zero() {
        let normal = vec![Aggregator {
            label: "count(*)".into(),
            index: 0,
            kind: AggrType::Count,
            distinct: false,
            push_down: true,
        }];
        let driver = HashAggregator::new(&normal, &[]);
        let schema = Schema::new(vec![Field::with_name(DataType::Int64, "count(*)")]);
        let rows = driver.finalize(&schema);
        assert_eq!(rows, vec![vec![Datum::Int(0)]]);
    }

    #[test]
    fn test_plan_to_execution_avg() {
        // End to end: the planner's rewrite feeds the operator and the
        // sibling columns disappear from the final row.
        let tuples = parse_select_items(&projection("SELECT AVG(a) FROM t"), &["t"]).unwrap();
        let plan = AggregatePlan::build(&tuples, &[], true).unwrap();
        let mut driver = HashAggregator::new(plan.normal_aggrs(), plan.group_aggrs());

        let mut schema = Schema::new(vec![
            Field::with_name(DataType::Decimal, "AVG(a)"),
            Field::with_name(DataType::Decimal, "SUM(a)"),
            Field::with_name(DataType::Int64, "COUNT(a)"),
        ]);
        driver.fix_fields(&mut schema);

        for (sum, count) in [(10i64, 2i64), (20, 4), (0, 0), (30, 3)] {
            driver.push_row(vec![Datum::Null, Datum::Int(sum), Datum::Int(count)]);
        }
        let mut rows = driver.finalize(&schema);
        let mut fields = schema.fields.clone();
        remove_columns(&mut fields, &[1, 2]);

        assert_eq!(fields.len(), 1);
        assert_eq!(rows.len(), 1);
        let row = rows.pop().unwrap();
        assert_eq!(row.len(), 1);
        let expected = Decimal::from(60).checked_div(Decimal::from(9)).unwrap();
        assert_eq!(row[0], Datum::Decimal(expected));
    }

    #[test]
    fn test_distinct_grouping_dedupes_rows() {
        // SELECT DISTINCT over two columns: group keys only, no
        // accumulators.
        let tuples = parse_select_items(&projection("SELECT a, b FROM t"), &["t"]).unwrap();
        let groups = vec![
            GroupItem {
                index: 0,
                table: None,
                field: "a".into(),
            },
            GroupItem {
                index: 1,
                table: None,
                field: "b".into(),
            },
        ];
        let plan = AggregatePlan::build(&tuples, &groups, true).unwrap();
        let mut driver = HashAggregator::new(plan.normal_aggrs(), plan.group_aggrs());
        let schema = Schema::new(vec![
            Field::with_name(DataType::Int64, "a"),
            Field::with_name(DataType::Int64, "b"),
        ]);
        for (a, b) in [(1i64, 2i64), (1, 2), (1, 3), (1, 2)] {
            driver.push_row(vec![Datum::Int(a), Datum::Int(b)]);
        }
        let rows = driver.finalize(&schema);
        assert_eq!(
            rows,
            vec![
                vec![Datum::Int(1), Datum::Int(2)],
                vec![Datum::Int(1), Datum::Int(3)],
            ]
        );
    }
}
