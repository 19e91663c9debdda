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

use std::cmp::Ordering;
use std::collections::HashSet;

use tracing::warn;

use shardbridge_common::catalog::{
    Field, Schema, DBL_DIG, DECIMAL_LONGLONG_DIGITS, MAX_DECIMAL_SCALE, NOT_FIXED_DEC,
};
use shardbridge_common::error::Error;
use shardbridge_common::types::{DataType, Datum};
use shardbridge_planner::plan::{AggrType, Aggregator};

/// Per-aggregate accumulator state for one group.
#[derive(Debug, Default)]
pub struct AggEvaluateContext {
    pub count: i64,
    pub val: Datum,
    /// Arithmetic or type fault latch; a tripped aggregate reports a typed
    /// zero instead of aborting the stream.
    pub has_err: bool,
    buffer: HashSet<Vec<u8>>,
}

/// The aggregation operator over a gathered result stream.
///
/// In combine mode (`push_down`) the incoming rows already carry partial
/// aggregates from the shards and the operator merges them; otherwise the
/// rows carry raw values and the operator evaluates from scratch.
#[derive(Debug)]
pub struct Aggregation {
    aggrs: Vec<Aggregator>,
}

impl Aggregation {
    pub fn new(aggrs: Vec<Aggregator>) -> Aggregation {
        Aggregation { aggrs }
    }

    pub fn aggregators(&self) -> &[Aggregator] {
        &self.aggrs
    }

    /// Rewrites field metadata to the promoted result types, applied once
    /// before execution so clients see the correct wire types.
    pub fn fix_fields(&self, schema: &mut Schema) {
        for aggr in &self.aggrs {
            if aggr.kind == AggrType::GroupBy {
                continue;
            }
            if let Some(field) = schema.fields.get_mut(aggr.index) {
                fix_field(aggr.kind, field);
            }
        }
    }

    /// Seeds one context per aggregate from the group's first row.
    pub fn init_eval_contexts(&self, row: &[Datum]) -> Vec<AggEvaluateContext> {
        self.aggrs
            .iter()
            .map(|aggr| {
                let mut ctx = AggEvaluateContext::default();
                let Some(value) = row.get(aggr.index) else {
                    ctx.has_err = true;
                    return ctx;
                };
                ctx.val = value.clone();
                if !value.is_null() {
                    if !aggr.push_down {
                        ctx.count = 1;
                    }
                    if aggr.distinct {
                        let mut key = Vec::new();
                        value.encode_into(&mut key);
                        ctx.buffer.insert(key);
                    }
                }
                ctx
            })
            .collect()
    }

    /// Folds one more row into the contexts. NULLs and distinct duplicates
    /// are skipped; faults latch per aggregate.
    pub fn update(&self, row: &[Datum], ctxs: &mut [AggEvaluateContext]) {
        for (aggr, ctx) in self.aggrs.iter().zip(ctxs.iter_mut()) {
            if aggr.kind == AggrType::GroupBy {
                continue;
            }
            let Some(value) = row.get(aggr.index) else {
                latch(ctx, aggr, Error::Internal("row narrower than plan".into()));
                continue;
            };
            if value.is_null() {
                continue;
            }
            if aggr.distinct {
                let mut key = Vec::new();
                value.encode_into(&mut key);
                if !ctx.buffer.insert(key) {
                    continue;
                }
            }
            match aggr.kind {
                AggrType::Min => merge_extreme(ctx, aggr, value, Ordering::Greater),
                AggrType::Max => merge_extreme(ctx, aggr, value, Ordering::Less),
                AggrType::Sum => {
                    ctx.count += 1;
                    accumulate(ctx, aggr, value);
                }
                AggrType::Count => {
                    if aggr.push_down {
                        accumulate(ctx, aggr, value);
                    } else {
                        ctx.count += 1;
                    }
                }
                AggrType::Avg => {
                    // A combined AVG is recomputed from its SUM/COUNT
                    // siblings; only the evaluate mode accumulates here.
                    if !aggr.push_down {
                        ctx.count += 1;
                        accumulate(ctx, aggr, value);
                    }
                }
                AggrType::GroupBy => unreachable!("group keys are skipped above"),
            }
        }
    }

    /// The final value of one aggregate.
    pub fn get_result(
        &self,
        aggr: &Aggregator,
        ctx: &AggEvaluateContext,
        field: &Field,
    ) -> Datum {
        if ctx.has_err {
            return Datum::zero(&field.data_type);
        }
        let result = match aggr.kind {
            AggrType::Min | AggrType::Max | AggrType::GroupBy => Ok(ctx.val.clone()),
            AggrType::Count => {
                if !aggr.push_down {
                    Ok(Datum::Int(ctx.count))
                } else if ctx.val.is_null() {
                    // COUNT is never NULL, even over an empty stream.
                    Ok(Datum::Int(0))
                } else {
                    ctx.val.cast(&DataType::Int64)
                }
            }
            AggrType::Sum => ctx.val.cast(&field.data_type),
            AggrType::Avg => ctx
                .val
                .divide(&Datum::Int(ctx.count), field.data_type.is_float()),
        };
        result.unwrap_or_else(|err| {
            warn!(aggregate = %aggr.label, %err, "aggregate result fault, reporting zero");
            Datum::zero(&field.data_type)
        })
    }

    /// Writes every final value into `row`. A combined AVG consumes its
    /// SUM and COUNT siblings and reports their column indexes for
    /// deletion; the caller strips those columns from the output row and
    /// the announced schema.
    pub fn get_results(
        &self,
        ctxs: &[AggEvaluateContext],
        schema: &Schema,
        row: &mut Vec<Datum>,
    ) -> Vec<usize> {
        let mut deleted = Vec::new();
        let mut i = 0;
        while i < self.aggrs.len() {
            let aggr = &self.aggrs[i];
            if aggr.kind == AggrType::GroupBy {
                i += 1;
                continue;
            }
            let Some(field) = schema.fields.get(aggr.index) else {
                i += 1;
                continue;
            };
            if aggr.kind == AggrType::Avg && aggr.push_down {
                let value = if i + 2 < ctxs.len()
                    && !ctxs[i + 1].has_err
                    && !ctxs[i + 2].has_err
                {
                    ctxs[i + 1]
                        .val
                        .divide(&ctxs[i + 2].val, field.data_type.is_float())
                        .unwrap_or_else(|err| {
                            warn!(aggregate = %aggr.label, %err, "avg combine fault");
                            Datum::zero(&field.data_type)
                        })
                } else {
                    Datum::zero(&field.data_type)
                };
                if let Some(slot) = row.get_mut(aggr.index) {
                    *slot = value;
                }
                deleted.push(aggr.index + 1);
                deleted.push(aggr.index + 2);
                i += 3;
            } else {
                if let Some(slot) = row.get_mut(aggr.index) {
                    *slot = self.get_result(aggr, &ctxs[i], field);
                }
                i += 1;
            }
        }
        deleted
    }
}

fn merge_extreme(
    ctx: &mut AggEvaluateContext,
    aggr: &Aggregator,
    value: &Datum,
    replace_when: Ordering,
) {
    if ctx.val.is_null() {
        ctx.val = value.clone();
        return;
    }
    match ctx.val.compare(value) {
        Ok(ord) if ord == replace_when => ctx.val = value.clone(),
        Ok(_) => {}
        Err(err) => latch(ctx, aggr, err),
    }
}

fn accumulate(ctx: &mut AggEvaluateContext, aggr: &Aggregator, value: &Datum) {
    match ctx.val.checked_add(value) {
        Ok(sum) => ctx.val = sum,
        Err(err) => latch(ctx, aggr, err),
    }
}

fn latch(ctx: &mut AggEvaluateContext, aggr: &Aggregator, err: Error) {
    if !ctx.has_err {
        warn!(aggregate = %aggr.label, %err, "aggregate update fault latched");
    }
    ctx.has_err = true;
}

/// MySQL result-type promotion for aggregate columns.
fn fix_field(kind: AggrType, field: &mut Field) {
    let source = field.data_type;
    let source_decimals = field.decimals;
    match kind {
        AggrType::Count => {
            field.data_type = DataType::Int64;
            field.column_length = 21;
            field.decimals = 0;
            field.unsigned = false;
        }
        AggrType::Avg => {
            if source.is_integer() || source.is_decimal() || source.is_temporal() {
                field.data_type = DataType::Decimal;
                field.decimals = (source_decimals + 4).min(MAX_DECIMAL_SCALE);
            } else {
                field.data_type = DataType::Float64;
                field.decimals = (source_decimals + 4).min(NOT_FIXED_DEC);
            }
            field.column_length += 4;
            if field.unsigned {
                field.column_length += 1;
            }
            if source_decimals == 0 {
                field.column_length += 1;
            }
            field.unsigned = false;
        }
        AggrType::Sum => {
            if source.is_integer() || source.is_decimal() || source.is_temporal() {
                field.data_type = DataType::Decimal;
                field.column_length += DECIMAL_LONGLONG_DIGITS;
                if field.unsigned {
                    field.column_length += 1;
                }
            } else {
                field.data_type = DataType::Float64;
                field.column_length = if field.decimals < NOT_FIXED_DEC {
                    DBL_DIG + 2 + field.decimals as u32
                } else {
                    DBL_DIG + 8
                };
            }
            field.unsigned = false;
        }
        AggrType::Min | AggrType::Max | AggrType::GroupBy => {}
    }
}
