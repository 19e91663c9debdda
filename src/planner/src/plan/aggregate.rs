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

use sqlparser::ast::{Expr, SelectItem, Value};

use shardbridge_common::error::{Error, Result};

use crate::expr::{canonical, parse_query, SelectTuple};

/// The kind of an aggregate state machine. `GroupBy` entries are hash
/// grouping keys, not accumulators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrType {
    Avg,
    Count,
    Max,
    Min,
    Sum,
    GroupBy,
}

impl fmt::Display for AggrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggrType::Avg => "avg",
            AggrType::Count => "count",
            AggrType::Max => "max",
            AggrType::Min => "min",
            AggrType::Sum => "sum",
            AggrType::GroupBy => "group by",
        };
        write!(f, "{s}")
    }
}

/// One proxy-side aggregate over a column of the gathered stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregator {
    /// Display label, e.g. `avg(a)`.
    pub label: String,
    /// Source column index in the gathered row.
    pub index: usize,
    pub kind: AggrType,
    pub distinct: bool,
    /// Whether shards deliver partial aggregates (combine mode) or raw
    /// values (evaluate mode).
    pub push_down: bool,
}

/// A GROUP BY entry resolved against the projection.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupItem {
    /// Index of the matching select tuple.
    pub index: usize,
    pub table: Option<String>,
    pub field: String,
}

/// The aggregation split between shards and proxy.
///
/// `rewritten` is the select list to ship: in push-down mode aggregates are
/// shipped as-is with AVG expanded to `AVG, SUM, COUNT` siblings (the proxy
/// recombines the pair and drops the extra columns); otherwise aggregates
/// are stripped to their bare arguments and evaluated entirely in the
/// proxy.
#[derive(Debug, Clone)]
pub struct AggregatePlan {
    normal_aggrs: Vec<Aggregator>,
    group_aggrs: Vec<Aggregator>,
    rewritten: Vec<SelectItem>,
    is_push_down: bool,
}

impl AggregatePlan {
    pub fn build(
        tuples: &[SelectTuple],
        groups: &[GroupItem],
        is_push_down: bool,
    ) -> Result<AggregatePlan> {
        let mut normal_aggrs = Vec::new();
        let mut rewritten = Vec::new();
        // Output index of each input tuple after AVG sibling expansion.
        let mut out_index = Vec::with_capacity(tuples.len());

        for tuple in tuples {
            out_index.push(rewritten.len());
            let Some(call) = &tuple.agg else {
                rewritten.push(tuple.item.clone());
                continue;
            };
            let index = rewritten.len();
            if is_push_down {
                if call.distinct {
                    return Err(Error::Internal(format!(
                        "distinct aggregate [{}] in combine mode",
                        tuple.field
                    )));
                }
                normal_aggrs.push(Aggregator {
                    label: tuple.label.clone(),
                    index,
                    kind: call.kind,
                    distinct: false,
                    push_down: true,
                });
                rewritten.push(tuple.item.clone());
                if call.kind == AggrType::Avg {
                    let arg = call.arg.as_ref().ok_or_else(|| {
                        Error::UnsupportedAggregate(tuple.field.clone())
                    })?;
                    let (sum_item, count_item) = decompose_avg(arg)?;
                    for (offset, (kind, item)) in
                        [(AggrType::Sum, sum_item), (AggrType::Count, count_item)]
                            .into_iter()
                            .enumerate()
                    {
                        normal_aggrs.push(Aggregator {
                            label: item_label(&item),
                            index: index + offset + 1,
                            kind,
                            distinct: false,
                            push_down: true,
                        });
                        rewritten.push(item);
                    }
                }
            } else {
                normal_aggrs.push(Aggregator {
                    label: tuple.label.clone(),
                    index,
                    kind: call.kind,
                    distinct: call.distinct,
                    push_down: false,
                });
                // Ship the bare argument; COUNT(*) counts rows, so any
                // non-null literal column will do.
                rewritten.push(match &call.arg {
                    Some(arg) => SelectItem::UnnamedExpr(arg.clone()),
                    None => {
                        SelectItem::UnnamedExpr(Expr::Value(Value::Number("1".into(), false)))
                    }
                });
            }
        }

        let group_aggrs = groups
            .iter()
            .map(|g| Aggregator {
                label: g.field.clone(),
                index: out_index[g.index],
                kind: AggrType::GroupBy,
                distinct: false,
                push_down: is_push_down,
            })
            .collect();

        Ok(AggregatePlan {
            normal_aggrs,
            group_aggrs,
            rewritten,
            is_push_down,
        })
    }

    pub fn normal_aggrs(&self) -> &[Aggregator] {
        &self.normal_aggrs
    }

    pub fn group_aggrs(&self) -> &[Aggregator] {
        &self.group_aggrs
    }

    /// The select list to substitute into the shard-bound statement.
    pub fn rewritten(&self) -> &[SelectItem] {
        &self.rewritten
    }

    pub fn is_push_down(&self) -> bool {
        self.is_push_down
    }

    pub fn aggr_labels(&self) -> Vec<String> {
        self.normal_aggrs.iter().map(|a| a.label.clone()).collect()
    }

    pub fn group_labels(&self) -> Vec<String> {
        self.group_aggrs.iter().map(|a| a.label.clone()).collect()
    }
}

fn item_label(item: &SelectItem) -> String {
    match item {
        SelectItem::UnnamedExpr(e) => canonical(e),
        other => other.to_string(),
    }
}

/// Builds the `SUM(arg), COUNT(arg)` sibling pair shipped alongside a
/// push-down AVG.
fn decompose_avg(arg: &Expr) -> Result<(SelectItem, SelectItem)> {
    let query = parse_query(&format!("SELECT SUM({arg}), COUNT({arg})"))?;
    let sqlparser::ast::SetExpr::Select(select) = *query.body else {
        return Err(Error::Internal("avg decomposition is not a select".into()));
    };
    let mut items = select.projection.into_iter();
    match (items.next(), items.next()) {
        (Some(sum), Some(count)) => Ok((sum, count)),
        _ => Err(Error::Internal("avg decomposition arity".into())),
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;
    use crate::expr::parse_select_items;
    use crate::test_utils::parse_projection;

    fn tuples(projection: &str, scope: &[&str]) -> Vec<SelectTuple> {
        parse_select_items(&parse_projection(projection), scope).unwrap()
    }

    #[test]
    fn test_push_down_avg_expands_siblings() {
        let tuples = tuples("b, AVG(a), COUNT(*)", &["t"]);
        let groups = vec![GroupItem {
            index: 0,
            table: None,
            field: "b".into(),
        }];
        let plan = AggregatePlan::build(&tuples, &groups, true).unwrap();

        let shipped = plan.rewritten().iter().map(|i| i.to_string()).join(", ");
        assert_eq!(shipped, "b, AVG(a), SUM(a), COUNT(a), COUNT(*)");

        let kinds = plan
            .normal_aggrs()
            .iter()
            .map(|a| (a.kind, a.index))
            .collect_vec();
        assert_eq!(
            kinds,
            vec![
                (AggrType::Avg, 1),
                (AggrType::Sum, 2),
                (AggrType::Count, 3),
                (AggrType::Count, 4),
            ]
        );
        assert_eq!(plan.group_aggrs()[0].index, 0);
        assert_eq!(plan.group_aggrs()[0].kind, AggrType::GroupBy);
    }

    #[test]
    fn test_evaluate_mode_ships_bare_arguments() {
        let tuples = tuples("COUNT(DISTINCT a), SUM(b), COUNT(*)", &["t"]);
        let plan = AggregatePlan::build(&tuples, &[], false).unwrap();

        let shipped = plan.rewritten().iter().map(|i| i.to_string()).join(", ");
        assert_eq!(shipped, "a, b, 1");

        assert!(plan.normal_aggrs()[0].distinct);
        assert!(!plan.normal_aggrs()[0].push_down);
        assert_eq!(plan.normal_aggrs()[1].kind, AggrType::Sum);
    }

    #[test]
    fn test_group_index_tracks_avg_expansion() {
        let tuples = tuples("AVG(a), b", &["t"]);
        let groups = vec![GroupItem {
            index: 1,
            table: None,
            field: "b".into(),
        }];
        let plan = AggregatePlan::build(&tuples, &groups, true).unwrap();
        // AVG occupies three shipped columns, so `b` lands at index 3.
        assert_eq!(plan.group_aggrs()[0].index, 3);
    }
}
