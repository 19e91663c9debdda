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

//! Post-processing operators applied to the gathered result stream, built
//! by the planner and attached as children of plan nodes.

pub mod aggregate;
pub mod filter;
pub mod limit;
pub mod order;

pub use aggregate::{AggregatePlan, Aggregator, AggrType, GroupItem};
pub use filter::FilterPlan;
pub use limit::LimitPlan;
pub use order::{OrderByPlan, OrderField, OrderType};

/// A proxy-side operator refining the gathered rows.
#[derive(Debug, Clone)]
pub enum ChildPlan {
    Aggregate(AggregatePlan),
    Filter(FilterPlan),
    Limit(LimitPlan),
    OrderBy(OrderByPlan),
}

impl ChildPlan {
    pub fn as_aggregate(&self) -> Option<&AggregatePlan> {
        match self {
            ChildPlan::Aggregate(plan) => Some(plan),
            _ => None,
        }
    }

    pub fn as_limit(&self) -> Option<&LimitPlan> {
        match self {
            ChildPlan::Limit(plan) => Some(plan),
            _ => None,
        }
    }

    pub fn as_order_by(&self) -> Option<&OrderByPlan> {
        match self {
            ChildPlan::OrderBy(plan) => Some(plan),
            _ => None,
        }
    }
}
