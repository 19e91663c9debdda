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

//! Execution operators applied to gathered shard result streams.
//!
//! Only the aggregation family lives here: the per-aggregate state
//! machines of [`aggregate::Aggregation`] and the insertion-ordered hash
//! GROUP BY driver of [`group::HashAggregator`]. Operators are pure CPU
//! work driven row by row by the result gatherer; arithmetic faults latch
//! per aggregate instead of poisoning the stream.

pub mod aggregate;
pub mod group;

pub use aggregate::{AggEvaluateContext, Aggregation};
pub use group::{remove_columns, HashAggregator};
