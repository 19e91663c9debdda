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

//! The shardbridge planning pipeline.
//!
//! A parsed `SELECT` against the logical schema is turned into an execution
//! plan: one rewritten SQL fragment per target shard segment plus a tree of
//! proxy-side post-processing operators (aggregation, ordering, limiting,
//! join bookkeeping). The entry point is [`select::SelectPlan::build`].
//!
//! Planning is single-threaded per plan; independent plans may be built
//! concurrently as long as the shared [`router::Router`] is safe for
//! concurrent reads.

mod builder;
pub mod expr;
pub mod node;
pub mod plan;
pub mod router;
pub mod select;
pub mod table;

#[cfg(test)]
pub(crate) mod test_utils;

pub use select::{PlanType, SelectPlan};
