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

//! The routing seam between the planner and the shard topology.
//!
//! The planner never talks to backends; it asks an injected [`Router`]
//! which physical segments hold which rows. The metadata types derive
//! serde so a deployment's routing map can be loaded from declarative
//! config by the layer that owns it.

use serde::{Deserialize, Serialize};
use shardbridge_common::error::Result;
use shardbridge_common::types::Datum;

/// How a logical table is laid out across backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardType {
    /// Replicated identically on every backend; any one replica serves reads.
    Global,
    /// Unpartitioned, lives on exactly one backend.
    Single,
    /// Hash partitioned by the shard key.
    Hash,
}

/// One physical partition of a logical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Physical table name on the backend, e.g. `t_0002`.
    pub table: String,
    /// Backend id the segment lives on.
    pub backend: String,
    /// Human-readable key range, for explain output.
    pub range: String,
}

/// Shard metadata for one logical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTable {
    pub database: String,
    pub name: String,
    pub shard_type: ShardType,
    /// Column whose values place a row; empty for GLOBAL and SINGLE tables.
    #[serde(default)]
    pub shard_key: String,
}

/// Answers "which backends hold which rows?" for the planner.
///
/// Lookups are blocking and must be safe for concurrent reads; the planner
/// holds no locks while calling in. `lookup` returns shard *indexes* rather
/// than segments so route computation can intersect the surviving index
/// sets of co-partitioned tables; `segments` materializes indexes into
/// physical segments.
pub trait Router: Send + Sync {
    /// Shard metadata for a logical table, or `TableUnknown`.
    fn table(&self, database: &str, table: &str) -> Result<ShardTable>;

    /// Shard indexes whose key range covers the given shard-key value.
    fn lookup(
        &self,
        database: &str,
        table: &str,
        shard_key: &str,
        value: &Datum,
    ) -> Result<Vec<usize>>;

    /// Segments at the given shard indexes, in index order. An empty index
    /// list means all segments.
    fn segments(&self, database: &str, table: &str, indexes: &[usize]) -> Result<Vec<Segment>>;
}
