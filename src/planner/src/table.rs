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

use crate::router::{Segment, ShardType};

/// Per-referenced-table metadata, one per table occurrence in FROM.
///
/// Its position in the owning node's table list equals the position of its
/// table factor in the node's FROM walk (left to right, nested groups
/// in-order), which is how query emission finds the factor to rename.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub database: String,
    pub name: String,
    pub alias: Option<String>,
    pub shard_type: ShardType,
    /// Empty for GLOBAL and SINGLE tables.
    pub shard_key: String,
    /// Resolved by `calc_route`; read-only afterwards.
    pub segments: Vec<Segment>,
    /// Shard indexes surviving filter narrowing. `None` = unconstrained.
    pub index: Option<Vec<usize>>,
}

impl TableInfo {
    /// The identifier column qualifiers resolve against.
    pub fn ident(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn is_global(&self) -> bool {
        self.shard_type == ShardType::Global
    }

    pub fn matches_qualifier(&self, qualifier: &str) -> bool {
        self.ident().eq_ignore_ascii_case(qualifier)
    }

    /// Intersects the surviving index set with `indexes` (a union of
    /// per-value lookups from one filter). AND-composed filters narrow
    /// monotonically; an empty survivor set is legal here and fails later
    /// in route computation.
    pub fn narrow(&mut self, mut indexes: Vec<usize>) {
        indexes.sort_unstable();
        indexes.dedup();
        self.index = Some(match self.index.take() {
            None => indexes,
            Some(prev) => prev.into_iter().filter(|i| indexes.contains(i)).collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_table() -> TableInfo {
        TableInfo {
            database: "db".into(),
            name: "t".into(),
            alias: None,
            shard_type: ShardType::Hash,
            shard_key: "id".into(),
            segments: vec![],
            index: None,
        }
    }

    #[test]
    fn test_narrow_intersects() {
        let mut tb = hash_table();
        tb.narrow(vec![2, 0, 2]);
        assert_eq!(tb.index, Some(vec![0, 2]));
        tb.narrow(vec![2, 3]);
        assert_eq!(tb.index, Some(vec![2]));
        tb.narrow(vec![1]);
        assert_eq!(tb.index, Some(vec![]));
    }

    #[test]
    fn test_ident_prefers_alias() {
        let mut tb = hash_table();
        assert_eq!(tb.ident(), "t");
        tb.alias = Some("t1".into());
        assert_eq!(tb.ident(), "t1");
        assert!(tb.matches_qualifier("T1"));
        assert!(!tb.matches_qualifier("t"));
    }
}
