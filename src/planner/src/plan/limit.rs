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

/// The original `(offset, count)` the proxy applies after gathering.
///
/// Shards receive the widened window `LIMIT offset + count` (offset
/// dropped), since any of the first `offset + count` rows of a shard may
/// survive the global merge. The rewrite is only shipped when no GROUP BY
/// changes cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPlan {
    offset: u64,
    count: u64,
}

impl LimitPlan {
    pub fn new(offset: u64, count: u64) -> Self {
        Self { offset, count }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// The `(0, offset + count)` window shipped to shards.
    pub fn rewritten(&self) -> (u64, u64) {
        (0, self.offset + self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewritten_window() {
        assert_eq!(LimitPlan::new(5, 10).rewritten(), (0, 15));
        assert_eq!(LimitPlan::new(0, 3).rewritten(), (0, 3));
    }
}
