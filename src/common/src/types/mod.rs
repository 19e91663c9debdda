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

mod datum;

pub use datum::Datum;

/// The wire-level type of a result column, MySQL flavored.
///
/// `Null` stands in for columns whose type is not yet known to the proxy
/// (the backends announce the authoritative type with the first result set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Null,
    Int64,
    UInt64,
    Float64,
    Decimal,
    VarChar,
    DateTime,
}

impl DataType {
    pub fn is_integer(&self) -> bool {
        matches!(self, DataType::Int64 | DataType::UInt64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float64)
    }

    pub fn is_decimal(&self) -> bool {
        matches!(self, DataType::Decimal)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, DataType::DateTime)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float() || self.is_decimal()
    }
}
