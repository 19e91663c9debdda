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

use std::ops::Index;

use crate::types::DataType;

/// Digits needed to print a 64-bit integer, per the MySQL field protocol.
pub const DECIMAL_LONGLONG_DIGITS: u32 = 22;
/// Largest scale a DECIMAL column may announce.
pub const MAX_DECIMAL_SCALE: u8 = 30;
/// Sentinel scale for floating columns with no fixed number of decimals.
pub const NOT_FIXED_DEC: u8 = 31;
/// Decimal digits representable by an IEEE double.
pub const DBL_DIG: u32 = 15;

/// One column of a result set as announced to the client: the wire type
/// plus the display metadata MySQL clients expect.
#[derive(Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub column_length: u32,
    pub decimals: u8,
    pub unsigned: bool,
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:?}", self.name, self.data_type)
    }
}

impl Field {
    pub fn with_name<S>(data_type: DataType, name: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            name: name.into(),
            column_length: default_length(&data_type),
            decimals: 0,
            unsigned: false,
            data_type,
        }
    }

    pub fn unnamed(data_type: DataType) -> Self {
        Self::with_name(data_type, String::new())
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }
}

fn default_length(data_type: &DataType) -> u32 {
    match data_type {
        DataType::Null => 0,
        DataType::Int64 | DataType::UInt64 => 21,
        DataType::Float64 => DBL_DIG + 8,
        DataType::Decimal => DECIMAL_LONGLONG_DIGITS,
        DataType::VarChar => 255,
        DataType::DateTime => 19,
    }
}

/// The schema of a gathered result stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn data_types(&self) -> Vec<DataType> {
        self.fields.iter().map(|field| field.data_type).collect()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
}

impl Index<usize> for Schema {
    type Output = Field;

    fn index(&self, index: usize) -> &Self::Output {
        &self.fields[index]
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_field_defaults() {
        let f = Field::with_name(DataType::Int64, "id");
        assert_eq!(f.column_length, 21);
        assert_eq!(f.decimals, 0);
        assert!(!f.unsigned);

        let s = Schema::new(vec![f, Field::unnamed(DataType::Float64)]);
        assert_eq!(s.len(), 2);
        assert_eq!(s.data_types(), vec![DataType::Int64, DataType::Float64]);
        assert_eq!(s[1].column_length, DBL_DIG + 8);
    }
}
