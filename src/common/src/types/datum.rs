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
use std::fmt;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::DataType;
use crate::error::{Error, Result};

/// A single SQL value as seen by the proxy.
///
/// Backends speak the MySQL text protocol; by the time rows reach the
/// aggregation operators they have been decoded into this enum.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Datum {
    #[default]
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Decimal(Decimal),
    Str(String),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Datum::Null => DataType::Null,
            Datum::Int(_) => DataType::Int64,
            Datum::UInt(_) => DataType::UInt64,
            Datum::Float(_) => DataType::Float64,
            Datum::Decimal(_) => DataType::Decimal,
            Datum::Str(_) => DataType::VarChar,
        }
    }

    /// A zero of the given type, used when an aggregate latched an
    /// arithmetic fault and must still produce a well-typed result.
    pub fn zero(data_type: &DataType) -> Datum {
        match data_type {
            DataType::Null => Datum::Null,
            DataType::Int64 => Datum::Int(0),
            DataType::UInt64 => Datum::UInt(0),
            DataType::Float64 => Datum::Float(0.0),
            DataType::Decimal => Datum::Decimal(Decimal::ZERO),
            DataType::VarChar | DataType::DateTime => Datum::Str(String::new()),
        }
    }

    pub fn to_decimal(&self) -> Option<Decimal> {
        match self {
            Datum::Int(v) => Some(Decimal::from(*v)),
            Datum::UInt(v) => Some(Decimal::from(*v)),
            Datum::Float(v) => Decimal::from_f64_retain(*v),
            Datum::Decimal(v) => Some(*v),
            Datum::Str(s) => s.trim().parse::<Decimal>().ok(),
            Datum::Null => None,
        }
    }

    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Datum::Int(v) => Some(*v as f64),
            Datum::UInt(v) => Some(*v as f64),
            Datum::Float(v) => Some(*v),
            Datum::Decimal(v) => v.to_f64(),
            Datum::Str(s) => s.trim().parse::<f64>().ok(),
            Datum::Null => None,
        }
    }

    /// Null-safe addition with numeric promotion.
    ///
    /// NULL acts as the identity. Mixed signedness and anything touching a
    /// decimal promotes to `Decimal`; floats stay floats. Overflow is an
    /// error so callers can latch it instead of wrapping silently.
    pub fn checked_add(&self, rhs: &Datum) -> Result<Datum> {
        match (self, rhs) {
            (Datum::Null, _) => Ok(rhs.clone()),
            (_, Datum::Null) => Ok(self.clone()),
            (Datum::Int(a), Datum::Int(b)) => a
                .checked_add(*b)
                .map(Datum::Int)
                .ok_or_else(|| Error::Overflow("bigint add".into())),
            (Datum::UInt(a), Datum::UInt(b)) => a
                .checked_add(*b)
                .map(Datum::UInt)
                .ok_or_else(|| Error::Overflow("bigint unsigned add".into())),
            (Datum::Float(_), _) | (_, Datum::Float(_)) => {
                let (a, b) = (self.numeric_f64()?, rhs.numeric_f64()?);
                Ok(Datum::Float(a + b))
            }
            _ => {
                let (a, b) = (self.numeric_decimal()?, rhs.numeric_decimal()?);
                a.checked_add(b)
                    .map(Datum::Decimal)
                    .ok_or_else(|| Error::Overflow("decimal add".into()))
            }
        }
    }

    /// Null-safe three-way comparison. NULL sorts before everything.
    pub fn compare(&self, rhs: &Datum) -> Result<Ordering> {
        match (self, rhs) {
            (Datum::Null, Datum::Null) => Ok(Ordering::Equal),
            (Datum::Null, _) => Ok(Ordering::Less),
            (_, Datum::Null) => Ok(Ordering::Greater),
            (Datum::Str(a), Datum::Str(b)) => Ok(a.as_bytes().cmp(b.as_bytes())),
            (Datum::Float(_), _) | (_, Datum::Float(_)) => {
                let (a, b) = (self.numeric_f64()?, rhs.numeric_f64()?);
                a.partial_cmp(&b)
                    .ok_or_else(|| Error::TypeMismatch("incomparable float values".into()))
            }
            _ => {
                let (a, b) = (self.numeric_decimal()?, rhs.numeric_decimal()?);
                Ok(a.cmp(&b))
            }
        }
    }

    /// Null-safe division used to finish an AVG: NULL or zero divisor
    /// yields NULL, matching MySQL division semantics.
    pub fn divide(&self, divisor: &Datum, as_float: bool) -> Result<Datum> {
        if self.is_null() || divisor.is_null() {
            return Ok(Datum::Null);
        }
        if as_float {
            let d = divisor.numeric_f64()?;
            if d == 0.0 {
                return Ok(Datum::Null);
            }
            return Ok(Datum::Float(self.numeric_f64()? / d));
        }
        let d = divisor.numeric_decimal()?;
        if d.is_zero() {
            return Ok(Datum::Null);
        }
        self.numeric_decimal()?
            .checked_div(d)
            .map(Datum::Decimal)
            .ok_or_else(|| Error::Overflow("decimal divide".into()))
    }

    /// Cast to the announced field type, used when an accumulator's runtime
    /// kind differs from the promoted result type.
    pub fn cast(&self, to: &DataType) -> Result<Datum> {
        if self.is_null() {
            return Ok(Datum::Null);
        }
        match to {
            DataType::Null => Ok(self.clone()),
            DataType::Decimal => self.numeric_decimal().map(Datum::Decimal),
            DataType::Float64 => self.numeric_f64().map(Datum::Float),
            DataType::Int64 => match self {
                Datum::Int(v) => Ok(Datum::Int(*v)),
                Datum::UInt(v) => i64::try_from(*v)
                    .map(Datum::Int)
                    .map_err(|_| Error::Overflow("bigint cast".into())),
                other => other
                    .to_decimal()
                    .and_then(|d| d.to_i64())
                    .map(Datum::Int)
                    .ok_or_else(|| Error::TypeMismatch(format!("cannot cast {other} to bigint"))),
            },
            DataType::UInt64 => match self {
                Datum::UInt(v) => Ok(Datum::UInt(*v)),
                Datum::Int(v) => u64::try_from(*v)
                    .map(Datum::UInt)
                    .map_err(|_| Error::Overflow("bigint unsigned cast".into())),
                other => other
                    .to_decimal()
                    .and_then(|d| d.to_u64())
                    .map(Datum::UInt)
                    .ok_or_else(|| {
                        Error::TypeMismatch(format!("cannot cast {other} to bigint unsigned"))
                    }),
            },
            DataType::VarChar | DataType::DateTime => Ok(Datum::Str(self.to_string())),
        }
    }

    /// Appends a self-delimiting byte form, used as hash-map key material
    /// for DISTINCT buffers and GROUP BY buckets.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Datum::Null => buf.push(0),
            Datum::Int(v) => {
                buf.push(1);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Datum::UInt(v) => {
                buf.push(2);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Datum::Float(v) => {
                buf.push(3);
                buf.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Datum::Decimal(v) => {
                buf.push(4);
                let s = v.normalize().to_string();
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Datum::Str(s) => {
                buf.push(5);
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }

    fn numeric_decimal(&self) -> Result<Decimal> {
        self.to_decimal()
            .ok_or_else(|| Error::TypeMismatch(format!("{self} is not numeric")))
    }

    fn numeric_f64(&self) -> Result<f64> {
        self.to_f64()
            .ok_or_else(|| Error::TypeMismatch(format!("{self} is not numeric")))
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Int(v) => write!(f, "{v}"),
            Datum::UInt(v) => write!(f, "{v}"),
            Datum::Float(v) => write!(f, "{v}"),
            Datum::Decimal(v) => write!(f, "{v}"),
            Datum::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<u64> for Datum {
    fn from(v: u64) -> Self {
        Datum::UInt(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float(v)
    }
}

impl From<Decimal> for Datum {
    fn from(v: Decimal) -> Self {
        Datum::Decimal(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Str(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_null_safe_add() {
        let a = Datum::Int(3);
        assert_eq!(a.checked_add(&Datum::Null).unwrap(), Datum::Int(3));
        assert_eq!(Datum::Null.checked_add(&a).unwrap(), Datum::Int(3));
        assert_eq!(a.checked_add(&Datum::Int(4)).unwrap(), Datum::Int(7));
        assert_eq!(
            Datum::Float(1.5).checked_add(&Datum::Int(2)).unwrap(),
            Datum::Float(3.5)
        );
        // Mixed signedness promotes to decimal instead of wrapping.
        assert_eq!(
            Datum::Int(-1).checked_add(&Datum::UInt(u64::MAX)).unwrap(),
            Datum::Decimal(Decimal::from(u64::MAX) - Decimal::from(1)),
        );
    }

    #[test]
    fn test_add_overflow_is_an_error() {
        assert_matches!(
            Datum::Int(i64::MAX).checked_add(&Datum::Int(1)),
            Err(Error::Overflow(_))
        );
        assert_matches!(
            Datum::Str("abc".into()).checked_add(&Datum::Int(1)),
            Err(Error::TypeMismatch(_))
        );
    }

    #[test]
    fn test_compare() {
        assert_eq!(
            Datum::Int(1).compare(&Datum::Decimal(Decimal::from(2))).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            Datum::Null.compare(&Datum::Int(i64::MIN)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            Datum::Str("b".into()).compare(&Datum::Str("a".into())).unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            Datum::Float(2.0).compare(&Datum::Int(2)).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_divide() {
        assert_eq!(
            Datum::Int(60).divide(&Datum::Int(9), false).unwrap(),
            Datum::Decimal(Decimal::from(60).checked_div(Decimal::from(9)).unwrap()),
        );
        assert_eq!(Datum::Int(1).divide(&Datum::Int(0), false).unwrap(), Datum::Null);
        assert_eq!(Datum::Null.divide(&Datum::Int(3), false).unwrap(), Datum::Null);
        assert_eq!(
            Datum::Float(3.0).divide(&Datum::Int(2), true).unwrap(),
            Datum::Float(1.5)
        );
    }

    #[test]
    fn test_encode_distinguishes_values() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        Datum::Int(1).encode_into(&mut a);
        Datum::UInt(1).encode_into(&mut b);
        assert_ne!(a, b);

        let mut c = Vec::new();
        let mut d = Vec::new();
        Datum::Decimal("1.00".parse().unwrap()).encode_into(&mut c);
        Datum::Decimal("1".parse().unwrap()).encode_into(&mut d);
        assert_eq!(c, d);
    }
}
