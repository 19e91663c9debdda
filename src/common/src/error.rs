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

use thiserror::Error;

/// Errors surfaced at the planning and execution boundary.
///
/// Planning errors are fatal for the plan being built and are propagated
/// verbatim to the caller; they are never retried here. Arithmetic faults
/// raised by datum operations are latched per-aggregate by the execution
/// operator instead of aborting the result stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unsupported: subqueries in select statement")]
    UnsupportedSubquery,

    #[error("unsupported: group by [{0}]")]
    UnsupportedGroupBy(String),

    #[error("unsupported: distinct [{0}]")]
    UnsupportedDistinct(String),

    #[error("unsupported: aggregate [{0}]")]
    UnsupportedAggregate(String),

    #[error("route unresolvable: {0}")]
    RouteUnresolvable(String),

    #[error("table [{0}] does not exist")]
    TableUnknown(String),

    #[error("unknown column [{0}]")]
    ColumnUnknown(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("numeric overflow in {0}")]
    Overflow(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
