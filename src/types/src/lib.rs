// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Types shared by the shard connection layer and the scatter coordinator.
//!
//! Nothing in here performs I/O. The crate describes where a query goes
//! ([`ShardTarget`]), what is sent ([`BoundQuery`]), what comes back
//! ([`QueryResult`]) and how failures are classified and folded together
//! ([`SqlError`], [`ErrorCode`], [`aggregate`]).

mod error;
mod result;
mod target;
mod value;

pub use error::{ErrorCode, HasErrorCode, SqlError, aggregate, errno};
pub use result::{Field, QueryResult, Row};
pub use target::{ShardTarget, TabletType};
pub use value::{BindVariables, BoundQuery, Value, ValueType};
