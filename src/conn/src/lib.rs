// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Connections to the database behind one shard.
//!
//! [`DbConn`] runs statements on a single session and kills them when the
//! caller gives up. [`ConnPool`] bounds and reuses those sessions.

mod backend;
mod context;
mod dbconn;
mod metrics;
mod pool;

#[cfg(any(test, feature = "fakedb"))]
pub mod fakedb;
#[cfg(test)]
mod test_util;

pub use backend::{ChunkCallback, Connector, IncludedFields, RawConnection};
pub use context::{ContextError, QueryContext};
pub use dbconn::{ConnParams, DbConn, Setting};
pub use metrics::{ConnMetrics, PoolMetrics};
pub use pool::{ConnPool, PoolConfig, PooledConn};
