// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Scatter queries across shards and gather the results.
//!
//! [`ScatterConn`] runs one statement per shard concurrently on behalf of a
//! client [`SafeSession`]. Before any shard is contacted, the
//! [`admission`] rules decide whether the call may join the session's
//! transaction and what it has to do on the shard first. Shards are reached
//! through a [`ShardGateway`]; [`PoolGateway`] is the one backed by
//! [`shardgate_conn`] connection pools.

pub mod admission;
mod error;
mod gateway;
mod metrics;
mod observer;
mod pool_gateway;
mod scatter;
mod session;

#[cfg(test)]
mod sandbox;

pub use admission::{ReservedConnAdmission, Rejection, ShardAction, ShardActionInfo};
pub use error::ScatterError;
pub use gateway::{ResolvedShard, ShardGateway, ShardRequest, ShardState};
pub use metrics::ScatterMetrics;
pub use observer::{NullResultsObserver, ResultsObserver, ScatterStats};
pub use pool_gateway::{PoolGateway, PoolGatewayConfig};
pub use scatter::{ScatterConfig, ScatterConn};
pub use session::{SafeSession, Session, ShardSession, TransactionMode};
