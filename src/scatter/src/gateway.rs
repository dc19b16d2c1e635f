// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The boundary between the scatter coordinator and the shards it talks to.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use shardgate_conn::{ChunkCallback, QueryContext, Setting};
use shardgate_types::{BoundQuery, QueryResult, ShardTarget, SqlError};

use crate::admission::ShardAction;

/// One statement for one shard, with what has to happen to the shard's
/// session first.
#[derive(Clone, Debug)]
pub struct ShardRequest {
    pub target: ShardTarget,
    pub query: BoundQuery,
    pub action: ShardAction,
    pub transaction_id: i64,
    pub reserved_id: i64,
    /// Applied to a connection when it becomes reserved.
    pub setting: Option<Setting>,
}

/// The ids a shard session holds after a call. Zero means none.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShardState {
    pub transaction_id: i64,
    pub reserved_id: i64,
}

/// Executes statements on shards.
///
/// Calls report the shard's session state even when they fail, so that a
/// transaction that was opened before the failure is not leaked.
#[async_trait]
pub trait ShardGateway: Debug + Send + Sync {
    async fn execute(
        &self,
        ctx: &QueryContext,
        request: &ShardRequest,
    ) -> (Result<QueryResult, SqlError>, ShardState);

    async fn stream_execute(
        &self,
        ctx: &QueryContext,
        request: &ShardRequest,
        callback: &mut ChunkCallback<'_>,
    ) -> (Result<(), SqlError>, ShardState);

    /// Ends the transaction. A reserved connection that carried it stays
    /// reserved.
    async fn commit(
        &self,
        ctx: &QueryContext,
        target: &ShardTarget,
        transaction_id: i64,
    ) -> Result<(), SqlError>;

    async fn rollback(
        &self,
        ctx: &QueryContext,
        target: &ShardTarget,
        transaction_id: i64,
    ) -> Result<(), SqlError>;

    /// Ends any transaction and gives back the reserved connection.
    async fn release(
        &self,
        ctx: &QueryContext,
        target: &ShardTarget,
        transaction_id: i64,
        reserved_id: i64,
    ) -> Result<(), SqlError>;
}

/// A shard target and the gateway that serves it.
#[derive(Clone, Debug)]
pub struct ResolvedShard {
    pub target: ShardTarget,
    pub gateway: Arc<dyn ShardGateway>,
}

impl ResolvedShard {
    pub fn new(target: ShardTarget, gateway: Arc<dyn ShardGateway>) -> ResolvedShard {
        ResolvedShard { target, gateway }
    }
}
