// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A [`ShardGateway`] backed by a connection pool to the shard's database.
//!
//! Statements outside transactions and reserved connections borrow a pooled
//! connection for just that statement. A transaction or reserved connection
//! pins one connection under an id until it ends.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardgate_conn::{ChunkCallback, ConnPool, IncludedFields, PooledConn, QueryContext};
use shardgate_types::{ErrorCode, QueryResult, ShardTarget, SqlError};
use tracing::{debug, warn};

use crate::admission::ShardAction;
use crate::gateway::{ShardGateway, ShardRequest, ShardState};

const CONTROL_MAX_ROWS: usize = 1;

/// Configures a [`PoolGateway`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolGatewayConfig {
    /// The most rows a buffered statement may return.
    pub max_result_rows: usize,
    /// The most rows in one streamed chunk.
    pub stream_chunk_size: usize,
}

impl Default for PoolGatewayConfig {
    fn default() -> Self {
        PoolGatewayConfig {
            max_result_rows: 10_000,
            stream_chunk_size: 128,
        }
    }
}

/// A connection held for a transaction, a reserved connection, or both.
#[derive(Debug)]
struct Pinned {
    conn: PooledConn,
    in_transaction: bool,
    reserved: bool,
}

enum Work<'a, 'b> {
    Fetch,
    Stream(&'a mut ChunkCallback<'b>),
}

#[derive(Debug)]
pub struct PoolGateway {
    pool: ConnPool,
    config: PoolGatewayConfig,
    pinned: Mutex<BTreeMap<i64, Pinned>>,
    next_id: AtomicI64,
}

impl PoolGateway {
    pub fn new(pool: ConnPool, config: PoolGatewayConfig) -> PoolGateway {
        PoolGateway {
            pool,
            config,
            pinned: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(0),
        }
    }

    pub fn pool(&self) -> &ConnPool {
        &self.pool
    }

    /// The number of open transactions and reserved connections.
    pub fn pinned_count(&self) -> usize {
        self.pinned().len()
    }

    fn pinned(&self) -> std::sync::MutexGuard<'_, BTreeMap<i64, Pinned>> {
        self.pinned.lock().expect("lock poisoned")
    }

    fn take(&self, id: i64, target: &ShardTarget) -> Result<Pinned, SqlError> {
        self.pinned().remove(&id).ok_or_else(|| {
            SqlError::new(
                ErrorCode::Aborted,
                format!("transaction {id}: ended or not found on {target}"),
            )
        })
    }

    async fn run(
        &self,
        ctx: &QueryContext,
        request: &ShardRequest,
        work: Work<'_, '_>,
    ) -> (Result<QueryResult, SqlError>, ShardState) {
        let unchanged = ShardState {
            transaction_id: request.transaction_id,
            reserved_id: request.reserved_id,
        };
        let sql = match request.query.render() {
            Ok(sql) => sql,
            Err(err) => return (Err(err), unchanged),
        };

        let plain = request.action == ShardAction::Nothing
            && request.transaction_id == 0
            && request.reserved_id == 0;
        if plain {
            let result = match self.pool.get(ctx).await {
                Ok(conn) => self.statement(ctx, &conn, &sql, work, false).await,
                Err(err) => Err(err),
            };
            return (result, unchanged);
        }

        let (id, mut pinned) = match self.checkout(ctx, request).await {
            Ok(checked_out) => checked_out,
            Err(err) => return (Err(err), ShardState::default()),
        };
        let result = match prepare(ctx, request, &mut pinned).await {
            Ok(()) => self.statement(ctx, &pinned.conn, &sql, work, true).await,
            Err(err) => Err(err),
        };
        let state = self.settle(id, pinned, result.as_ref().err());
        (result, state)
    }

    async fn statement(
        &self,
        ctx: &QueryContext,
        conn: &PooledConn,
        sql: &str,
        work: Work<'_, '_>,
        pinned: bool,
    ) -> Result<QueryResult, SqlError> {
        let max_rows = self.config.max_result_rows;
        let chunk_size = self.config.stream_chunk_size;
        match (work, pinned) {
            (Work::Fetch, false) => conn.exec(ctx, sql, max_rows, true).await,
            (Work::Fetch, true) => conn.exec_once(ctx, sql, max_rows, true).await,
            (Work::Stream(callback), false) => conn
                .stream(ctx, sql, callback, chunk_size, IncludedFields::All)
                .await
                .map(|()| QueryResult::default()),
            (Work::Stream(callback), true) => conn
                .stream_once(ctx, sql, callback, chunk_size, IncludedFields::All)
                .await
                .map(|()| QueryResult::default()),
        }
    }

    /// Finds the pinned connection the request refers to, or checks out a
    /// new one under a fresh id.
    async fn checkout(
        &self,
        ctx: &QueryContext,
        request: &ShardRequest,
    ) -> Result<(i64, Pinned), SqlError> {
        let existing = if request.transaction_id != 0 {
            request.transaction_id
        } else {
            request.reserved_id
        };
        if existing != 0 {
            return Ok((existing, self.take(existing, &request.target)?));
        }
        let conn = self.pool.get(ctx).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((
            id,
            Pinned {
                conn,
                in_transaction: false,
                reserved: false,
            },
        ))
    }

    /// Puts a pinned connection back after a statement and reports what the
    /// session still holds. A connection that can no longer be trusted is
    /// closed, ending its transaction and reservation.
    fn settle(&self, id: i64, pinned: Pinned, err: Option<&SqlError>) -> ShardState {
        if let Some(err) = err.filter(|err| is_fatal(err)) {
            warn!(
                pool = %self.pool.name(),
                id,
                conn_id = pinned.conn.id(),
                error = %err,
                "dropping pinned connection"
            );
            pinned.conn.taint();
            return ShardState::default();
        }
        if !pinned.in_transaction && !pinned.reserved {
            pinned.conn.recycle();
            return ShardState::default();
        }
        let state = ShardState {
            transaction_id: if pinned.in_transaction { id } else { 0 },
            reserved_id: if pinned.reserved { id } else { 0 },
        };
        self.pinned().insert(id, pinned);
        state
    }

    async fn end_transaction(
        &self,
        ctx: &QueryContext,
        target: &ShardTarget,
        transaction_id: i64,
        sql: &str,
    ) -> Result<(), SqlError> {
        let mut pinned = self.take(transaction_id, target)?;
        if let Err(err) = pinned.conn.exec_once(ctx, sql, CONTROL_MAX_ROWS, false).await {
            warn!(%target, transaction_id, error = %err, "{sql} failed");
            pinned.conn.taint();
            return Err(err);
        }
        pinned.in_transaction = false;
        self.settle(transaction_id, pinned, None);
        Ok(())
    }
}

/// Reserves and begins on the pinned connection, as the request asks.
async fn prepare(
    ctx: &QueryContext,
    request: &ShardRequest,
    pinned: &mut Pinned,
) -> Result<(), SqlError> {
    if request.action.reserves() && !pinned.reserved {
        if let Some(setting) = &request.setting {
            pinned.conn.apply_setting(ctx, setting.clone()).await?;
        }
        pinned.reserved = true;
    }
    if request.action.begins() && !pinned.in_transaction {
        pinned
            .conn
            .exec_once(ctx, "begin", CONTROL_MAX_ROWS, false)
            .await?;
        pinned.in_transaction = true;
    }
    Ok(())
}

/// Whether the error leaves the connection's session in an unknown state.
fn is_fatal(err: &SqlError) -> bool {
    err.is_conn_err()
        || err.is_conn_lost_during_query()
        || matches!(err.code, ErrorCode::Canceled | ErrorCode::DeadlineExceeded)
}

#[async_trait]
impl ShardGateway for PoolGateway {
    async fn execute(
        &self,
        ctx: &QueryContext,
        request: &ShardRequest,
    ) -> (Result<QueryResult, SqlError>, ShardState) {
        self.run(ctx, request, Work::Fetch).await
    }

    async fn stream_execute(
        &self,
        ctx: &QueryContext,
        request: &ShardRequest,
        callback: &mut ChunkCallback<'_>,
    ) -> (Result<(), SqlError>, ShardState) {
        let (result, state) = self.run(ctx, request, Work::Stream(callback)).await;
        (result.map(|_| ()), state)
    }

    async fn commit(
        &self,
        ctx: &QueryContext,
        target: &ShardTarget,
        transaction_id: i64,
    ) -> Result<(), SqlError> {
        self.end_transaction(ctx, target, transaction_id, "commit")
            .await
    }

    async fn rollback(
        &self,
        ctx: &QueryContext,
        target: &ShardTarget,
        transaction_id: i64,
    ) -> Result<(), SqlError> {
        self.end_transaction(ctx, target, transaction_id, "rollback")
            .await
    }

    async fn release(
        &self,
        ctx: &QueryContext,
        target: &ShardTarget,
        transaction_id: i64,
        reserved_id: i64,
    ) -> Result<(), SqlError> {
        let id = if transaction_id != 0 {
            transaction_id
        } else {
            reserved_id
        };
        let pinned = self.take(id, target)?;
        let mut reset = Ok(());
        if pinned.in_transaction {
            reset = pinned
                .conn
                .exec_once(ctx, "rollback", CONTROL_MAX_ROWS, false)
                .await
                .map(|_| ());
        }
        if reset.is_ok() && pinned.reserved {
            reset = pinned.conn.reset_setting(ctx).await;
        }
        match reset {
            Ok(()) => {
                debug!(%target, id, "released pinned connection");
                pinned.conn.recycle();
                Ok(())
            }
            Err(err) => {
                warn!(%target, id, error = %err, "release failed");
                pinned.conn.taint();
                Err(err)
            }
        }
    }
}
