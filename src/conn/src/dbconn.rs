// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A database session that can be interrupted.
//!
//! [`DbConn`] wraps one physical session and runs statements on it while
//! watching the caller's [`QueryContext`]. When the context is done before
//! the statement finishes, the statement is killed from a separate side
//! connection, the way a MySQL client would kill it. The call returns a
//! cancellation error once the kill has finished or timed out. A statement
//! that is still running at that point is abandoned together with its
//! physical connection, so nothing touches the session after the call
//! returns.

use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shardgate_types::{ErrorCode, QueryResult, SqlError, errno};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{ChunkCallback, Connector, IncludedFields, RawConnection};
use crate::context::{ContextError, QueryContext};
use crate::metrics::PoolMetrics;

/// Row limit for kill statements and session settings.
const ADMIN_MAX_ROWS: usize = 10000;

/// A session setting: a statement that establishes it and one that undoes
/// it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Setting {
    apply_query: String,
    reset_query: String,
}

impl Setting {
    pub fn new(apply_query: impl Into<String>, reset_query: impl Into<String>) -> Setting {
        Setting {
            apply_query: apply_query.into(),
            reset_query: reset_query.into(),
        }
    }

    pub fn apply_query(&self) -> &str {
        &self.apply_query
    }

    pub fn reset_query(&self) -> &str {
        &self.reset_query
    }
}

/// Everything a [`DbConn`] needs to (re)open sessions and kill statements.
/// Shared by all connections of a pool.
#[derive(Clone, Debug)]
pub struct ConnParams {
    pub pool_name: String,
    pub connector: Arc<dyn Connector>,
    /// Opens the side connections that kill statements run on.
    pub kill_connector: Arc<dyn Connector>,
    pub kill_timeout: Duration,
    pub metrics: PoolMetrics,
}

/// What a kill statement terminates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KillKind {
    /// `kill query <id>`: the running statement. The session survives.
    Query,
    /// `kill <id>`: the whole session.
    Connection,
}

impl KillKind {
    fn sql(self, id: u64) -> String {
        match self {
            KillKind::Query => format!("kill query {id}"),
            KillKind::Connection => format!("kill {id}"),
        }
    }
}

impl fmt::Display for KillKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KillKind::Query => f.write_str("query"),
            KillKind::Connection => f.write_str("connection"),
        }
    }
}

enum Statement<'a, 'cb> {
    Fetch {
        max_rows: usize,
        want_fields: bool,
    },
    Stream {
        chunk_size: usize,
        included_fields: IncludedFields,
        callback: &'a mut ChunkCallback<'cb>,
    },
}

enum Attempt {
    Done(Result<Option<QueryResult>, SqlError>),
    /// The context finished first. The flag records whether the statement
    /// completed while the kill ran.
    Interrupted(ContextError, bool),
}

struct ConnState {
    raw: Box<dyn RawConnection>,
    setting: Option<Setting>,
}

/// The error returned when the context ends a statement.
fn cancellation_error(reason: ContextError, before_start: bool) -> SqlError {
    let mut message = match reason {
        ContextError::Canceled => format!(
            "(errno {}) (sqlstate 70100): Query execution was interrupted",
            errno::ER_QUERY_INTERRUPTED
        ),
        ContextError::DeadlineExceeded => format!(
            "(errno {}) (sqlstate HY000): Query execution was interrupted, \
             maximum statement execution time exceeded",
            errno::ER_QUERY_TIMEOUT
        ),
    };
    if before_start {
        message.push_str(" before execution started");
    }
    SqlError::new(ErrorCode::Canceled, message)
}

async fn run_statement(
    raw: &mut dyn RawConnection,
    sql: &str,
    statement: &mut Statement<'_, '_>,
) -> Result<Option<QueryResult>, SqlError> {
    match statement {
        Statement::Fetch {
            max_rows,
            want_fields,
        } => raw.execute_fetch(sql, *max_rows, *want_fields).await.map(Some),
        Statement::Stream {
            chunk_size,
            included_fields,
            callback,
        } => raw
            .execute_streaming(sql, *chunk_size, *included_fields, &mut **callback)
            .await
            .map(|()| None),
    }
}

/// One physical database session that honors cancellation.
///
/// All operations take `&self`, so a connection can be shared with a task
/// that kills it while a statement is in flight. Statements themselves are
/// serialized.
pub struct DbConn {
    state: tokio::sync::Mutex<ConnState>,
    id: AtomicU64,
    killed: Mutex<Option<SqlError>>,
    params: Arc<ConnParams>,
    kill_timeout: Duration,
    pub(crate) generation: u64,
}

impl fmt::Debug for DbConn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DbConn")
            .field("pool", &self.params.pool_name)
            .field("id", &self.id())
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl DbConn {
    /// Opens a new session, giving up when `ctx` is done.
    pub async fn connect(ctx: &QueryContext, params: Arc<ConnParams>) -> Result<DbConn, SqlError> {
        let raw = Self::open(ctx, &params).await?;
        Ok(DbConn {
            id: AtomicU64::new(raw.id()),
            state: tokio::sync::Mutex::new(ConnState { raw, setting: None }),
            killed: Mutex::new(None),
            kill_timeout: params.kill_timeout,
            params,
            generation: 0,
        })
    }

    async fn open(
        ctx: &QueryContext,
        params: &ConnParams,
    ) -> Result<Box<dyn RawConnection>, SqlError> {
        tokio::select! {
            res = params.connector.connect() => res,
            reason = ctx.done() => Err(reason.into()),
        }
    }

    /// The server-side id of the current session.
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn kill_timeout(&self) -> Duration {
        self.kill_timeout
    }

    pub fn set_kill_timeout(&mut self, kill_timeout: Duration) {
        self.kill_timeout = kill_timeout;
    }

    /// Reports whether the physical session is gone. A connection that is
    /// busy running a statement is not closed.
    pub fn is_closed(&self) -> bool {
        match self.state.try_lock() {
            Ok(state) => state.raw.is_closed(),
            Err(_) => false,
        }
    }

    /// Closes the physical session. The next statement reconnects.
    pub async fn close(&self) {
        self.state.lock().await.raw.close();
    }

    /// Closes the physical session of a connection that is being discarded.
    pub(crate) fn shutdown(mut self) {
        self.state.get_mut().raw.close();
    }

    pub async fn setting(&self) -> Option<Setting> {
        self.state.lock().await.setting.clone()
    }

    /// Runs `sql` and buffers its result.
    ///
    /// A transient connection error is retried once on a fresh session. When
    /// `ctx` ends first the statement is killed with `kill query`.
    pub async fn exec(
        &self,
        ctx: &QueryContext,
        sql: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, SqlError> {
        let mut statement = Statement::Fetch {
            max_rows,
            want_fields,
        };
        let err = match self.attempt(ctx, sql, KillKind::Query, &mut statement).await {
            Ok(result) => return Ok(result.unwrap_or_default()),
            Err(err) if err.is_conn_err() => err,
            Err(err) => return Err(err),
        };
        self.retry_after(ctx, err).await?;
        self.attempt(ctx, sql, KillKind::Query, &mut statement)
            .await
            .map(Option::unwrap_or_default)
    }

    /// Like [`DbConn::exec`], without the retry. When `ctx` ends first the
    /// whole session is killed.
    pub async fn exec_once(
        &self,
        ctx: &QueryContext,
        sql: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, SqlError> {
        let mut statement = Statement::Fetch {
            max_rows,
            want_fields,
        };
        self.attempt(ctx, sql, KillKind::Connection, &mut statement)
            .await
            .map(Option::unwrap_or_default)
    }

    /// Runs `sql`, handing its result to `callback` chunk by chunk.
    ///
    /// A transient connection error is retried once, but only if no chunk has
    /// reached `callback` yet. An error from `callback` ends the stream and is
    /// returned as is.
    pub async fn stream(
        &self,
        ctx: &QueryContext,
        sql: &str,
        callback: &mut ChunkCallback<'_>,
        chunk_size: usize,
        included_fields: IncludedFields,
    ) -> Result<(), SqlError> {
        let sent = AtomicBool::new(false);
        let mut tracked = |chunk: QueryResult| {
            sent.store(true, Ordering::Relaxed);
            callback(chunk)
        };
        let mut statement = Statement::Stream {
            chunk_size,
            included_fields,
            callback: &mut tracked,
        };
        let err = match self.attempt(ctx, sql, KillKind::Query, &mut statement).await {
            Ok(_) => return Ok(()),
            Err(err) if err.is_conn_err() && !sent.load(Ordering::Relaxed) => err,
            Err(err) => return Err(err),
        };
        self.retry_after(ctx, err).await?;
        self.attempt(ctx, sql, KillKind::Query, &mut statement)
            .await
            .map(|_| ())
    }

    /// Like [`DbConn::stream`], without the retry. When `ctx` ends first the
    /// whole session is killed.
    pub async fn stream_once(
        &self,
        ctx: &QueryContext,
        sql: &str,
        callback: &mut ChunkCallback<'_>,
        chunk_size: usize,
        included_fields: IncludedFields,
    ) -> Result<(), SqlError> {
        let mut statement = Statement::Stream {
            chunk_size,
            included_fields,
            callback,
        };
        self.attempt(ctx, sql, KillKind::Connection, &mut statement)
            .await
            .map(|_| ())
    }

    /// Reconnects before a retry. If that fails the original error stands.
    async fn retry_after(&self, ctx: &QueryContext, err: SqlError) -> Result<(), SqlError> {
        warn!(pool = %self.params.pool_name, conn_id = self.id(), %err, "retrying after connection error");
        if let Err(reconnect_err) = self.reconnect(ctx).await {
            debug!(pool = %self.params.pool_name, %reconnect_err, "reconnect before retry failed");
            return Err(err);
        }
        Ok(())
    }

    fn take_killed(&self) -> Option<SqlError> {
        self.killed.lock().expect("lock poisoned").take()
    }

    async fn attempt(
        &self,
        ctx: &QueryContext,
        sql: &str,
        kill_kind: KillKind,
        statement: &mut Statement<'_, '_>,
    ) -> Result<Option<QueryResult>, SqlError> {
        if let Some(reason) = ctx.err() {
            return Err(cancellation_error(reason, true));
        }
        let mut state = self.state.lock().await;
        if let Some(err) = self.take_killed() {
            state.raw.close();
            return Err(err);
        }
        if state.raw.is_closed() {
            self.reconnect_locked(ctx, &mut state).await?;
        }
        match statement {
            Statement::Fetch { .. } => self.params.metrics.exec.inc(),
            Statement::Stream { .. } => self.params.metrics.stream.inc(),
        }

        let started = Instant::now();
        let attempt = {
            let mut query = pin!(run_statement(state.raw.as_mut(), sql, statement));
            tokio::select! {
                biased;
                res = &mut query => Attempt::Done(res),
                reason = ctx.done() => {
                    let reason_text = reason.to_string();
                    let mut kill = pin!(self.kill_for(kill_kind, &reason_text, started.elapsed()));
                    let mut finished = false;
                    loop {
                        tokio::select! {
                            _ = &mut query, if !finished => finished = true,
                            res = &mut kill => {
                                if let Err(err) = res {
                                    warn!(pool = %self.params.pool_name, %err, "kill on cancellation failed");
                                }
                                break;
                            }
                        }
                    }
                    Attempt::Interrupted(reason, finished)
                }
            }
        };

        match attempt {
            Attempt::Done(res) => {
                if let Some(err) = self.take_killed() {
                    state.raw.close();
                    return Err(err);
                }
                res
            }
            Attempt::Interrupted(reason, finished) => {
                if !finished {
                    state.raw.close();
                }
                self.take_killed();
                Err(cancellation_error(reason, false))
            }
        }
    }

    /// Kills the whole session.
    ///
    /// The in-flight statement, or the next one if none is running, fails
    /// with an error naming `reason`. Fails if no side connection can be
    /// opened, if the kill statement fails, or if it takes longer than the
    /// kill timeout.
    pub async fn kill(&self, reason: &str, elapsed: Duration) -> Result<(), SqlError> {
        self.kill_for(KillKind::Connection, reason, elapsed).await
    }

    /// Kills the running statement, leaving the session open. Otherwise like
    /// [`DbConn::kill`].
    pub async fn kill_query(&self, reason: &str, elapsed: Duration) -> Result<(), SqlError> {
        self.kill_for(KillKind::Query, reason, elapsed).await
    }

    async fn kill_for(&self, kind: KillKind, reason: &str, elapsed: Duration) -> Result<(), SqlError> {
        let id = self.id();
        match kind {
            KillKind::Query => self.params.metrics.kill_query.inc(),
            KillKind::Connection => self.params.metrics.kill_connection.inc(),
        }
        *self.killed.lock().expect("lock poisoned") = Some(SqlError::new(
            ErrorCode::Canceled,
            format!(
                "(errno {}) due to {reason}, elapsed time: {elapsed:?}, killing query ID {id}",
                errno::CR_SERVER_LOST
            ),
        ));
        info!(pool = %self.params.pool_name, conn_id = id, %kind, %reason, ?elapsed, "killing");

        let sql = kind.sql(id);
        let kill = async {
            let mut side = self.params.kill_connector.connect().await?;
            let res = side.execute_fetch(&sql, ADMIN_MAX_ROWS, false).await;
            side.close();
            res.map(|_| ())
        };
        match tokio::time::timeout(self.kill_timeout, kill).await {
            Ok(res) => res,
            Err(_) => Err(SqlError::new(
                ErrorCode::DeadlineExceeded,
                format!("{sql}: {}", ContextError::DeadlineExceeded),
            )),
        }
    }

    /// Replaces the physical session with a fresh one and reapplies the
    /// current setting.
    pub async fn reconnect(&self, ctx: &QueryContext) -> Result<(), SqlError> {
        let mut state = self.state.lock().await;
        self.reconnect_locked(ctx, &mut state).await
    }

    async fn reconnect_locked(&self, ctx: &QueryContext, state: &mut ConnState) -> Result<(), SqlError> {
        let old_id = self.id();
        state.raw.close();
        state.raw = Self::open(ctx, &self.params).await?;
        self.id.store(state.raw.id(), Ordering::SeqCst);
        self.take_killed();
        self.params.metrics.reconnects.inc();
        debug!(pool = %self.params.pool_name, old_id, new_id = self.id(), "reconnected");
        if let Some(setting) = &state.setting {
            if let Err(err) = state
                .raw
                .execute_fetch(&setting.apply_query, ADMIN_MAX_ROWS, false)
                .await
            {
                state.raw.close();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Applies `setting` to the session. It is reapplied after every
    /// reconnect until [`DbConn::reset_setting`].
    pub async fn apply_setting(&self, ctx: &QueryContext, setting: Setting) -> Result<(), SqlError> {
        self.exec_once(ctx, &setting.apply_query, ADMIN_MAX_ROWS, false)
            .await?;
        self.state.lock().await.setting = Some(setting);
        Ok(())
    }

    /// Undoes the current setting, if any.
    pub async fn reset_setting(&self, ctx: &QueryContext) -> Result<(), SqlError> {
        let Some(setting) = self.setting().await else {
            return Ok(());
        };
        self.exec_once(ctx, &setting.reset_query, ADMIN_MAX_ROWS, false)
            .await?;
        self.state.lock().await.setting = None;
        Ok(())
    }
}
