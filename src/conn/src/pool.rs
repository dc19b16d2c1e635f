// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A bounded pool of [`DbConn`]s.
//!
//! Each checked-out connection holds a semaphore permit, so at most
//! `capacity` connections are in use at once. Returned connections are kept
//! idle, up to `max_idle` of them, and handed out again before new sessions
//! are opened. Connections opened before the last [`ConnPool::invalidate`]
//! are never handed out again.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardgate_types::{ErrorCode, SqlError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info};

use crate::backend::Connector;
use crate::context::QueryContext;
use crate::dbconn::{ConnParams, DbConn};
use crate::metrics::ConnMetrics;

/// Configures a [`ConnPool`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Labels the pool in logs and metrics.
    pub name: String,
    /// The most connections open at once.
    pub capacity: usize,
    /// The most connections kept open while unused.
    pub max_idle: usize,
    /// How long a kill statement may take.
    pub kill_timeout: Duration,
    /// How long [`ConnPool::get`] waits for capacity. Unbounded if unset.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            name: "default".into(),
            capacity: 16,
            max_idle: 8,
            kill_timeout: Duration::from_secs(1),
            acquire_timeout: None,
        }
    }
}

fn pool_closed() -> SqlError {
    SqlError::new(ErrorCode::Unavailable, "connection pool is closed")
}

#[derive(Debug)]
struct PoolInner {
    params: Arc<ConnParams>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<DbConn>>,
    max_idle: AtomicUsize,
    open: AtomicUsize,
    generation: AtomicU64,
    closed: AtomicBool,
    acquire_timeout: Option<Duration>,
}

/// A pool of connections to one database. Clones share the pool.
#[derive(Clone, Debug)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

impl ConnPool {
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        kill_connector: Arc<dyn Connector>,
        metrics: &ConnMetrics,
    ) -> ConnPool {
        let params = ConnParams {
            metrics: metrics.pool(&config.name),
            pool_name: config.name,
            connector,
            kill_connector,
            kill_timeout: config.kill_timeout,
        };
        ConnPool {
            inner: Arc::new(PoolInner {
                params: Arc::new(params),
                semaphore: Arc::new(Semaphore::new(config.capacity)),
                idle: Mutex::new(VecDeque::new()),
                max_idle: AtomicUsize::new(config.max_idle),
                open: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                acquire_timeout: config.acquire_timeout,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.params.pool_name
    }

    /// The number of connections the pool has open, idle or checked out.
    pub fn open_count(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, VecDeque<DbConn>> {
        self.inner.idle.lock().expect("lock poisoned")
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Checks out a connection, reusing an idle one if possible.
    ///
    /// Waits while the pool is at capacity, until `ctx` is done or the
    /// acquire timeout passes.
    pub async fn get(&self, ctx: &QueryContext) -> Result<PooledConn, SqlError> {
        let permit = self.acquire(ctx).await?;
        let generation = self.generation();
        loop {
            let Some(conn) = self.idle().pop_back() else {
                break;
            };
            self.inner.params.metrics.idle.dec();
            if conn.generation == generation && !conn.is_closed() {
                return Ok(self.checked_out(conn, permit));
            }
            debug!(pool = %self.name(), conn_id = conn.id(), "discarding unusable idle connection");
            self.discard(conn);
        }

        let mut conn = DbConn::connect(ctx, Arc::clone(&self.inner.params)).await?;
        conn.generation = generation;
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        self.inner.params.metrics.open.inc();
        Ok(self.checked_out(conn, permit))
    }

    fn checked_out(&self, conn: DbConn, permit: OwnedSemaphorePermit) -> PooledConn {
        PooledConn {
            conn: Some(conn),
            pool: self.clone(),
            _permit: permit,
        }
    }

    async fn acquire(&self, ctx: &QueryContext) -> Result<OwnedSemaphorePermit, SqlError> {
        match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(pool_closed()),
            Err(TryAcquireError::NoPermits) => {}
        }
        self.inner.params.metrics.waits.inc();
        let timeout = async {
            match self.inner.acquire_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            res = Arc::clone(&self.inner.semaphore).acquire_owned() => res.map_err(|_| pool_closed()),
            reason = ctx.done() => Err(reason.into()),
            () = timeout => Err(SqlError::new(ErrorCode::ResourceExhausted, "resource pool timed out")),
        }
    }

    /// Returns a connection to the pool.
    pub fn put(&self, conn: PooledConn) {
        conn.recycle();
    }

    fn recycle(&self, conn: DbConn) {
        if self.inner.closed.load(Ordering::SeqCst)
            || conn.generation != self.generation()
            || conn.is_closed()
        {
            self.discard(conn);
            return;
        }
        let mut idle = self.idle();
        if idle.len() >= self.inner.max_idle.load(Ordering::SeqCst) {
            drop(idle);
            self.discard(conn);
            return;
        }
        idle.push_back(conn);
        self.inner.params.metrics.idle.inc();
    }

    fn discard(&self, conn: DbConn) {
        conn.shutdown();
        self.inner.open.fetch_sub(1, Ordering::SeqCst);
        self.inner.params.metrics.open.dec();
    }

    /// Changes how many idle connections are kept, closing any excess now.
    pub fn set_max_idle(&self, max_idle: usize) {
        self.inner.max_idle.store(max_idle, Ordering::SeqCst);
        let excess: Vec<_> = {
            let mut idle = self.idle();
            let n = idle.len().saturating_sub(max_idle);
            idle.drain(..n).collect()
        };
        for conn in excess {
            self.inner.params.metrics.idle.dec();
            self.discard(conn);
        }
    }

    /// Retires every connection opened so far. Idle ones are closed now and
    /// checked-out ones when they are returned.
    pub fn invalidate(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(pool = %self.name(), generation, "invalidating pool connections");
        self.drain_idle();
    }

    fn drain_idle(&self) {
        let idle: Vec<_> = self.idle().drain(..).collect();
        for conn in idle {
            self.inner.params.metrics.idle.dec();
            self.discard(conn);
        }
    }

    /// Closes idle connections and fails current and future waiters.
    /// Checked-out connections are closed when they are returned.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(pool = %self.name(), "closing pool");
        self.inner.semaphore.close();
        self.drain_idle();
    }
}

/// A connection checked out of a [`ConnPool`]. Dropping it returns the
/// connection to the pool.
#[derive(Debug)]
pub struct PooledConn {
    conn: Option<DbConn>,
    pool: ConnPool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    /// Returns the connection to its pool.
    pub fn recycle(self) {}

    /// Closes a connection known to be unusable instead of returning it.
    pub fn taint(mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(pool = %self.pool.name(), conn_id = conn.id(), "tainted connection");
            self.pool.discard(conn);
        }
    }
}

impl Deref for PooledConn {
    type Target = DbConn;

    fn deref(&self) -> &DbConn {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut DbConn {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.recycle(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use shardgate_types::QueryResult;

    use super::*;
    use crate::fakedb::FakeDb;
    use crate::test_util::init_logging;

    fn pool(db: &FakeDb, capacity: usize, max_idle: usize) -> ConnPool {
        ConnPool::new(
            PoolConfig {
                name: "test".into(),
                capacity,
                max_idle,
                ..Default::default()
            },
            db.connector(),
            db.connector(),
            &ConnMetrics::unregistered(),
        )
    }

    #[tokio::test]
    async fn reuses_idle_connections() {
        init_logging();
        let db = FakeDb::new();
        let pool = pool(&db, 2, 2);
        let ctx = QueryContext::background();

        let conn = pool.get(&ctx).await.unwrap();
        let id = conn.id();
        pool.put(conn);
        assert_eq!(pool.idle_count(), 1);

        let conn = pool.get(&ctx).await.unwrap();
        assert_eq!(conn.id(), id);
        assert_eq!(db.live_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_capacity() {
        init_logging();
        let db = FakeDb::new();
        let pool = pool(&db, 1, 1);
        let held = pool.get(&QueryContext::background()).await.unwrap();

        let ctx = QueryContext::background().with_timeout(Duration::from_millis(10));
        let err = pool.get(&ctx).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::DeadlineExceeded);
        assert_eq!(pool.inner.params.metrics.waits.get(), 1);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get(&QueryContext::background()).await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = held.id();
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_timeout() {
        init_logging();
        let db = FakeDb::new();
        let pool = ConnPool::new(
            PoolConfig {
                capacity: 1,
                acquire_timeout: Some(Duration::from_millis(5)),
                ..Default::default()
            },
            db.connector(),
            db.connector(),
            &ConnMetrics::unregistered(),
        );
        let _held = pool.get(&QueryContext::background()).await.unwrap();
        let err = pool.get(&QueryContext::background()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ResourceExhausted);
    }

    #[tokio::test]
    async fn closes_excess_idle_connections() {
        init_logging();
        let db = FakeDb::new();
        let pool = pool(&db, 4, 1);
        let ctx = QueryContext::background();
        let conns = vec![
            pool.get(&ctx).await.unwrap(),
            pool.get(&ctx).await.unwrap(),
            pool.get(&ctx).await.unwrap(),
        ];
        assert_eq!(db.live_connections(), 3);
        drop(conns);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.open_count(), 1);
        assert_eq!(db.live_connections(), 1);

        pool.set_max_idle(0);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(db.live_connections(), 0);
    }

    #[tokio::test]
    async fn invalidate_discards_stale_connections() {
        init_logging();
        let db = FakeDb::new();
        let pool = pool(&db, 2, 2);
        let ctx = QueryContext::background();
        let idle = pool.get(&ctx).await.unwrap();
        let held = pool.get(&ctx).await.unwrap();
        let stale_id = held.id();
        drop(idle);

        pool.invalidate();
        assert_eq!(pool.idle_count(), 0);
        drop(held);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(db.live_connections(), 0);

        let fresh = pool.get(&ctx).await.unwrap();
        assert_ne!(fresh.id(), stale_id);
    }

    #[tokio::test]
    async fn taint_and_server_side_close() {
        init_logging();
        let db = FakeDb::new();
        db.add_query("select 1", QueryResult::default());
        let pool = pool(&db, 2, 2);
        let ctx = QueryContext::background();

        pool.get(&ctx).await.unwrap().taint();
        assert_eq!(pool.open_count(), 0);
        assert_eq!(db.live_connections(), 0);

        let conn = pool.get(&ctx).await.unwrap();
        let id = conn.id();
        drop(conn);
        db.close_connection(id);
        let conn = pool.get(&ctx).await.unwrap();
        assert_ne!(conn.id(), id);
        conn.exec(&ctx, "select 1", 1, false).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_waiters() {
        init_logging();
        let db = FakeDb::new();
        let pool = pool(&db, 1, 1);
        let held = pool.get(&QueryContext::background()).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get(&QueryContext::background()).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        pool.close();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "connection pool is closed");
        drop(held);
        assert_eq!(pool.open_count(), 0);
        assert_eq!(db.live_connections(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_capacity() {
        init_logging();
        let db = FakeDb::new();
        db.add_query_with_delay("select 1", QueryResult::default(), Duration::from_millis(2));
        let pool = pool(&db, 3, 2);
        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let pool = pool.clone();
                let db = db.clone();
                tokio::spawn(async move {
                    let ctx = QueryContext::background();
                    let conn = pool.get(&ctx).await.unwrap();
                    assert!(pool.open_count() <= 3);
                    assert!(db.live_connections() <= 3);
                    conn.exec(&ctx, "select 1", 1, false).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(pool.idle_count() <= 2);
    }
}
