// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-memory stand-in for a database server, for tests.
//!
//! Statements must be registered before they are sent: exact statements
//! with [`FakeDb::add_query`], families of statements with
//! [`FakeDb::add_query_pattern`]. Anything else fails. A registered statement
//! may be given a delay during which it can be interrupted by a kill issued
//! from another connection, the way a real server would interrupt it.
//!
//! `kill <id>` and `kill query <id>` behave like their MySQL counterparts
//! once registered: after their own delay elapses they interrupt the
//! statement running on session `<id>`, and `kill <id>` also closes that
//! session.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use shardgate_types::{ErrorCode, QueryResult, SqlError, errno};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{ChunkCallback, Connector, IncludedFields, RawConnection};

/// A statement as the fake server received it.
#[derive(Clone, Debug)]
pub struct LoggedQuery {
    pub conn_id: u64,
    pub sql: String,
    pub received_at: Instant,
}

#[derive(Clone, Debug)]
struct Expected {
    result: QueryResult,
    delay: Duration,
}

#[derive(Debug)]
struct Pattern {
    regex: Regex,
    expected: Expected,
}

#[derive(Debug, Default)]
struct Session {
    closed: AtomicBool,
    running: Mutex<Option<CancellationToken>>,
}

impl Session {
    fn interrupt(&self) {
        if let Some(token) = self.running.lock().expect("lock poisoned").as_ref() {
            token.cancel();
        }
    }
}

#[derive(Debug, Default)]
struct DbState {
    queries: BTreeMap<String, Expected>,
    patterns: Vec<Pattern>,
    rejected: BTreeMap<String, SqlError>,
    ordered: Option<VecDeque<(String, Option<SqlError>)>>,
    unexpected: Vec<String>,
    conn_fail: bool,
    conn_delay: Duration,
    closed: bool,
    next_conn_id: u64,
    sessions: BTreeMap<u64, Arc<Session>>,
    log: Vec<LoggedQuery>,
}

/// A fake database server. Clones share the same server.
#[derive(Clone, Debug, Default)]
pub struct FakeDb {
    state: Arc<Mutex<DbState>>,
}

fn lost_during_query() -> SqlError {
    SqlError::mysql(
        errno::CR_SERVER_LOST,
        "HY000",
        "Lost connection to MySQL server during query",
    )
}

fn server_gone() -> SqlError {
    SqlError::mysql(errno::CR_SERVER_GONE, "HY000", "MySQL server has gone away")
}

/// Parses `kill <id>` and `kill query <id>`. The flag is set for the former.
fn parse_kill(sql: &str) -> Option<(u64, bool)> {
    let rest = sql.trim().strip_prefix("kill ")?;
    match rest.strip_prefix("query ") {
        Some(id) => id.trim().parse().ok().map(|id| (id, false)),
        None => rest.trim().parse().ok().map(|id| (id, true)),
    }
}

impl FakeDb {
    pub fn new() -> FakeDb {
        FakeDb::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DbState> {
        self.state.lock().expect("lock poisoned")
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector { db: self.clone() })
    }

    pub fn add_query(&self, sql: &str, result: QueryResult) {
        self.add_query_with_delay(sql, result, Duration::ZERO);
    }

    /// Registers `sql`; executing it takes `delay`.
    pub fn add_query_with_delay(&self, sql: &str, result: QueryResult, delay: Duration) {
        self.state().queries.insert(
            sql.to_lowercase(),
            Expected { result, delay },
        );
    }

    /// Registers every statement fully matching the regex `pattern`.
    pub fn add_query_pattern(&self, pattern: &str, result: QueryResult) {
        self.add_query_pattern_with_delay(pattern, result, Duration::ZERO);
    }

    pub fn add_query_pattern_with_delay(&self, pattern: &str, result: QueryResult, delay: Duration) {
        let regex = Regex::new(&format!("(?i)^(?:{pattern})$")).expect("valid pattern");
        self.state().patterns.push(Pattern {
            regex,
            expected: Expected { result, delay },
        });
    }

    /// Makes `sql` fail with `err`, taking precedence over registrations.
    pub fn add_rejected_query(&self, sql: &str, err: SqlError) {
        self.state().rejected.insert(sql.to_lowercase(), err);
    }

    /// Switches to ordered mode: from now on statements must arrive exactly
    /// in the order given to [`FakeDb::add_expected_query`].
    pub fn order_matters(&self) {
        self.state().ordered = Some(VecDeque::new());
    }

    pub fn add_expected_query(&self, sql: &str, err: Option<SqlError>) {
        self.state()
            .ordered
            .get_or_insert_with(VecDeque::new)
            .push_back((sql.to_string(), err));
    }

    /// Panics unless every ordered expectation was met and nothing else
    /// arrived.
    pub fn assert_all_executed(&self) {
        let state = self.state();
        assert!(
            state.unexpected.is_empty(),
            "unexpected queries: {:?}",
            state.unexpected
        );
        if let Some(ordered) = &state.ordered {
            assert!(ordered.is_empty(), "queries never executed: {ordered:?}");
        }
    }

    /// Makes every new connection attempt and every statement on an existing
    /// connection fail as if the server went away.
    pub fn enable_conn_fail(&self) {
        self.state().conn_fail = true;
    }

    pub fn disable_conn_fail(&self) {
        self.state().conn_fail = false;
    }

    pub fn set_conn_delay(&self, delay: Duration) {
        self.state().conn_delay = delay;
    }

    /// Shuts the server down. Open sessions are dropped and new connections
    /// are refused.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        for session in std::mem::take(&mut state.sessions).into_values() {
            session.closed.store(true, Ordering::SeqCst);
            session.interrupt();
        }
    }

    /// Drops session `id` on the server side.
    pub fn close_connection(&self, id: u64) {
        if let Some(session) = self.state().sessions.remove(&id) {
            session.closed.store(true, Ordering::SeqCst);
            session.interrupt();
        }
    }

    pub fn live_connections(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn query_log(&self) -> Vec<LoggedQuery> {
        self.state().log.clone()
    }

    /// The number of times `sql` was received, on any connection.
    pub fn query_count(&self, sql: &str) -> usize {
        let sql = sql.to_lowercase();
        self.state()
            .log
            .iter()
            .filter(|q| q.sql.to_lowercase() == sql)
            .count()
    }

    fn resolve(state: &mut DbState, sql: &str) -> Result<Expected, SqlError> {
        if let Some(ordered) = &mut state.ordered {
            return match ordered.pop_front() {
                Some((expected, err)) if expected.eq_ignore_ascii_case(sql) => match err {
                    Some(err) => Err(err),
                    None => Ok(Expected {
                        result: QueryResult::default(),
                        delay: Duration::ZERO,
                    }),
                },
                next => {
                    state.unexpected.push(sql.to_string());
                    Err(SqlError::mysql(
                        errno::ER_UNKNOWN_ERROR,
                        "HY000",
                        format!("unexpected query: {sql}, expected: {next:?}"),
                    ))
                }
            };
        }
        let key = sql.to_lowercase();
        if let Some(err) = state.rejected.get(&key) {
            return Err(err.clone());
        }
        if let Some(expected) = state.queries.get(&key) {
            return Ok(expected.clone());
        }
        if let Some(pattern) = state.patterns.iter().find(|p| p.regex.is_match(sql)) {
            return Ok(pattern.expected.clone());
        }
        Err(SqlError::mysql(
            errno::ER_UNKNOWN_ERROR,
            "HY000",
            format!("query: '{sql}' is not supported on fakedb"),
        ))
    }

    /// Receives `sql` on session `conn_id` and decides what it will do.
    fn receive(&self, conn_id: u64, session: &Session, sql: &str) -> Result<Received, SqlError> {
        let mut state = self.state();
        if state.conn_fail {
            return Err(SqlError::mysql(
                errno::CR_SERVER_LOST,
                "HY000",
                "packet read failed",
            ));
        }
        state.log.push(LoggedQuery {
            conn_id,
            sql: sql.to_string(),
            received_at: Instant::now(),
        });
        let expected = Self::resolve(&mut state, sql);
        let interrupt = CancellationToken::new();
        *session.running.lock().expect("lock poisoned") = Some(interrupt.clone());
        Ok(Received {
            expected,
            kill: parse_kill(sql),
            interrupt,
        })
    }

    fn apply_kill(&self, target: u64, whole_connection: bool) {
        let mut state = self.state();
        let session = if whole_connection {
            state.sessions.remove(&target)
        } else {
            state.sessions.get(&target).cloned()
        };
        if let Some(session) = session {
            if whole_connection {
                session.closed.store(true, Ordering::SeqCst);
            }
            session.interrupt();
        }
    }

    async fn run(&self, received: Received) -> Result<QueryResult, SqlError> {
        let expected = received.expected?;
        if !expected.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(expected.delay) => {}
                _ = received.interrupt.cancelled() => return Err(lost_during_query()),
            }
        } else if received.interrupt.is_cancelled() {
            return Err(lost_during_query());
        }
        if let Some((target, whole_connection)) = received.kill {
            self.apply_kill(target, whole_connection);
        }
        Ok(expected.result)
    }
}

struct Received {
    expected: Result<Expected, SqlError>,
    kill: Option<(u64, bool)>,
    interrupt: CancellationToken,
}

#[derive(Debug)]
struct FakeConnector {
    db: FakeDb,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn RawConnection>, SqlError> {
        let delay = {
            let state = self.db.state();
            if state.closed {
                return Err(SqlError::mysql(
                    errno::CR_CONNECTION_ERROR,
                    "HY000",
                    "no such file or directory",
                ));
            }
            if state.conn_fail {
                return Err(SqlError::mysql(
                    errno::CR_SERVER_LOST,
                    "HY000",
                    "Lost connection to MySQL server at 'reading initial communication packet'",
                ));
            }
            state.conn_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.db.state();
        state.next_conn_id += 1;
        let id = state.next_conn_id;
        let session = Arc::new(Session::default());
        state.sessions.insert(id, Arc::clone(&session));
        Ok(Box::new(FakeConnection {
            id,
            db: self.db.clone(),
            session,
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct FakeConnection {
    id: u64,
    db: FakeDb,
    session: Arc<Session>,
    closed: bool,
}

impl FakeConnection {
    async fn execute(&mut self, sql: &str) -> Result<QueryResult, SqlError> {
        if self.is_closed() {
            return Err(server_gone());
        }
        let received = self.db.receive(self.id, &self.session, sql)?;
        let result = self.db.run(received).await;
        self.session.running.lock().expect("lock poisoned").take();
        result
    }
}

#[async_trait]
impl RawConnection for FakeConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.closed || self.session.closed.load(Ordering::SeqCst)
    }

    async fn execute_fetch(
        &mut self,
        sql: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, SqlError> {
        let mut result = self.execute(sql).await?;
        if result.rows.len() > max_rows {
            return Err(SqlError::new(
                ErrorCode::ResourceExhausted,
                format!("Row count exceeded {max_rows}"),
            ));
        }
        if !want_fields {
            result.fields.clear();
        }
        Ok(result)
    }

    async fn execute_streaming(
        &mut self,
        sql: &str,
        chunk_size: usize,
        included_fields: IncludedFields,
        callback: &mut ChunkCallback<'_>,
    ) -> Result<(), SqlError> {
        let mut result = self.execute(sql).await?;
        if included_fields == IncludedFields::TypeOnly {
            for field in &mut result.fields {
                field.name.clear();
            }
        }
        if !result.fields.is_empty() {
            callback(QueryResult {
                fields: std::mem::take(&mut result.fields),
                ..Default::default()
            })?;
        }
        let mut rows = std::mem::take(&mut result.rows).into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<_> = rows.by_ref().take(chunk_size.max(1)).collect();
            callback(QueryResult {
                rows: chunk,
                ..Default::default()
            })?;
        }
        if result.rows_affected != 0 || result.insert_id != 0 {
            callback(QueryResult {
                rows_affected: result.rows_affected,
                insert_id: result.insert_id,
                ..Default::default()
            })?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.db.close_connection(self.id);
        }
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.close();
    }
}
