// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A scriptable in-memory shard for coordinator tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use shardgate_conn::{ChunkCallback, QueryContext};
use shardgate_types::{
    BoundQuery, ErrorCode, Field, QueryResult, ShardTarget, SqlError, Value, ValueType,
};

use crate::gateway::{ShardGateway, ShardRequest, ShardState};

/// The result a sandbox returns when nothing else is scripted.
pub(crate) fn single_row_result() -> QueryResult {
    QueryResult {
        fields: vec![
            Field::new("id", ValueType::Int64),
            Field::new("value", ValueType::VarChar),
        ],
        rows: vec![vec![Value::Int64(1), Value::VarChar("foo".into())]],
        ..Default::default()
    }
}

#[derive(Debug, Default)]
struct SandboxState {
    must_fail: Vec<(ErrorCode, usize)>,
    results: VecDeque<QueryResult>,
    queries: Vec<BoundQuery>,
    string_queries: Vec<String>,
    commit_error: Option<SqlError>,
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub(crate) struct SandboxGateway {
    state: Mutex<SandboxState>,
    next_id: AtomicI64,
    pub(crate) exec_count: AtomicUsize,
    pub(crate) begin_count: AtomicUsize,
    pub(crate) reserve_count: AtomicUsize,
    pub(crate) commit_count: AtomicUsize,
    pub(crate) rollback_count: AtomicUsize,
    pub(crate) release_count: AtomicUsize,
}

impl SandboxGateway {
    fn state(&self) -> std::sync::MutexGuard<'_, SandboxState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Makes the next `times` calls fail with `code`.
    pub(crate) fn must_fail(&self, code: ErrorCode, times: usize) {
        self.state().must_fail.push((code, times));
    }

    /// Queues results returned by successive calls.
    pub(crate) fn set_results(&self, results: Vec<QueryResult>) {
        self.state().results = results.into();
    }

    pub(crate) fn fail_commit(&self, err: SqlError) {
        self.state().commit_error = Some(err);
    }

    /// Makes every statement take `delay`, or until the caller's context is
    /// done.
    pub(crate) fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    pub(crate) fn exec_count(&self) -> usize {
        self.exec_count.load(Ordering::SeqCst)
    }

    pub(crate) fn queries(&self) -> Vec<BoundQuery> {
        self.state().queries.clone()
    }

    /// Every statement run on the shard, including reserved-connection
    /// settings, with bind variables substituted.
    pub(crate) fn string_queries(&self) -> Vec<String> {
        self.state().string_queries.clone()
    }

    fn take_error(&self) -> Option<SqlError> {
        let mut state = self.state();
        let (code, times) = state.must_fail.iter_mut().find(|(_, times)| *times > 0)?;
        *times -= 1;
        Some(SqlError::new(*code, format!("{} error", code.as_str())))
    }

    /// Runs the shared part of a call: the scripted failure, the begin and
    /// the reserve, then the statement itself.
    async fn run(
        &self,
        ctx: &QueryContext,
        request: &ShardRequest,
    ) -> (Result<QueryResult, SqlError>, ShardState) {
        self.exec_count.fetch_add(1, Ordering::SeqCst);
        let mut state = ShardState {
            transaction_id: request.transaction_id,
            reserved_id: request.reserved_id,
        };
        if let Some(err) = self.take_error() {
            return (Err(err), state);
        }
        let delay = self.state().delay;
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                reason = ctx.done() => return (Err(reason.into()), state),
            }
        }

        let mut guard = self.state();
        if request.action.reserves() {
            self.reserve_count.fetch_add(1, Ordering::SeqCst);
            state.reserved_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(setting) = &request.setting {
                guard.string_queries.push(setting.apply_query().to_string());
            }
        }
        if request.action.begins() {
            self.begin_count.fetch_add(1, Ordering::SeqCst);
            state.transaction_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        }
        guard.queries.push(request.query.clone());
        match request.query.render() {
            Ok(sql) => guard.string_queries.push(sql),
            Err(err) => return (Err(err), state),
        }
        let result = guard.results.pop_front().unwrap_or_else(single_row_result);
        (Ok(result), state)
    }
}

#[async_trait]
impl ShardGateway for SandboxGateway {
    async fn execute(
        &self,
        ctx: &QueryContext,
        request: &ShardRequest,
    ) -> (Result<QueryResult, SqlError>, ShardState) {
        self.run(ctx, request).await
    }

    async fn stream_execute(
        &self,
        ctx: &QueryContext,
        request: &ShardRequest,
        callback: &mut ChunkCallback<'_>,
    ) -> (Result<(), SqlError>, ShardState) {
        let (result, state) = self.run(ctx, request).await;
        (result.and_then(|result| callback(result)), state)
    }

    async fn commit(
        &self,
        _ctx: &QueryContext,
        _target: &ShardTarget,
        _transaction_id: i64,
    ) -> Result<(), SqlError> {
        self.commit_count.fetch_add(1, Ordering::SeqCst);
        match self.state().commit_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn rollback(
        &self,
        _ctx: &QueryContext,
        _target: &ShardTarget,
        _transaction_id: i64,
    ) -> Result<(), SqlError> {
        self.rollback_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(
        &self,
        _ctx: &QueryContext,
        _target: &ShardTarget,
        _transaction_id: i64,
        _reserved_id: i64,
    ) -> Result<(), SqlError> {
        self.release_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
