// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Fans a statement out to many shards and gathers what comes back.

use std::sync::Mutex;

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use shardgate_conn::{ChunkCallback, QueryContext, Setting};
use shardgate_types::{
    BindVariables, BoundQuery, ErrorCode, QueryResult, ShardTarget, SqlError, aggregate,
};
use tracing::{debug, info, warn};

use crate::admission::{self, ReservedConnAdmission, ShardAction, ShardActionInfo};
use crate::error::ScatterError;
use crate::gateway::{ResolvedShard, ShardRequest, ShardState};
use crate::metrics::ScatterMetrics;
use crate::observer::ResultsObserver;
use crate::session::{SafeSession, TransactionMode};

/// Configures a [`ScatterConn`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScatterConfig {
    /// The most rows a buffered scatter call may hold in memory.
    pub max_memory_rows: usize,
    /// Applies to sessions that leave their transaction mode unspecified.
    pub transaction_mode: TransactionMode,
}

impl Default for ScatterConfig {
    fn default() -> Self {
        ScatterConfig {
            max_memory_rows: 300_000,
            transaction_mode: TransactionMode::Multi,
        }
    }
}

/// Runs statements on many shards at once on behalf of a session.
#[derive(Debug)]
pub struct ScatterConn {
    config: ScatterConfig,
    metrics: ScatterMetrics,
}

impl ScatterConn {
    pub fn new(config: ScatterConfig, metrics: ScatterMetrics) -> ScatterConn {
        ScatterConn { config, metrics }
    }

    pub fn config(&self) -> &ScatterConfig {
        &self.config
    }

    pub fn set_transaction_mode(&mut self, mode: TransactionMode) {
        self.config.transaction_mode = mode;
    }

    /// Runs `queries[i]` on `rss[i]` for every `i`, concurrently, and merges
    /// the results.
    ///
    /// A target listed more than once is only contacted for its first query.
    /// Each shard call is first admitted against the session's transaction
    /// state; a refused call fails only its own shard. Successful results
    /// are handed to `observer` as they arrive. If the merged result would
    /// hold more than the configured row limit, and
    /// `ignore_max_memory_rows` is not set, an empty result is returned. Calls
    /// still in flight run to completion but their rows are dropped.
    ///
    /// Errors are returned in the order the shards answered.
    pub async fn execute_multi_shard(
        &self,
        ctx: &QueryContext,
        reserved: ReservedConnAdmission,
        rss: &[ResolvedShard],
        queries: &[BoundQuery],
        session: &SafeSession,
        autocommit: bool,
        ignore_max_memory_rows: bool,
        observer: &dyn ResultsObserver,
    ) -> (QueryResult, Vec<ScatterError>) {
        if rss.len() != queries.len() {
            let errors = vec![mismatched_shards()];
            self.record_errors(&errors);
            return (QueryResult::default(), errors);
        }

        let setting = session.reserved_setting();
        let mut pending: FuturesUnordered<_> = rss
            .iter()
            .zip_eq(queries)
            .unique_by(|(rs, _)| rs.target.clone())
            .map(|(rs, query)| {
                self.execute_on_shard(ctx, reserved, rs, query, session, autocommit, &setting)
            })
            .collect();

        let mut result = QueryResult::default();
        let mut errors = Vec::new();
        let mut exceeded = false;
        while let Some(outcome) = pending.next().await {
            let unit = match outcome {
                Ok(unit) => unit,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            observer.observe(&unit);
            if exceeded {
                continue;
            }
            let limit = self.config.max_memory_rows;
            if !ignore_max_memory_rows && result.rows.len() + unit.rows.len() > limit {
                warn!(limit, "scatter result exceeded the in-memory row limit");
                exceeded = true;
                errors.push(ScatterError::untargeted(SqlError::new(
                    ErrorCode::ResourceExhausted,
                    format!("in-memory row count exceeded allowed limit of {limit}"),
                )));
                continue;
            }
            result.append_result(unit);
        }
        if exceeded {
            result = QueryResult::default();
        }
        self.record_errors(&errors);
        (result, errors)
    }

    async fn execute_on_shard(
        &self,
        ctx: &QueryContext,
        reserved: ReservedConnAdmission,
        rs: &ResolvedShard,
        query: &BoundQuery,
        session: &SafeSession,
        autocommit: bool,
        setting: &Option<Setting>,
    ) -> Result<QueryResult, ScatterError> {
        let info = self.admit(session, &rs.target, autocommit, reserved)?;
        let request = shard_request(rs, query.clone(), &info, setting);
        self.metrics
            .shard_calls
            .with_label_values(&[info.action.as_str()])
            .inc();
        let (result, state) = rs.gateway.execute(ctx, &request).await;
        record_state(session, rs, &info, state);
        result.map_err(|err| {
            debug!(target = %rs.target, error = %err, "shard call failed");
            ScatterError::for_shard(rs.target.clone(), err)
        })
    }

    /// Streams `sql`, bound to `bind_vars[i]`, from `rss[i]` for every `i`.
    ///
    /// Chunks from all shards go to `observer` and then `callback`, one chunk
    /// at a time. Admission and error reporting follow
    /// [`ScatterConn::execute_multi_shard`]; there is no row limit.
    pub async fn stream_execute_multi(
        &self,
        ctx: &QueryContext,
        reserved: ReservedConnAdmission,
        sql: &str,
        rss: &[ResolvedShard],
        bind_vars: &[BindVariables],
        session: &SafeSession,
        autocommit: bool,
        callback: &mut ChunkCallback<'_>,
        observer: &dyn ResultsObserver,
    ) -> Vec<ScatterError> {
        if rss.len() != bind_vars.len() {
            let errors = vec![mismatched_shards()];
            self.record_errors(&errors);
            return errors;
        }

        let setting = session.reserved_setting();
        let callback = Mutex::new(callback);
        let mut pending: FuturesUnordered<_> = rss
            .iter()
            .zip_eq(bind_vars)
            .unique_by(|(rs, _)| rs.target.clone())
            .map(|(rs, vars)| {
                let query = BoundQuery::with_bind_variables(sql, vars.clone());
                self.stream_on_shard(
                    ctx, reserved, rs, query, session, autocommit, &setting, &callback, observer,
                )
            })
            .collect();

        let mut errors = Vec::new();
        while let Some(outcome) = pending.next().await {
            if let Err(err) = outcome {
                errors.push(err);
            }
        }
        self.record_errors(&errors);
        errors
    }

    async fn stream_on_shard(
        &self,
        ctx: &QueryContext,
        reserved: ReservedConnAdmission,
        rs: &ResolvedShard,
        query: BoundQuery,
        session: &SafeSession,
        autocommit: bool,
        setting: &Option<Setting>,
        callback: &Mutex<&mut ChunkCallback<'_>>,
        observer: &dyn ResultsObserver,
    ) -> Result<(), ScatterError> {
        let info = self.admit(session, &rs.target, autocommit, reserved)?;
        let request = shard_request(rs, query, &info, setting);
        self.metrics
            .shard_calls
            .with_label_values(&[info.action.as_str()])
            .inc();
        let mut forward = |chunk: QueryResult| -> Result<(), SqlError> {
            let mut callback = callback.lock().expect("lock poisoned");
            observer.observe(&chunk);
            (*callback)(chunk)
        };
        let (result, state) = rs
            .gateway
            .stream_execute(ctx, &request, &mut forward)
            .await;
        record_state(session, rs, &info, state);
        result.map_err(|err| {
            debug!(target = %rs.target, error = %err, "shard stream failed");
            ScatterError::for_shard(rs.target.clone(), err)
        })
    }

    /// Commits the session's transaction on each shard in turn.
    ///
    /// The first failure stops the commit: the shards not yet committed are
    /// rolled back and the failure is returned. Either way the session
    /// leaves the transaction.
    pub async fn commit(&self, ctx: &QueryContext, session: &SafeSession) -> Result<(), SqlError> {
        let shard_sessions = session.shard_sessions();
        let mut open = shard_sessions.iter().filter(|ss| ss.transaction_id != 0);
        let mut failure = None;
        for ss in open.by_ref() {
            if let Err(err) = ss.gateway.commit(ctx, &ss.target, ss.transaction_id).await {
                info!(target = %ss.target, error = %err, "commit failed, rolling back the rest");
                failure = Some(ScatterError::for_shard(ss.target.clone(), err));
                break;
            }
        }
        let Some(failure) = failure else {
            session.reset_transaction();
            return Ok(());
        };

        let rollbacks = open.map(|ss| async move {
            if let Err(err) = ss.gateway.rollback(ctx, &ss.target, ss.transaction_id).await {
                warn!(target = %ss.target, error = %err, "rollback after failed commit");
            }
        });
        join_all(rollbacks).await;
        session.reset_transaction();
        self.record_errors(std::slice::from_ref(&failure));
        Err(SqlError::new(failure.code(), failure.to_string()))
    }

    /// Rolls back the session's transaction on every shard concurrently.
    pub async fn rollback(
        &self,
        ctx: &QueryContext,
        session: &SafeSession,
    ) -> Result<(), SqlError> {
        let shard_sessions = session.shard_sessions();
        let rollbacks = shard_sessions
            .iter()
            .filter(|ss| ss.transaction_id != 0)
            .map(|ss| async move {
                ss.gateway
                    .rollback(ctx, &ss.target, ss.transaction_id)
                    .await
                    .map_err(|err| ScatterError::for_shard(ss.target.clone(), err))
            });
        let errors: Vec<_> = join_all(rollbacks)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        session.reset_transaction();
        self.finish(errors)
    }

    /// Ends every transaction and gives back every reserved connection the
    /// session holds.
    pub async fn release(&self, ctx: &QueryContext, session: &SafeSession) -> Result<(), SqlError> {
        let shard_sessions = session.shard_sessions();
        let releases = shard_sessions.iter().map(|ss| async move {
            ss.gateway
                .release(ctx, &ss.target, ss.transaction_id, ss.reserved_id)
                .await
                .map_err(|err| ScatterError::for_shard(ss.target.clone(), err))
        });
        let errors: Vec<_> = join_all(releases)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        session.reset_all();
        self.finish(errors)
    }

    fn finish(&self, errors: Vec<ScatterError>) -> Result<(), SqlError> {
        self.record_errors(&errors);
        match aggregate(&errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn admit(
        &self,
        session: &SafeSession,
        target: &ShardTarget,
        autocommit: bool,
        reserved: ReservedConnAdmission,
    ) -> Result<ShardActionInfo, ScatterError> {
        admission::admit(
            session,
            target,
            autocommit,
            self.config.transaction_mode,
            reserved,
        )
        .map_err(|rejection| {
            debug!(%target, reason = rejection.reason(), "shard call rejected");
            self.metrics
                .rejections
                .with_label_values(&[rejection.reason()])
                .inc();
            ScatterError::for_shard(target.clone(), rejection.into())
        })
    }

    fn record_errors(&self, errors: &[ScatterError]) {
        for err in errors {
            self.metrics
                .errors
                .with_label_values(&[err.code().as_str()])
                .inc();
        }
    }
}

fn mismatched_shards() -> ScatterError {
    ScatterError::untargeted(SqlError::new(
        ErrorCode::Internal,
        "got mismatched number of queries and shards",
    ))
}

fn shard_request(
    rs: &ResolvedShard,
    query: BoundQuery,
    info: &ShardActionInfo,
    setting: &Option<Setting>,
) -> ShardRequest {
    ShardRequest {
        target: rs.target.clone(),
        query,
        action: info.action,
        transaction_id: info.transaction_id,
        reserved_id: info.reserved_id,
        setting: if info.action.reserves() {
            setting.clone()
        } else {
            None
        },
    }
}

/// Writes the shard's session state back into the session. Runs whether or
/// not the call succeeded.
fn record_state(
    session: &SafeSession,
    rs: &ResolvedShard,
    info: &ShardActionInfo,
    state: ShardState,
) {
    if info.action.begins() && state.transaction_id == 0 {
        session.release_single_db_claim(&rs.target);
    }
    let unchanged =
        state.transaction_id == info.transaction_id && state.reserved_id == info.reserved_id;
    if info.action == ShardAction::Nothing && unchanged {
        return;
    }
    session.append_or_update(
        &rs.target,
        state.transaction_id,
        state.reserved_id,
        &rs.gateway,
    );
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use shardgate_types::{Field, TabletType, Value, ValueType};

    use super::*;
    use crate::gateway::ShardGateway;
    use crate::observer::{NullResultsObserver, ScatterStats};
    use crate::sandbox::SandboxGateway;
    use crate::session::Session;

    fn target(shard: &str) -> ShardTarget {
        ShardTarget::new("ks", shard, TabletType::Replica)
    }

    fn resolved(shard: &str, sbc: &Arc<SandboxGateway>) -> ResolvedShard {
        let gateway: Arc<SandboxGateway> = Arc::clone(sbc);
        ResolvedShard::new(target(shard), gateway)
    }

    /// One sandbox per shard, named "0", "1", ...
    fn shards(n: usize) -> (Vec<Arc<SandboxGateway>>, Vec<ResolvedShard>) {
        let sbcs: Vec<_> = (0..n).map(|_| Arc::new(SandboxGateway::default())).collect();
        let rss = sbcs
            .iter()
            .enumerate()
            .map(|(i, sbc)| resolved(&i.to_string(), sbc))
            .collect();
        (sbcs, rss)
    }

    fn queries(n: usize, sql: &str) -> Vec<BoundQuery> {
        (0..n).map(|_| BoundQuery::new(sql)).collect()
    }

    fn scatter_conn(config: ScatterConfig) -> ScatterConn {
        ScatterConn::new(config, ScatterMetrics::unregistered())
    }

    fn in_transaction(mode: TransactionMode) -> SafeSession {
        SafeSession::new(Session {
            in_transaction: true,
            transaction_mode: mode,
            ..Default::default()
        })
    }

    async fn execute(
        sc: &ScatterConn,
        rss: &[ResolvedShard],
        session: &SafeSession,
    ) -> (QueryResult, Vec<ScatterError>) {
        sc.execute_multi_shard(
            &QueryContext::background(),
            ReservedConnAdmission::Allow,
            rss,
            &queries(rss.len(), "query1"),
            session,
            false,
            false,
            &NullResultsObserver,
        )
        .await
    }

    async fn stream(
        sc: &ScatterConn,
        rss: &[ResolvedShard],
        session: &SafeSession,
        autocommit: bool,
    ) -> (QueryResult, Vec<ScatterError>) {
        let mut merged = QueryResult::default();
        let mut collect = |chunk: QueryResult| -> Result<(), SqlError> {
            merged.append_result(chunk);
            Ok(())
        };
        let bind_vars = vec![BindVariables::new(); rss.len()];
        let errors = sc
            .stream_execute_multi(
                &QueryContext::background(),
                ReservedConnAdmission::Allow,
                "query1",
                rss,
                &bind_vars,
                session,
                autocommit,
                &mut collect,
                &NullResultsObserver,
            )
            .await;
        (merged, errors)
    }

    async fn run_either(
        sc: &ScatterConn,
        rss: Vec<ResolvedShard>,
        session: &SafeSession,
        streaming: bool,
    ) -> (QueryResult, Vec<ScatterError>) {
        if streaming {
            stream(sc, &rss, session, false).await
        } else {
            execute(sc, &rss, session).await
        }
    }

    #[tokio::test]
    async fn shard_errors_name_their_target() {
        for streaming in [false, true] {
            let sc = scatter_conn(ScatterConfig::default());
            let session = SafeSession::default();
            let run = |rss: Vec<ResolvedShard>| run_either(&sc, rss, &session, streaming);

            // No shards.
            let (qr, errs) = run(vec![]).await;
            assert!(errs.is_empty());
            assert_eq!(qr, QueryResult::default());

            // One shard, one error.
            let (sbcs, rss) = shards(1);
            sbcs[0].must_fail(ErrorCode::InvalidArgument, 1);
            let (_, errs) = run(rss).await;
            assert_eq!(errs.len(), 1);
            assert_eq!(
                errs[0].to_string(),
                "target: ks.0.replica: INVALID_ARGUMENT error"
            );
            assert_eq!(sbcs[0].exec_count(), 1);

            // Two shards, both fail; the most severe code wins.
            let (sbcs, rss) = shards(2);
            sbcs[0].must_fail(ErrorCode::InvalidArgument, 1);
            sbcs[1].must_fail(ErrorCode::ResourceExhausted, 1);
            let (_, errs) = run(rss).await;
            let err = aggregate(&errs).unwrap();
            assert_eq!(err.code, ErrorCode::InvalidArgument);
            assert!(
                err.message
                    .contains("target: ks.0.replica: INVALID_ARGUMENT error")
            );
            assert!(
                err.message
                    .contains("target: ks.1.replica: RESOURCE_EXHAUSTED error")
            );

            // Duplicate targets are only contacted once.
            let (sbcs, rss) = shards(1);
            let rss = vec![rss[0].clone(), rss[0].clone()];
            let (qr, errs) = run(rss).await;
            assert!(errs.is_empty());
            assert_eq!(sbcs[0].exec_count(), 1);
            assert_eq!(qr.rows.len(), 1);

            // Successes are merged.
            let (sbcs, rss) = shards(2);
            let (qr, errs) = run(rss).await;
            assert!(errs.is_empty());
            assert_eq!(qr.rows.len(), 2);
            assert_eq!(qr.rows_affected, 0);
            assert_eq!(sbcs[0].exec_count(), 1);
            assert_eq!(sbcs[1].exec_count(), 1);
        }
    }

    #[tokio::test]
    async fn autocommit_rejects_open_transaction() {
        let sc = scatter_conn(ScatterConfig::default());
        let (sbcs, rss) = shards(2);
        let session = in_transaction(TransactionMode::Unspecified);
        session.append_or_update(&target("0"), 123, 0, &rss[0].gateway);

        let queries = vec![BoundQuery::new("query1"), BoundQuery::new("query2")];
        let (_, errs) = sc
            .execute_multi_shard(
                &QueryContext::background(),
                ReservedConnAdmission::Allow,
                &rss,
                &queries,
                &session,
                true,
                false,
                &NullResultsObserver,
            )
            .await;
        assert_eq!(errs.len(), 1);
        assert_eq!(
            errs[0].to_string(),
            "target: ks.0.replica: in autocommit mode, transactionID should be zero but was: 123"
        );
        assert_eq!(errs[0].code(), ErrorCode::FailedPrecondition);
        assert_eq!(sbcs[0].exec_count(), 0);
        assert_eq!(sbcs[1].queries(), vec![BoundQuery::new("query2")]);
        // Autocommit statements never begin.
        assert_eq!(sbcs[1].begin_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn max_memory_rows() {
        let sc = scatter_conn(ScatterConfig {
            max_memory_rows: 3,
            ..Default::default()
        });
        let (sbcs, rss) = shards(2);
        let session = in_transaction(TransactionMode::Unspecified);
        let two_rows = QueryResult {
            rows: vec![vec![Value::Int64(1)], vec![Value::Int64(1)]],
            rows_affected: 1,
            insert_id: 1,
            ..Default::default()
        };

        for ignore in [true, false] {
            for sbc in &sbcs {
                sbc.set_results(vec![two_rows.clone()]);
            }
            let stats = ScatterStats::default();
            let (qr, errs) = sc
                .execute_multi_shard(
                    &QueryContext::background(),
                    ReservedConnAdmission::Allow,
                    &rss,
                    &queries(2, "query1"),
                    &session,
                    false,
                    ignore,
                    &stats,
                )
                .await;
            assert_eq!(stats.results(), 2);
            if ignore {
                assert!(errs.is_empty());
                assert_eq!(qr.rows.len(), 4);
            } else {
                assert_eq!(errs.len(), 1);
                assert_eq!(
                    errs[0].to_string(),
                    "in-memory row count exceeded allowed limit of 3"
                );
                assert_eq!(errs[0].code(), ErrorCode::ResourceExhausted);
                assert_eq!(qr, QueryResult::default());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn row_limit_lets_slower_shards_finish() {
        let sc = scatter_conn(ScatterConfig {
            max_memory_rows: 3,
            ..Default::default()
        });
        let (sbcs, rss) = shards(2);
        let session = in_transaction(TransactionMode::Multi);
        sbcs[0].set_results(vec![QueryResult {
            rows: vec![vec![Value::Int64(1)]; 4],
            ..Default::default()
        }]);
        sbcs[1].set_delay(Duration::from_millis(50));

        let stats = ScatterStats::default();
        let (qr, errs) = sc
            .execute_multi_shard(
                &QueryContext::background(),
                ReservedConnAdmission::Allow,
                &rss,
                &queries(2, "query1"),
                &session,
                false,
                false,
                &stats,
            )
            .await;
        assert_eq!(errs.len(), 1, "{errs:?}");
        assert_eq!(errs[0].code(), ErrorCode::ResourceExhausted);
        assert_eq!(qr, QueryResult::default());
        assert_eq!(stats.results(), 2);
        assert_eq!(sbcs[1].string_queries(), vec!["query1".to_string()]);
        // The slower shard's transaction survives.
        assert_eq!(session.shard_sessions().len(), 2);
    }

    #[tokio::test]
    async fn reserved_connections_denied() {
        let sc = scatter_conn(ScatterConfig::default());
        let (sbcs, rss) = shards(1);
        let session = SafeSession::new(Session {
            in_reserved_conn: true,
            ..Default::default()
        });
        let (_, errs) = sc
            .execute_multi_shard(
                &QueryContext::background(),
                ReservedConnAdmission::Deny,
                &rss,
                &queries(1, "query1"),
                &session,
                false,
                false,
                &NullResultsObserver,
            )
            .await;
        assert!(aggregate(&errs).is_some());
        assert_eq!(sbcs[0].exec_count(), 0);
        assert!(session.shard_sessions().is_empty());
    }

    #[tokio::test]
    async fn observer_sees_each_result() {
        #[derive(Default)]
        struct Recording(std::sync::Mutex<Vec<QueryResult>>);

        impl ResultsObserver for Recording {
            fn observe(&self, result: &QueryResult) {
                self.0.lock().unwrap().push(result.clone());
            }
        }

        let sc = scatter_conn(ScatterConfig::default());
        let (sbcs, rss) = shards(2);
        let results = [
            QueryResult {
                info: "r0".into(),
                ..Default::default()
            },
            QueryResult {
                info: "r1".into(),
                ..Default::default()
            },
        ];
        let bind_vars = vec![
            BTreeMap::from([("bv0".to_string(), Value::Int64(0))]),
            BTreeMap::from([("bv1".to_string(), Value::Int64(1))]),
        ];
        let queries = vec![
            BoundQuery::with_bind_variables("query1", bind_vars[0].clone()),
            BoundQuery::with_bind_variables("query2", bind_vars[1].clone()),
        ];
        let session = SafeSession::default();

        sbcs[0].set_results(vec![results[0].clone()]);
        sbcs[1].set_results(vec![results[1].clone()]);
        let observer = Recording::default();
        let (_, errs) = sc
            .execute_multi_shard(
                &QueryContext::background(),
                ReservedConnAdmission::Allow,
                &rss,
                &queries,
                &session,
                false,
                false,
                &observer,
            )
            .await;
        assert!(errs.is_empty());
        assert_eq!(sbcs[0].queries()[0].bind_variables, bind_vars[0]);
        assert_eq!(sbcs[1].queries()[0].bind_variables, bind_vars[1]);
        let mut recorded = observer.0.lock().unwrap().clone();
        recorded.sort_by(|a, b| a.info.cmp(&b.info));
        assert_eq!(recorded, results);

        sbcs[0].set_results(vec![results[0].clone()]);
        sbcs[1].set_results(vec![results[1].clone()]);
        let observer = Recording::default();
        let errs = sc
            .stream_execute_multi(
                &QueryContext::background(),
                ReservedConnAdmission::Allow,
                "query",
                &rss,
                &bind_vars,
                &session,
                false,
                &mut |_: QueryResult| -> Result<(), SqlError> { Ok(()) },
                &observer,
            )
            .await;
        assert!(errs.is_empty());
        assert_eq!(sbcs[0].queries()[1].bind_variables, bind_vars[0]);
        assert_eq!(sbcs[1].queries()[1].bind_variables, bind_vars[1]);
        let mut recorded = observer.0.lock().unwrap().clone();
        recorded.sort_by(|a, b| a.info.cmp(&b.info));
        assert_eq!(recorded, results);
    }

    #[tokio::test]
    async fn single_db_transactions() {
        let (_, rss) = shards(2);
        let want = "multi-db transaction attempted";

        // Single mode chosen by the session.
        let sc = scatter_conn(ScatterConfig::default());
        let session = in_transaction(TransactionMode::Single);
        let (_, errs) = execute(&sc, &rss[0..1], &session).await;
        assert!(errs.is_empty());
        let (_, errs) = execute(&sc, &rss[1..2], &session).await;
        assert!(errs[0].to_string().contains(want), "{}", errs[0]);
        assert_eq!(errs[0].code(), ErrorCode::InvalidArgument);

        // Single mode by configuration.
        let mut sc = scatter_conn(ScatterConfig::default());
        sc.set_transaction_mode(TransactionMode::Single);
        let session = in_transaction(TransactionMode::Unspecified);
        let (_, errs) = execute(&sc, &rss[0..1], &session).await;
        assert!(errs.is_empty());
        let (_, errs) = execute(&sc, &rss[1..2], &session).await;
        assert!(errs[0].to_string().contains(want), "{}", errs[0]);

        // Multi mode by configuration.
        sc.set_transaction_mode(TransactionMode::Multi);
        let session = in_transaction(TransactionMode::Unspecified);
        let (_, errs) = execute(&sc, &rss[0..1], &session).await;
        assert!(errs.is_empty());
        let (_, errs) = execute(&sc, &rss[1..2], &session).await;
        assert!(errs.is_empty());
        assert_eq!(session.shard_sessions().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn single_db_claim_holds_across_concurrent_begins() {
        let sc = scatter_conn(ScatterConfig::default());
        let (sbcs, rss) = shards(2);
        for sbc in &sbcs {
            sbc.set_delay(Duration::from_millis(10));
        }
        let session = in_transaction(TransactionMode::Single);
        let (_, errs) = execute(&sc, &rss, &session).await;
        assert_eq!(errs.len(), 1);
        assert_eq!(
            errs[0].to_string(),
            "target: ks.1.replica: multi-db transaction attempted: [ks.0.replica, ks.1.replica]"
        );
        assert_eq!(sbcs[0].exec_count() + sbcs[1].exec_count(), 1);
        assert_eq!(session.shard_sessions().len(), 1);
    }

    #[tokio::test]
    async fn failed_begin_gives_up_single_db_claim() {
        let sc = scatter_conn(ScatterConfig::default());
        let (sbcs, rss) = shards(2);
        sbcs[0].must_fail(ErrorCode::Unavailable, 1);
        let session = in_transaction(TransactionMode::Single);
        let (_, errs) = execute(&sc, &rss[0..1], &session).await;
        assert_eq!(errs.len(), 1);
        assert!(session.shard_sessions().is_empty());
        let (_, errs) = execute(&sc, &rss[1..2], &session).await;
        assert!(errs.is_empty());
    }

    #[tokio::test]
    async fn reserved_connection_setting_sent_first() {
        let sc = scatter_conn(ScatterConfig::default());
        let (sbcs, rss) = shards(1);
        let session = SafeSession::new(Session {
            in_reserved_conn: true,
            system_variables: BTreeMap::from([("s1".to_string(), "'value'".to_string())]),
            ..Default::default()
        });
        let (_, errs) = execute(&sc, &rss, &session).await;
        assert!(errs.is_empty());
        assert_eq!(sbcs[0].string_queries(), vec!["set @@s1 = 'value'", "query1"]);
        let reserved_id = session.find(&target("0")).unwrap().reserved_id;
        assert_ne!(reserved_id, 0);

        // The connection is already reserved and keeps its setting.
        let (_, errs) = execute(&sc, &rss, &session).await;
        assert!(errs.is_empty());
        assert_eq!(sbcs[0].string_queries().len(), 3);
        assert_eq!(sbcs[0].reserve_count.load(Ordering::SeqCst), 1);
        assert_eq!(session.find(&target("0")).unwrap().reserved_id, reserved_id);

        sc.release(&QueryContext::background(), &session)
            .await
            .unwrap();
        assert_eq!(sbcs[0].release_count.load(Ordering::SeqCst), 1);
        assert!(session.shard_sessions().is_empty());
    }

    #[tokio::test]
    async fn mismatched_queries_and_shards() {
        let sc = scatter_conn(ScatterConfig::default());
        let (sbcs, rss) = shards(2);
        let (_, errs) = sc
            .execute_multi_shard(
                &QueryContext::background(),
                ReservedConnAdmission::Allow,
                &rss,
                &queries(1, "query1"),
                &SafeSession::default(),
                false,
                false,
                &NullResultsObserver,
            )
            .await;
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].code(), ErrorCode::Internal);
        assert_eq!(
            errs[0].to_string(),
            "got mismatched number of queries and shards"
        );
        assert_eq!(sbcs[0].exec_count() + sbcs[1].exec_count(), 0);
    }

    #[tokio::test]
    async fn stream_with_autocommit_skips_begin() {
        let sc = scatter_conn(ScatterConfig::default());
        let (sbcs, rss) = shards(2);
        let session = in_transaction(TransactionMode::Unspecified);
        let (qr, errs) = stream(&sc, &rss, &session, true).await;
        assert!(errs.is_empty());
        assert_eq!(qr.rows.len(), 2);
        assert_eq!(qr.fields[0], Field::new("id", ValueType::Int64));
        for sbc in &sbcs {
            assert_eq!(sbc.begin_count.load(Ordering::SeqCst), 0);
        }
        assert!(session.shard_sessions().is_empty());
    }

    #[tokio::test]
    async fn begin_commit() {
        let sc = scatter_conn(ScatterConfig::default());
        let (sbcs, rss) = shards(2);
        let session = in_transaction(TransactionMode::Unspecified);
        let (_, errs) = execute(&sc, &rss, &session).await;
        assert!(errs.is_empty());
        let shard_sessions = session.shard_sessions();
        assert_eq!(shard_sessions.len(), 2);
        assert!(shard_sessions.iter().all(|ss| ss.transaction_id != 0));

        // Statements inside the transaction reuse it.
        let (_, errs) = execute(&sc, &rss, &session).await;
        assert!(errs.is_empty());
        for sbc in &sbcs {
            assert_eq!(sbc.begin_count.load(Ordering::SeqCst), 1);
            assert_eq!(sbc.exec_count(), 2);
        }

        sc.commit(&QueryContext::background(), &session)
            .await
            .unwrap();
        for sbc in &sbcs {
            assert_eq!(sbc.commit_count.load(Ordering::SeqCst), 1);
        }
        assert!(!session.in_transaction());
        assert!(session.shard_sessions().is_empty());
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_the_rest() {
        let sc = scatter_conn(ScatterConfig::default());
        let (sbcs, rss) = shards(3);
        let session = in_transaction(TransactionMode::Unspecified);
        for rs in &rss {
            let (_, errs) = execute(&sc, std::slice::from_ref(rs), &session).await;
            assert!(errs.is_empty());
        }
        sbcs[1].fail_commit(SqlError::new(ErrorCode::Aborted, "commit refused"));

        let err = sc
            .commit(&QueryContext::background(), &session)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Aborted);
        assert_eq!(err.message, "target: ks.1.replica: commit refused");
        assert_eq!(sbcs[0].commit_count.load(Ordering::SeqCst), 1);
        assert_eq!(sbcs[1].commit_count.load(Ordering::SeqCst), 1);
        assert_eq!(sbcs[2].commit_count.load(Ordering::SeqCst), 0);
        assert_eq!(sbcs[2].rollback_count.load(Ordering::SeqCst), 1);
        assert!(session.shard_sessions().is_empty());
    }

    #[tokio::test]
    async fn rollback() {
        let sc = scatter_conn(ScatterConfig::default());
        let (sbcs, rss) = shards(2);
        let session = in_transaction(TransactionMode::Unspecified);
        let (_, errs) = execute(&sc, &rss, &session).await;
        assert!(errs.is_empty());

        sc.rollback(&QueryContext::background(), &session)
            .await
            .unwrap();
        for sbc in &sbcs {
            assert_eq!(sbc.rollback_count.load(Ordering::SeqCst), 1);
            assert_eq!(sbc.commit_count.load(Ordering::SeqCst), 0);
        }
        assert!(!session.in_transaction());
        assert!(session.shard_sessions().is_empty());
    }

    #[tokio::test]
    async fn metrics_count_calls_errors_and_rejections() {
        let registry = prometheus::Registry::new();
        let sc = ScatterConn::new(
            ScatterConfig::default(),
            ScatterMetrics::register_into(&registry).unwrap(),
        );
        let (sbcs, rss) = shards(2);
        sbcs[1].must_fail(ErrorCode::Unavailable, 1);
        let session = SafeSession::default();
        execute(&sc, &rss, &session).await;
        let session = SafeSession::new(Session {
            in_reserved_conn: true,
            ..Default::default()
        });
        sc.execute_multi_shard(
            &QueryContext::background(),
            ReservedConnAdmission::Deny,
            &rss[0..1],
            &queries(1, "query1"),
            &session,
            false,
            false,
            &NullResultsObserver,
        )
        .await;

        let value = |name: &str, label: &str| {
            registry
                .gather()
                .into_iter()
                .find(|family| family.get_name() == name)
                .and_then(|family| {
                    family
                        .get_metric()
                        .iter()
                        .find(|m| m.get_label()[0].get_value() == label)
                        .map(|m| m.get_counter().get_value())
                })
                .unwrap_or(0.0)
        };
        assert_eq!(value("shardgate_scatter_shard_calls_total", "execute"), 2.0);
        assert_eq!(value("shardgate_scatter_errors_total", "UNAVAILABLE"), 1.0);
        assert_eq!(
            value("shardgate_scatter_errors_total", "FAILED_PRECONDITION"),
            1.0
        );
        assert_eq!(
            value("shardgate_scatter_rejections_total", "reserved_conn_denied"),
            1.0
        );
    }

    #[tokio::test]
    async fn shard_sessions_keep_their_gateway() {
        let sc = scatter_conn(ScatterConfig::default());
        let (sbcs, rss) = shards(1);
        let session = in_transaction(TransactionMode::Unspecified);
        execute(&sc, &rss, &session).await;
        let ss = session.find(&target("0")).unwrap();
        let expected: Arc<dyn ShardGateway> = Arc::<SandboxGateway>::clone(&sbcs[0]);
        assert!(Arc::ptr_eq(&ss.gateway, &expected));
    }
}
