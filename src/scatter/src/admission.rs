// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Decides what a shard call has to do to the shard's session, and whether
//! it may happen at all.
//!
//! Every check runs under the session lock before the shard is contacted.
//! A rejected call never reaches its shard.

use itertools::Itertools;
use shardgate_types::{ErrorCode, ShardTarget, SqlError};

use crate::session::{SafeSession, TransactionMode};

/// What has to happen on the shard before the statement runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardAction {
    Nothing,
    Begin,
    Reserve,
    ReserveBegin,
}

impl ShardAction {
    pub fn begins(self) -> bool {
        matches!(self, ShardAction::Begin | ShardAction::ReserveBegin)
    }

    pub fn reserves(self) -> bool {
        matches!(self, ShardAction::Reserve | ShardAction::ReserveBegin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShardAction::Nothing => "execute",
            ShardAction::Begin => "begin_execute",
            ShardAction::Reserve => "reserve_execute",
            ShardAction::ReserveBegin => "reserve_begin_execute",
        }
    }
}

/// The action for one shard call and the ids the session already holds on
/// that shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardActionInfo {
    pub action: ShardAction,
    pub transaction_id: i64,
    pub reserved_id: i64,
}

/// Whether a call may open reserved connections on shards that have none.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReservedConnAdmission {
    #[default]
    Allow,
    Deny,
}

/// Why a shard call was refused.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("in autocommit mode, transactionID should be zero but was: {0}")]
    AutocommitInTransaction(i64),
    #[error("multi-db transaction attempted: [{}]", .0.iter().join(", "))]
    MultiDbTransaction(Vec<ShardTarget>),
    #[error("reserved connection cannot be created on {0}: new reserved connections are not allowed")]
    ReservedConnDenied(ShardTarget),
}

impl Rejection {
    pub fn code(&self) -> ErrorCode {
        match self {
            Rejection::AutocommitInTransaction(_) => ErrorCode::FailedPrecondition,
            Rejection::MultiDbTransaction(_) => ErrorCode::InvalidArgument,
            Rejection::ReservedConnDenied(_) => ErrorCode::FailedPrecondition,
        }
    }

    /// A short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::AutocommitInTransaction(_) => "autocommit_in_transaction",
            Rejection::MultiDbTransaction(_) => "multi_db_transaction",
            Rejection::ReservedConnDenied(_) => "reserved_conn_denied",
        }
    }
}

impl From<Rejection> for SqlError {
    fn from(rejection: Rejection) -> SqlError {
        SqlError::new(rejection.code(), rejection.to_string())
    }
}

/// Admits or rejects a call of `target` on behalf of `session`.
///
/// `default_mode` applies when the session does not choose a transaction
/// mode. An admitted single-shard begin claims the session's one transaction
/// slot for `target`; the caller must hand the claim back with
/// [`SafeSession::release_single_db_claim`] if the begin produces no
/// transaction.
pub fn admit(
    session: &SafeSession,
    target: &ShardTarget,
    autocommit: bool,
    default_mode: TransactionMode,
    reserved: ReservedConnAdmission,
) -> Result<ShardActionInfo, Rejection> {
    let mut state = session.lock();
    let s = &state.session;
    if !s.in_transaction && !s.in_reserved_conn {
        return Ok(ShardActionInfo {
            action: ShardAction::Nothing,
            transaction_id: 0,
            reserved_id: 0,
        });
    }

    let (transaction_id, reserved_id) = s
        .find(target)
        .map_or((0, 0), |ss| (ss.transaction_id, ss.reserved_id));
    if autocommit && transaction_id != 0 {
        return Err(Rejection::AutocommitInTransaction(transaction_id));
    }

    let should_reserve = s.in_reserved_conn && reserved_id == 0;
    let should_begin = s.in_transaction && transaction_id == 0 && !autocommit;
    if should_reserve && !s.in_transaction && reserved == ReservedConnAdmission::Deny {
        return Err(Rejection::ReservedConnDenied(target.clone()));
    }

    let mode = match s.transaction_mode {
        TransactionMode::Unspecified => default_mode,
        mode => mode,
    };
    if should_begin && mode == TransactionMode::Single {
        let mut others: Vec<ShardTarget> = s
            .shard_sessions
            .iter()
            .filter(|ss| ss.transaction_id != 0 && &ss.target != target)
            .map(|ss| ss.target.clone())
            .collect();
        if let Some(claim) = &state.single_db_claim {
            if claim != target && !others.contains(claim) {
                others.push(claim.clone());
            }
        }
        if !others.is_empty() {
            others.push(target.clone());
            return Err(Rejection::MultiDbTransaction(others));
        }
        state.single_db_claim = Some(target.clone());
    }

    let action = match (should_begin, should_reserve) {
        (true, true) => ShardAction::ReserveBegin,
        (true, false) => ShardAction::Begin,
        (false, true) => ShardAction::Reserve,
        (false, false) => ShardAction::Nothing,
    };
    Ok(ShardActionInfo {
        action,
        transaction_id,
        reserved_id,
    })
}
