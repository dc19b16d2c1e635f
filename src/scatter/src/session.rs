// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Client session state that spans shards.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use shardgate_conn::Setting;
use shardgate_types::ShardTarget;

use crate::gateway::ShardGateway;

/// How many shards a single transaction may span.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionMode {
    /// Defer to the coordinator's configured mode.
    #[default]
    Unspecified,
    /// At most one shard per transaction.
    Single,
    /// Any number of shards, committed one after the other.
    Multi,
    /// Any number of shards, committed atomically.
    TwoPc,
}

/// The state a session holds on one shard.
#[derive(Clone, Debug)]
pub struct ShardSession {
    pub target: ShardTarget,
    /// Non-zero while a transaction is open on the shard.
    pub transaction_id: i64,
    /// Non-zero while the session holds a reserved connection on the shard.
    pub reserved_id: i64,
    pub gateway: Arc<dyn ShardGateway>,
}

/// A client session.
#[derive(Clone, Debug, Default)]
pub struct Session {
    pub in_transaction: bool,
    pub autocommit: bool,
    pub transaction_mode: TransactionMode,
    pub in_reserved_conn: bool,
    /// System variable overrides, applied to every reserved connection. Values
    /// are SQL literals.
    pub system_variables: BTreeMap<String, String>,
    pub shard_sessions: Vec<ShardSession>,
}

impl Session {
    pub fn find(&self, target: &ShardTarget) -> Option<&ShardSession> {
        self.shard_sessions.iter().find(|s| &s.target == target)
    }
}

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) session: Session,
    /// The target a single-shard transaction has been promised to, before
    /// its begin has produced a transaction id.
    pub(crate) single_db_claim: Option<ShardTarget>,
}

/// A [`Session`] that concurrent shard calls can read and update.
///
/// The lock is only ever held for a synchronous read or update, never while
/// a shard is being contacted.
#[derive(Debug, Default)]
pub struct SafeSession {
    state: Mutex<SessionState>,
}

impl SafeSession {
    pub fn new(session: Session) -> SafeSession {
        SafeSession {
            state: Mutex::new(SessionState {
                session,
                single_db_claim: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("lock poisoned")
    }

    /// A copy of the current session.
    pub fn snapshot(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn into_inner(self) -> Session {
        self.state.into_inner().expect("lock poisoned").session
    }

    pub fn in_transaction(&self) -> bool {
        self.lock().session.in_transaction
    }

    pub fn set_in_transaction(&self, in_transaction: bool) {
        self.lock().session.in_transaction = in_transaction;
    }

    pub fn in_reserved_conn(&self) -> bool {
        self.lock().session.in_reserved_conn
    }

    pub fn find(&self, target: &ShardTarget) -> Option<ShardSession> {
        self.lock().session.find(target).cloned()
    }

    pub fn shard_sessions(&self) -> Vec<ShardSession> {
        self.lock().session.shard_sessions.clone()
    }

    /// The setting every newly reserved connection starts with, built from
    /// the system variable overrides.
    pub fn reserved_setting(&self) -> Option<Setting> {
        let state = self.lock();
        let vars = &state.session.system_variables;
        if vars.is_empty() {
            return None;
        }
        let apply = vars
            .iter()
            .map(|(name, value)| format!("@@{name} = {value}"))
            .join(", ");
        let reset = vars
            .keys()
            .map(|name| format!("@@{name} = default"))
            .join(", ");
        Some(Setting::new(format!("set {apply}"), format!("set {reset}")))
    }

    /// Records the ids a shard call left behind. Ids that are zero clear the
    /// corresponding state; a record with neither id is dropped.
    pub fn append_or_update(
        &self,
        target: &ShardTarget,
        transaction_id: i64,
        reserved_id: i64,
        gateway: &Arc<dyn ShardGateway>,
    ) {
        let mut state = self.lock();
        let sessions = &mut state.session.shard_sessions;
        match sessions.iter().position(|s| &s.target == target) {
            Some(i) if transaction_id == 0 && reserved_id == 0 => {
                sessions.remove(i);
            }
            Some(i) => {
                sessions[i].transaction_id = transaction_id;
                sessions[i].reserved_id = reserved_id;
            }
            None if transaction_id == 0 && reserved_id == 0 => {}
            None => sessions.push(ShardSession {
                target: target.clone(),
                transaction_id,
                reserved_id,
                gateway: Arc::clone(gateway),
            }),
        }
    }

    /// Gives up a single-shard claim made for `target`.
    pub(crate) fn release_single_db_claim(&self, target: &ShardTarget) {
        let mut state = self.lock();
        if state.single_db_claim.as_ref() == Some(target) {
            state.single_db_claim = None;
        }
    }

    /// Ends the transaction. Reserved connections stay with the session.
    pub fn reset_transaction(&self) {
        let mut state = self.lock();
        state.single_db_claim = None;
        state.session.in_transaction = false;
        state.session.shard_sessions.retain_mut(|s| {
            s.transaction_id = 0;
            s.reserved_id != 0
        });
    }

    /// Forgets all shard state.
    pub fn reset_all(&self) {
        let mut state = self.lock();
        state.single_db_claim = None;
        state.session.in_transaction = false;
        state.session.shard_sessions.clear();
    }
}
