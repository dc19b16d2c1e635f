// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::sync::atomic::{AtomicU64, Ordering};

use shardgate_types::QueryResult;

/// Sees every successful shard result, or streamed chunk, before it is
/// merged into the response.
///
/// Calls for one scatter call never overlap.
pub trait ResultsObserver: Send + Sync {
    fn observe(&self, result: &QueryResult);
}

/// Observes nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullResultsObserver;

impl ResultsObserver for NullResultsObserver {
    fn observe(&self, _: &QueryResult) {}
}

/// Counts what it observes.
#[derive(Debug, Default)]
pub struct ScatterStats {
    results: AtomicU64,
    rows: AtomicU64,
    rows_affected: AtomicU64,
}

impl ScatterStats {
    pub fn results(&self) -> u64 {
        self.results.load(Ordering::Relaxed)
    }

    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected.load(Ordering::Relaxed)
    }
}

impl ResultsObserver for ScatterStats {
    fn observe(&self, result: &QueryResult) {
        self.results.fetch_add(1, Ordering::Relaxed);
        self.rows
            .fetch_add(u64::try_from(result.rows.len()).unwrap_or(u64::MAX), Ordering::Relaxed);
        self.rows_affected
            .fetch_add(result.rows_affected, Ordering::Relaxed);
    }
}
