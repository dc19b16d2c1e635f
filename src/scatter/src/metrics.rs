// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus monitoring metrics.

use prometheus::{IntCounterVec, Opts, Registry};

/// Metrics for scatter calls.
#[derive(Clone, Debug)]
pub struct ScatterMetrics {
    pub(crate) shard_calls: IntCounterVec,
    pub(crate) errors: IntCounterVec,
    pub(crate) rejections: IntCounterVec,
}

impl ScatterMetrics {
    /// Returns a new [ScatterMetrics] instance connected to the given registry.
    pub fn register_into(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::unregistered();
        registry.register(Box::new(metrics.shard_calls.clone()))?;
        registry.register(Box::new(metrics.errors.clone()))?;
        registry.register(Box::new(metrics.rejections.clone()))?;
        Ok(metrics)
    }

    /// Returns metrics that are recorded but never exported.
    pub fn unregistered() -> Self {
        ScatterMetrics {
            shard_calls: IntCounterVec::new(
                Opts::new(
                    "shardgate_scatter_shard_calls_total",
                    "count of calls made to shards, by the action taken",
                ),
                &["op"],
            )
            .expect("valid metric"),
            errors: IntCounterVec::new(
                Opts::new(
                    "shardgate_scatter_errors_total",
                    "count of errors returned by scatter calls",
                ),
                &["code"],
            )
            .expect("valid metric"),
            rejections: IntCounterVec::new(
                Opts::new(
                    "shardgate_scatter_rejections_total",
                    "count of shard calls refused before reaching the shard",
                ),
                &["reason"],
            )
            .expect("valid metric"),
        }
    }
}
