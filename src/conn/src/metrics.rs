// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus monitoring metrics.

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Metrics for connections and connection pools, shared by every pool in the
/// process. Per-pool handles come from [`ConnMetrics::pool`].
#[derive(Clone, Debug)]
pub struct ConnMetrics {
    ops: IntCounterVec,
    kills: IntCounterVec,
    reconnects: IntCounterVec,
    open: IntGaugeVec,
    idle: IntGaugeVec,
    waits: IntCounterVec,
}

impl ConnMetrics {
    /// Returns a new [ConnMetrics] instance connected to the given registry.
    pub fn register_into(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::unregistered();
        registry.register(Box::new(metrics.ops.clone()))?;
        registry.register(Box::new(metrics.kills.clone()))?;
        registry.register(Box::new(metrics.reconnects.clone()))?;
        registry.register(Box::new(metrics.open.clone()))?;
        registry.register(Box::new(metrics.idle.clone()))?;
        registry.register(Box::new(metrics.waits.clone()))?;
        Ok(metrics)
    }

    /// Returns metrics that are recorded but never exported.
    pub fn unregistered() -> Self {
        ConnMetrics {
            ops: IntCounterVec::new(
                Opts::new(
                    "shardgate_conn_ops_total",
                    "count of statements sent to a database session",
                ),
                &["pool", "op"],
            )
            .expect("valid metric"),
            kills: IntCounterVec::new(
                Opts::new("shardgate_conn_kills_total", "count of kill statements issued"),
                &["pool", "kind"],
            )
            .expect("valid metric"),
            reconnects: IntCounterVec::new(
                Opts::new(
                    "shardgate_conn_reconnects_total",
                    "count of physical reconnects",
                ),
                &["pool"],
            )
            .expect("valid metric"),
            open: IntGaugeVec::new(
                Opts::new("shardgate_pool_open", "open connections owned by a pool"),
                &["pool"],
            )
            .expect("valid metric"),
            idle: IntGaugeVec::new(
                Opts::new("shardgate_pool_idle", "idle connections held by a pool"),
                &["pool"],
            )
            .expect("valid metric"),
            waits: IntCounterVec::new(
                Opts::new(
                    "shardgate_pool_waits_total",
                    "count of pool checkouts that had to wait for capacity",
                ),
                &["pool"],
            )
            .expect("valid metric"),
        }
    }

    pub fn pool(&self, name: &str) -> PoolMetrics {
        PoolMetrics {
            exec: self.ops.with_label_values(&[name, "exec"]),
            stream: self.ops.with_label_values(&[name, "stream"]),
            kill_query: self.kills.with_label_values(&[name, "query"]),
            kill_connection: self.kills.with_label_values(&[name, "connection"]),
            reconnects: self.reconnects.with_label_values(&[name]),
            open: self.open.with_label_values(&[name]),
            idle: self.idle.with_label_values(&[name]),
            waits: self.waits.with_label_values(&[name]),
        }
    }
}

/// Metrics of a single pool and the connections it owns.
#[derive(Clone, Debug)]
pub struct PoolMetrics {
    pub exec: IntCounter,
    pub stream: IntCounter,
    pub kill_query: IntCounter,
    pub kill_connection: IntCounter,
    pub reconnects: IntCounter,
    pub open: IntGauge,
    pub idle: IntGauge,
    pub waits: IntCounter,
}

impl PoolMetrics {
    pub fn unregistered(name: &str) -> PoolMetrics {
        ConnMetrics::unregistered().pool(name)
    }
}
