//! Prometheus metrics for the monitor
//!
//! Registered once in a process-global registry; the public handle is a
//! cheap marker that all components share.

use crate::models::ScalingEvent;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;

/// Histogram buckets for tick latency (seconds)
const TICK_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static GLOBAL_METRICS: OnceLock<MonitorMetricsInner> = OnceLock::new();

struct MonitorMetricsInner {
    tick_latency_seconds: Histogram,
    containers_monitored: IntGauge,
    engine_up: IntGauge,
    clones_created: IntCounter,
    clone_failures: IntCounter,
    clones_reaped: IntCounter,
    collection_errors: IntCounter,
}

impl MonitorMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "dockmon_tick_latency_seconds",
                "Time spent on one polling tick",
                TICK_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            containers_monitored: register_int_gauge!(
                "dockmon_containers_monitored",
                "Number of containers in the most recent snapshot batch"
            )
            .expect("Failed to register containers_monitored"),

            engine_up: register_int_gauge!(
                "dockmon_engine_up",
                "Whether the container engine was reachable on the last tick"
            )
            .expect("Failed to register engine_up"),

            clones_created: register_int_counter!(
                "dockmon_clones_created_total",
                "Total clone containers created"
            )
            .expect("Failed to register clones_created_total"),

            clone_failures: register_int_counter!(
                "dockmon_clone_failures_total",
                "Total failed clone creation attempts"
            )
            .expect("Failed to register clone_failures_total"),

            clones_reaped: register_int_counter!(
                "dockmon_clones_reaped_total",
                "Total clones removed because their original disappeared"
            )
            .expect("Failed to register clones_reaped_total"),

            collection_errors: register_int_counter!(
                "dockmon_collection_errors_total",
                "Total listing/stats failures"
            )
            .expect("Failed to register collection_errors_total"),
        }
    }
}

/// Shared metrics handle; clones point at the same global registry
#[derive(Clone)]
pub struct MonitorMetrics {
    _private: (),
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(MonitorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &MonitorMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    pub fn set_containers_monitored(&self, count: i64) {
        self.inner().containers_monitored.set(count);
    }

    pub fn set_engine_up(&self, up: bool) {
        self.inner().engine_up.set(i64::from(up));
    }

    pub fn inc_collection_errors(&self) {
        self.inner().collection_errors.inc();
    }

    /// Count one scaling event into the matching counter
    pub fn count_scaling_event(&self, event: &ScalingEvent) {
        match event {
            ScalingEvent::CloneCreated { .. } => self.inner().clones_created.inc(),
            ScalingEvent::CloneFailed { .. } => self.inner().clone_failures.inc(),
            ScalingEvent::ClonesReaped { reaped, .. } => {
                self.inner().clones_reaped.inc_by(*reaped as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_handle_is_usable() {
        // Metrics live in a process-global registry, so this exercises
        // registration plus the observation paths.
        let metrics = MonitorMetrics::new();
        metrics.observe_tick_latency(0.01);
        metrics.set_containers_monitored(3);
        metrics.set_engine_up(true);
        metrics.inc_collection_errors();
        metrics.count_scaling_event(&ScalingEvent::CloneCreated {
            original_id: "o".into(),
            clone_id: "c".into(),
            clone_name: "n".into(),
        });
        metrics.count_scaling_event(&ScalingEvent::ClonesReaped {
            original_id: "o".into(),
            reaped: 2,
        });
    }
}
