//! Observability metrics for the state server.
//!
//! Metrics go through the `metrics` crate facade; the library installs no
//! exporter.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `lodestar_convergence_cycles_total` | Counter | `result` | Completed or aborted cycles |
//! | `lodestar_convergence_duration_seconds` | Histogram | - | Cycle wall time |
//! | `lodestar_convergence_work_total` | Counter | `kind` | Corrective work emitted |
//! | `lodestar_convergence_conflicts_total` | Counter | - | Mutations skipped on a stale tag |
//! | `lodestar_lrp_instances` | Gauge | `state` | Actual LRPs by state |
//! | `lodestar_tasks` | Gauge | `state` | Tasks by state |
//! | `lodestar_store_deadlock_retries_total` | Counter | `operation` | Retried transactions |
//! | `lodestar_hub_disconnects_total` | Counter | `hub` | Subscribers dropped on overflow |
//! | `lodestar_task_callbacks_total` | Counter | `result` | Completion callbacks |

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Convergence cycles by result.
    pub const CONVERGENCE_CYCLES_TOTAL: &str = "lodestar_convergence_cycles_total";
    /// Histogram: Convergence cycle duration in seconds.
    pub const CONVERGENCE_DURATION_SECONDS: &str = "lodestar_convergence_duration_seconds";
    /// Counter: Corrective work emitted by kind.
    pub const CONVERGENCE_WORK_TOTAL: &str = "lodestar_convergence_work_total";
    /// Counter: Convergence mutations skipped on conflict.
    pub const CONVERGENCE_CONFLICTS_TOTAL: &str = "lodestar_convergence_conflicts_total";
    /// Gauge: Actual LRPs by state.
    pub const LRP_INSTANCES: &str = "lodestar_lrp_instances";
    /// Gauge: Tasks by state.
    pub const TASKS: &str = "lodestar_tasks";
    /// Counter: Store transactions retried after a deadlock.
    pub const STORE_DEADLOCK_RETRIES_TOTAL: &str = "lodestar_store_deadlock_retries_total";
    /// Counter: Hub subscribers disconnected on overflow.
    pub const HUB_DISCONNECTS_TOTAL: &str = "lodestar_hub_disconnects_total";
    /// Counter: Task completion callbacks by result.
    pub const TASK_CALLBACKS_TOTAL: &str = "lodestar_task_callbacks_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Outcome (ok, aborted, delivered, failed).
    pub const RESULT: &str = "result";
    /// Work kind (`lrp_start`, `lrp_stop`, `task_dispatch`, ...).
    pub const KIND: &str = "kind";
    /// Record state.
    pub const STATE: &str = "state";
    /// Store operation name.
    pub const OPERATION: &str = "operation";
    /// Hub family.
    pub const HUB: &str = "hub";
}

/// High-level interface for recording state server metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateMetrics;

impl StateMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records the end of a convergence cycle.
    pub fn record_cycle(&self, result: &'static str, duration: Duration) {
        counter!(names::CONVERGENCE_CYCLES_TOTAL, labels::RESULT => result).increment(1);
        histogram!(names::CONVERGENCE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Adds emitted work of one kind.
    pub fn record_work(&self, kind: &'static str, count: usize) {
        if count > 0 {
            counter!(names::CONVERGENCE_WORK_TOTAL, labels::KIND => kind)
                .increment(count as u64);
        }
    }

    /// Adds mutations skipped because of a stale tag.
    pub fn record_conflicts(&self, count: usize) {
        if count > 0 {
            counter!(names::CONVERGENCE_CONFLICTS_TOTAL).increment(count as u64);
        }
    }

    /// Sets an actual LRP state gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_lrp_instances(&self, state: &'static str, count: u64) {
        gauge!(names::LRP_INSTANCES, labels::STATE => state).set(count as f64);
    }

    /// Sets a task state gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_tasks(&self, state: &'static str, count: u64) {
        gauge!(names::TASKS, labels::STATE => state).set(count as f64);
    }

    /// Records a deadlock retry.
    pub fn record_deadlock_retry(&self, operation: &'static str) {
        counter!(names::STORE_DEADLOCK_RETRIES_TOTAL, labels::OPERATION => operation)
            .increment(1);
    }

    /// Records a subscriber dropped on overflow.
    pub fn record_hub_disconnect(&self, hub: &'static str) {
        counter!(names::HUB_DISCONNECTS_TOTAL, labels::HUB => hub).increment(1);
    }

    /// Records a completion callback outcome.
    pub fn record_callback(&self, result: &'static str) {
        counter!(names::TASK_CALLBACKS_TOTAL, labels::RESULT => result).increment(1);
    }
}
