//! Controller module for the LFR control loop
//!
//! This module contains the control loop, reconciliation logic, health
//! evaluation and bounded-retry recovery for LFR workloads.

mod driver;
mod health;
#[cfg(test)]
mod health_test;
pub mod metrics;
mod reconciler;
mod remediation;
#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use driver::{Collaborators, ControlLoopDriver, CyclePlan, CycleReport};
pub use health::HealthEvaluator;
pub use metrics::{MetricsSink, PrometheusMetrics};
pub use reconciler::{
    find_orphans, plan_actions, ApplySummary, FixedReplicas, ReconciliationEngine, ScalingPolicy,
    UtilizationPolicy,
};
pub use remediation::{RecoveryBook, RecoveryEpisode, RecoveryOrchestrator, RecoveryOutcome};

/// Sleep for `delay` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
