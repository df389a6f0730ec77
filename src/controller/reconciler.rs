//! Desired-vs-observed reconciliation
//!
//! Planning is pure: [`plan_actions`] turns a desired state and the observed
//! workloads into at most one [`Action`] per source. [`ReconciliationEngine`]
//! wraps it with orphan reporting and executes the plan against the cluster.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use super::metrics::{MetricsSink, ORPHANED_WORKLOADS, RECONCILE_ACTIONS_TOTAL};
use crate::cluster::{ClusterStateClient, WorkloadPatch, WorkloadTemplate};
use crate::config::{OrphanPolicy, WorkloadSettings};
use crate::error::Result;
use crate::model::{Action, DesiredState, LogSourceSpec, ObservedWorkload, ResourceUsage};

/// Decides whether a present, enabled source should grow by one replica
pub trait ScalingPolicy: Send + Sync {
    fn needs_scale_up(&self, spec: &LogSourceSpec, observed: &ObservedWorkload) -> bool;
}

/// Never scales
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedReplicas;

impl ScalingPolicy for FixedReplicas {
    fn needs_scale_up(&self, _spec: &LogSourceSpec, _observed: &ObservedWorkload) -> bool {
        false
    }
}

/// Grows a workload that runs below its floor or whose average CPU per
/// member reaches `cpu_threshold_percent` of the per-member request
#[derive(Clone, Debug)]
pub struct UtilizationPolicy {
    cpu_threshold_percent: f64,
    cpu_request_millicores: f64,
    samples: HashMap<String, ResourceUsage>,
}

impl UtilizationPolicy {
    pub fn new(cpu_threshold_percent: f64, cpu_request_millicores: u32) -> Self {
        Self {
            cpu_threshold_percent,
            cpu_request_millicores: f64::from(cpu_request_millicores),
            samples: HashMap::new(),
        }
    }

    /// Replace the usage samples, keyed by source name
    pub fn with_samples(mut self, samples: HashMap<String, ResourceUsage>) -> Self {
        self.samples = samples;
        self
    }

    /// Sampled CPU for a source as a percentage of its request
    pub fn cpu_percent(&self, source: &str) -> Option<f64> {
        self.samples
            .get(source)
            .and_then(|usage| usage.cpu_percent_of(self.cpu_request_millicores))
    }
}

impl ScalingPolicy for UtilizationPolicy {
    fn needs_scale_up(&self, spec: &LogSourceSpec, observed: &ObservedWorkload) -> bool {
        if observed.desired_replicas < spec.min_replicas() {
            return true;
        }
        self.cpu_percent(&spec.name)
            .is_some_and(|percent| percent >= self.cpu_threshold_percent)
    }
}

/// Observed workloads with no declared source, in name order
pub fn find_orphans<'a>(
    desired: &DesiredState,
    observed: &'a [ObservedWorkload],
) -> Vec<&'a ObservedWorkload> {
    let declared: HashSet<&str> = desired.log_sources.iter().map(|s| s.name.as_str()).collect();
    let mut orphans: Vec<&ObservedWorkload> = observed
        .iter()
        .filter(|w| !declared.contains(w.name.as_str()))
        .collect();
    orphans.sort_by(|a, b| a.name.cmp(&b.name));
    orphans.dedup_by(|a, b| a.name == b.name);
    orphans
}

/// Compute the actions that bring `observed` in line with `desired`.
///
/// Desired sources come first in declaration order, then orphans by name.
pub fn plan_actions(
    desired: &DesiredState,
    observed: &[ObservedWorkload],
    policy: &dyn ScalingPolicy,
    orphan_policy: OrphanPolicy,
) -> Vec<Action> {
    let by_name: BTreeMap<&str, &ObservedWorkload> =
        observed.iter().map(|w| (w.name.as_str(), w)).collect();
    let mut seen = HashSet::new();
    let mut actions = Vec::new();

    for spec in &desired.log_sources {
        if !seen.insert(spec.name.as_str()) {
            continue;
        }

        let action = match (spec.enabled, by_name.get(spec.name.as_str())) {
            (true, None) => Some(Action::Create {
                name: spec.name.clone(),
                replicas: spec.min_replicas(),
            }),
            (true, Some(workload)) => {
                let next = workload.desired_replicas.saturating_add(1);
                if policy.needs_scale_up(spec, workload) && spec.allows_replicas(next) {
                    Some(Action::Scale {
                        name: spec.name.clone(),
                        replicas: next,
                    })
                } else {
                    None
                }
            }
            (false, Some(_)) => Some(Action::Delete {
                name: spec.name.clone(),
            }),
            (false, None) => None,
        };
        actions.extend(action);
    }

    if orphan_policy == OrphanPolicy::Delete {
        actions.extend(
            find_orphans(desired, observed)
                .into_iter()
                .map(|w| Action::Delete {
                    name: w.name.clone(),
                }),
        );
    }

    actions
}

/// Outcome counts of one `apply` call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: usize,
    pub failed: usize,
}

/// Plans and executes reconcile actions against the cluster
pub struct ReconciliationEngine {
    cluster: Arc<dyn ClusterStateClient>,
    metrics: Arc<dyn MetricsSink>,
    orphan_policy: OrphanPolicy,
    workload: WorkloadSettings,
}

impl ReconciliationEngine {
    pub fn new(
        cluster: Arc<dyn ClusterStateClient>,
        metrics: Arc<dyn MetricsSink>,
        orphan_policy: OrphanPolicy,
        workload: WorkloadSettings,
    ) -> Self {
        Self {
            cluster,
            metrics,
            orphan_policy,
            workload,
        }
    }

    /// Plan actions, reporting any orphaned workloads
    pub fn reconcile(
        &self,
        desired: &DesiredState,
        observed: &[ObservedWorkload],
        policy: &dyn ScalingPolicy,
    ) -> Vec<Action> {
        let orphans = find_orphans(desired, observed);
        self.metrics
            .set_gauge(ORPHANED_WORKLOADS, &[], orphans.len() as f64);
        if self.orphan_policy == OrphanPolicy::Report {
            for orphan in &orphans {
                warn!(
                    source = %orphan.name,
                    "LFR workload has no declared log source, leaving it in place"
                );
            }
        }

        plan_actions(desired, observed, policy, self.orphan_policy)
    }

    /// Execute actions in order; a failed action does not stop the rest
    #[instrument(skip(self, actions), fields(actions = actions.len()))]
    pub async fn apply(&self, actions: &[Action]) -> ApplySummary {
        let mut summary = ApplySummary::default();

        for action in actions {
            match self.execute(action).await {
                Ok(()) => {
                    info!("Applied {}", action);
                    summary.applied += 1;
                    self.metrics.increment_counter(
                        RECONCILE_ACTIONS_TOTAL,
                        &[("source", action.source()), ("action", action.kind())],
                    );
                }
                Err(e) => {
                    error!(source = %action.source(), "Failed to apply {}: {}", action, e);
                    summary.failed += 1;
                    self.metrics.record_error("reconciler");
                }
            }
        }

        summary
    }

    async fn execute(&self, action: &Action) -> Result<()> {
        match action {
            Action::Create { name, replicas } => {
                let template = WorkloadTemplate::new(name, *replicas, &self.workload);
                self.cluster.create_workload(&template).await
            }
            Action::Scale { name, replicas } => {
                self.cluster
                    .patch_workload(name, &WorkloadPatch::Replicas(*replicas))
                    .await
            }
            Action::Delete { name } => self.cluster.delete_workload(name).await,
        }
    }
}
