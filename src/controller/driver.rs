//! The LFR control loop
//!
//! Every cycle reloads the desired state, reconciles the cluster against
//! it, evaluates the health of running sources and hands unhealthy ones to
//! recovery tasks. Recovery runs on a bounded pool so a stuck episode never
//! holds up the loop. Cancellation interrupts cluster reads and probes
//! mid-cycle, not just the sleep between cycles.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::health::HealthEvaluator;
use super::metrics::{
    MetricsSink, CONTROL_LOOP_CYCLES_TOTAL, CPU_USAGE_PERCENT, DEPLOYMENTS_TOTAL, HEALTH_STATUS,
    MEMORY_USAGE_BYTES,
};
use super::reconciler::{ApplySummary, ReconciliationEngine, UtilizationPolicy};
use super::remediation::{RecoveryEpisode, RecoveryOrchestrator, RecoveryOutcome};
use super::sleep_or_cancel;
use crate::cluster::{source_selector, ClusterStateClient, LFR_SELECTOR};
use crate::config::{ControllerSettings, DesiredStateProvider};
use crate::error::{Error, Result};
use crate::model::{Action, DesiredState, HealthVerdict, ObservedWorkload, ResourceUsage};
use crate::probe::EndpointProber;

/// Desired state, observations and the actions they call for
#[derive(Debug)]
pub struct CyclePlan {
    pub desired: DesiredState,
    pub observed: Vec<ObservedWorkload>,
    pub actions: Vec<Action>,
}

/// What one cycle did
#[derive(Debug, Default)]
pub struct CycleReport {
    pub actions: Vec<Action>,
    pub applied: ApplySummary,
    pub verdicts: Vec<HealthVerdict>,
    pub dispatched: Vec<String>,
}

/// Capabilities the control loop is built from
pub struct Collaborators {
    pub provider: Arc<dyn DesiredStateProvider>,
    pub cluster: Arc<dyn ClusterStateClient>,
    pub prober: Arc<dyn EndpointProber>,
    pub metrics: Arc<dyn MetricsSink>,
}

pub struct ControlLoopDriver {
    namespace: String,
    provider: Arc<dyn DesiredStateProvider>,
    cluster: Arc<dyn ClusterStateClient>,
    metrics: Arc<dyn MetricsSink>,
    engine: ReconciliationEngine,
    evaluator: Arc<HealthEvaluator>,
    recovery: Arc<RecoveryOrchestrator>,
    settings: ControllerSettings,
    pool: Arc<Semaphore>,
    tasks: JoinSet<RecoveryEpisode>,
    in_flight: HashMap<String, AbortHandle>,
    /// Sources that may have per-source gauge series
    reported: HashSet<String>,
}

impl ControlLoopDriver {
    /// Build a driver bound to `namespace`
    pub fn new(
        namespace: impl Into<String>,
        collaborators: Collaborators,
        settings: ControllerSettings,
    ) -> Self {
        let Collaborators {
            provider,
            cluster,
            prober,
            metrics,
        } = collaborators;

        let engine = ReconciliationEngine::new(
            cluster.clone(),
            metrics.clone(),
            settings.orphan_policy,
            settings.workload.clone(),
        );
        let evaluator = Arc::new(HealthEvaluator::new(
            cluster.clone(),
            prober,
            metrics.clone(),
            &settings.probe,
        ));
        let recovery = Arc::new(RecoveryOrchestrator::new(
            cluster.clone(),
            evaluator.clone(),
            metrics.clone(),
            settings.recovery.clone(),
        ));

        Self {
            namespace: namespace.into(),
            provider,
            cluster,
            metrics,
            engine,
            evaluator,
            recovery,
            pool: Arc::new(Semaphore::new(settings.max_concurrent_recoveries)),
            settings,
            tasks: JoinSet::new(),
            in_flight: HashMap::new(),
            reported: HashSet::new(),
        }
    }

    pub fn recovery(&self) -> &RecoveryOrchestrator {
        &self.recovery
    }

    /// Sources with a recovery task that has not been reaped yet
    pub fn in_flight(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.in_flight.keys().cloned().collect();
        sources.sort();
        sources
    }

    /// Run cycles until `cancel` fires, then wait for recovery tasks to stop
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            "Starting LFR control loop in namespace {} (interval {:?}, backoff {:?})",
            self.namespace, self.settings.cycle_interval, self.settings.error_backoff
        );

        while !cancel.is_cancelled() {
            let delay = match self.run_cycle(&cancel).await {
                Err(Error::Cancelled) => break,
                Ok(report) => {
                    self.metrics
                        .increment_counter(CONTROL_LOOP_CYCLES_TOTAL, &[("result", "ok")]);
                    debug!(
                        "Cycle finished: {} action(s), {} verdict(s), {} recovery task(s) started",
                        report.actions.len(),
                        report.verdicts.len(),
                        report.dispatched.len()
                    );
                    self.settings.cycle_interval
                }
                Err(e) => {
                    error!("Control loop cycle failed: {}", e.status_message());
                    self.metrics
                        .increment_counter(CONTROL_LOOP_CYCLES_TOTAL, &[("result", "error")]);
                    self.metrics.record_error("control_loop");
                    self.settings.error_backoff
                }
            };

            self.reap().await;

            if !sleep_or_cancel(&cancel, delay).await {
                break;
            }
        }

        self.shutdown().await;
        info!("LFR control loop stopped");
    }

    /// Load the desired state and observe the cluster, then plan actions
    /// without applying them
    pub async fn plan(&self) -> Result<CyclePlan> {
        let desired = self.provider.load().await?;
        if desired.namespace != self.namespace {
            return Err(Error::ConfigError(format!(
                "namespace changed from '{}' to '{}'; restart the manager to switch namespaces",
                self.namespace, desired.namespace
            )));
        }

        let observed = self.cluster.list_workloads(LFR_SELECTOR).await?;
        self.metrics
            .set_gauge(DEPLOYMENTS_TOTAL, &[], observed.len() as f64);

        let samples = self.sample_usage(&desired, &observed).await;
        let policy = UtilizationPolicy::new(
            self.settings.cpu_scale_threshold_percent,
            self.settings.workload.cpu_request_millicores,
        )
        .with_samples(samples);
        for source in desired.enabled_sources() {
            if let Some(percent) = policy.cpu_percent(&source.name) {
                self.metrics.set_gauge(
                    CPU_USAGE_PERCENT,
                    &[("source", source.name.as_str())],
                    percent,
                );
            }
        }

        let actions = self.engine.reconcile(&desired, &observed, &policy);
        Ok(CyclePlan {
            desired,
            observed,
            actions,
        })
    }

    /// Run a single cycle
    #[instrument(skip_all, fields(namespace = %self.namespace))]
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<CycleReport> {
        let plan = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            plan = self.plan() => plan?,
        };
        self.retire_gauges(&plan.desired);

        let applied = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            applied = self.engine.apply(&plan.actions) => applied,
        };

        let present: HashSet<&str> = plan.observed.iter().map(|w| w.name.as_str()).collect();
        let mut report = CycleReport {
            actions: plan.actions.clone(),
            applied,
            ..Default::default()
        };

        for spec in plan.desired.enabled_sources() {
            if !present.contains(spec.name.as_str()) {
                continue;
            }

            let verdict = match self.evaluator.evaluate(&spec.name, cancel).await {
                Ok(verdict) => verdict,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("Skipping health evaluation of {}: {}", spec.name, e);
                    self.metrics.record_error("health");
                    continue;
                }
            };

            if verdict.combined_healthy {
                self.recovery.mark_healthy(&spec.name).await;
            } else if self.dispatch(&spec.name, cancel).await {
                report.dispatched.push(spec.name.clone());
            }
            report.verdicts.push(verdict);
        }

        Ok(report)
    }

    /// Drop per-source gauge series of sources no longer enabled
    fn retire_gauges(&mut self, desired: &DesiredState) {
        let current: HashSet<String> = desired
            .enabled_sources()
            .map(|source| source.name.clone())
            .collect();
        for source in self.reported.difference(&current) {
            debug!("Removing gauges of {}", source);
            for gauge in [HEALTH_STATUS, CPU_USAGE_PERCENT, MEMORY_USAGE_BYTES] {
                self.metrics.remove_gauge(gauge, &[("source", source.as_str())]);
            }
        }
        self.reported = current;
    }

    async fn sample_usage(
        &self,
        desired: &DesiredState,
        observed: &[ObservedWorkload],
    ) -> HashMap<String, ResourceUsage> {
        let present: HashSet<&str> = observed.iter().map(|w| w.name.as_str()).collect();
        let mut samples = HashMap::new();

        for source in desired.enabled_sources() {
            if !present.contains(source.name.as_str()) {
                continue;
            }
            match self
                .cluster
                .sample_usage(&source_selector(&source.name))
                .await
            {
                Ok(Some(usage)) => {
                    self.metrics.set_gauge(
                        MEMORY_USAGE_BYTES,
                        &[("source", source.name.as_str())],
                        usage.memory_bytes,
                    );
                    samples.insert(source.name.clone(), usage);
                }
                Ok(None) => debug!("No usage sample for {}", source.name),
                Err(e) => debug!("Could not sample usage of {}: {}", source.name, e),
            }
        }

        samples
    }

    /// Start a recovery task for `source` unless one is already running
    async fn dispatch(&mut self, source: &str, cancel: &CancellationToken) -> bool {
        if self.in_flight.contains_key(source) {
            debug!("Recovery of {} already in progress", source);
            return false;
        }
        if !self.recovery.try_arm(source).await {
            debug!("Recovery of {} already armed", source);
            return false;
        }

        info!("Dispatching recovery for {}", source);
        let token = cancel.child_token();
        let pool = self.pool.clone();
        let recovery = self.recovery.clone();
        let name = source.to_string();

        let handle = self.tasks.spawn(async move {
            let permit = tokio::select! {
                _ = token.cancelled() => None,
                permit = pool.acquire_owned() => permit.ok(),
            };
            match permit {
                Some(_permit) => recovery.run(&name, token).await,
                None => recovery.abandon(&name).await,
            }
        });
        self.in_flight.insert(source.to_string(), handle);
        true
    }

    /// Collect finished recovery tasks
    pub async fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            match result {
                Ok(episode) => log_episode(&episode),
                Err(e) => {
                    error!("Recovery task failed: {}", e);
                    self.metrics.record_error("recovery");
                }
            }
        }

        let finished: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(source, _)| source.clone())
            .collect();
        for source in finished {
            self.in_flight.remove(&source);
            self.recovery.book().release(&source).await;
        }
    }

    async fn shutdown(&mut self) {
        if !self.tasks.is_empty() {
            info!("Waiting for {} recovery task(s) to stop", self.tasks.len());
        }
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(episode) => log_episode(&episode),
                Err(e) => {
                    error!("Recovery task failed: {}", e);
                    self.metrics.record_error("recovery");
                }
            }
        }
        self.in_flight.clear();
    }
}

fn log_episode(episode: &RecoveryEpisode) {
    match episode.outcome {
        RecoveryOutcome::Recovered | RecoveryOutcome::Cancelled => debug!(
            "Recovery of {} finished: {} after {} restart(s)",
            episode.source, episode.outcome, episode.restarts
        ),
        RecoveryOutcome::Exhausted => warn!(
            "Recovery of {} finished: {} after {} restart(s)",
            episode.source, episode.outcome, episode.restarts
        ),
    }
}
