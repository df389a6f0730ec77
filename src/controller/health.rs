//! Health evaluation for LFR workloads
//!
//! A source is healthy when two independent checks pass:
//!
//! - **Workload**: available replicas exactly equal desired replicas
//! - **Endpoints**: every member with an assigned address answers its
//!   `/health` probe
//!
//! Members still waiting for an address are skipped. Every addressed member
//! is probed, even after one fails, so the logs name each failing member.
//!
//! # Health Verdict
//!
//! Returns a [`HealthVerdict`] whose `combined_healthy` is the AND of the
//! two halves. Cluster read failures are returned as errors rather than
//! folded into the verdict. Cancellation interrupts the reads and probes and
//! returns [`Error::Cancelled`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::metrics::{MetricsSink, HEALTH_STATUS};
use crate::cluster::{source_selector, workload_name, ClusterStateClient};
use crate::config::ProbeSettings;
use crate::error::{Error, Result};
use crate::model::{HealthVerdict, ObservedWorkload};
use crate::probe::EndpointProber;

/// Combines workload readiness and endpoint probes into a verdict
pub struct HealthEvaluator {
    cluster: Arc<dyn ClusterStateClient>,
    prober: Arc<dyn EndpointProber>,
    metrics: Arc<dyn MetricsSink>,
    probe_timeout: Duration,
}

impl HealthEvaluator {
    pub fn new(
        cluster: Arc<dyn ClusterStateClient>,
        prober: Arc<dyn EndpointProber>,
        metrics: Arc<dyn MetricsSink>,
        settings: &ProbeSettings,
    ) -> Self {
        Self {
            cluster,
            prober,
            metrics,
            probe_timeout: settings.timeout,
        }
    }

    /// Evaluate the current health of `source`, giving up when `cancel` fires
    #[instrument(skip(self, cancel))]
    pub async fn evaluate(
        &self,
        source: &str,
        cancel: &CancellationToken,
    ) -> Result<HealthVerdict> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            verdict = self.evaluate_now(source) => verdict,
        }
    }

    async fn evaluate_now(&self, source: &str) -> Result<HealthVerdict> {
        let verdict = match self.observe(source).await? {
            Some(workload) => self.judge(&workload).await,
            None => {
                warn!("Workload {} not found", workload_name(source));
                HealthVerdict::missing(source)
            }
        };

        debug!(
            workload_healthy = verdict.workload_healthy,
            endpoint_healthy = verdict.endpoint_healthy,
            "{}",
            verdict.message
        );
        let status = if verdict.combined_healthy { 1.0 } else { 0.0 };
        self.metrics
            .set_gauge(HEALTH_STATUS, &[("source", source)], status);

        Ok(verdict)
    }

    /// Fresh view of the workload with its members
    async fn observe(&self, source: &str) -> Result<Option<ObservedWorkload>> {
        let Some(workload) = self
            .cluster
            .get_workload(source)
            .await
            .map_err(|e| cluster_error("get", source, e))?
        else {
            return Ok(None);
        };

        let members = self
            .cluster
            .list_members(&source_selector(source))
            .await
            .map_err(|e| cluster_error("list members of", source, e))?;

        Ok(Some(workload.with_members(members)))
    }

    async fn judge(&self, workload: &ObservedWorkload) -> HealthVerdict {
        let workload_healthy = workload.is_fully_available();

        let addresses: Vec<&str> = workload.member_addresses().collect();
        let skipped = workload.members.len() - addresses.len();
        if skipped > 0 {
            debug!("{} member(s) of {} have no address yet", skipped, workload.name);
        }

        let results = join_all(
            addresses
                .iter()
                .map(|address| self.prober.probe(address, self.probe_timeout)),
        )
        .await;

        let mut failing = Vec::new();
        for (address, healthy) in addresses.iter().zip(results) {
            if !healthy {
                warn!("Member {} of {} failed its health probe", address, workload.name);
                failing.push(*address);
            }
        }
        let endpoint_healthy = failing.is_empty();

        let message = match (workload_healthy, endpoint_healthy) {
            (true, true) => format!(
                "{}/{} replicas available, all endpoints healthy",
                workload.available_replicas, workload.desired_replicas
            ),
            (false, true) => format!(
                "Only {}/{} replicas available",
                workload.available_replicas, workload.desired_replicas
            ),
            (_, false) => format!(
                "{}/{} replicas available, unhealthy endpoints: {}",
                workload.available_replicas,
                workload.desired_replicas,
                failing.join(", ")
            ),
        };

        HealthVerdict::new(&workload.name, workload_healthy, endpoint_healthy, message)
    }
}

fn cluster_error(operation: &str, source: &str, err: Error) -> Error {
    match err {
        Error::ClusterApi { .. } => err,
        other => Error::cluster_api(operation, workload_name(source), other),
    }
}
