//! In-memory fakes of every capability the control loop depends on

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::metrics::MetricsSink;
use crate::cluster::{workload_name, ClusterStateClient, WorkloadPatch, WorkloadTemplate};
use crate::config::DesiredStateProvider;
use crate::error::{Error, Result};
use crate::model::{DesiredState, LogSourceSpec, Member, ObservedWorkload, ResourceUsage};
use crate::probe::EndpointProber;

pub fn desired(sources: Vec<LogSourceSpec>) -> DesiredState {
    DesiredState {
        namespace: "logging".to_string(),
        log_sources: sources,
    }
}

/// Extract `source=<name>` from a label selector
fn selected_source(selector: &str) -> Option<&str> {
    selector
        .split(',')
        .find_map(|part| part.trim().strip_prefix("source="))
}

#[derive(Default)]
struct ClusterState {
    workloads: BTreeMap<String, ObservedWorkload>,
    members: HashMap<String, Vec<Member>>,
    usage: HashMap<String, ResourceUsage>,
    failing: HashSet<String>,
    calls: Vec<String>,
    restarts: HashMap<String, usize>,
}

impl ClusterState {
    fn check(&mut self, operation: &str, source: &str) -> Result<()> {
        self.calls.push(format!("{}:{}", operation, source));
        if self.failing.contains(operation)
            || self.failing.contains(&format!("{}:{}", operation, source))
        {
            return Err(Error::cluster_api(operation, workload_name(source), "injected failure"));
        }
        Ok(())
    }
}

/// Cluster held in memory; created workloads are immediately fully available
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_workload(&self, source: &str, desired: i32, available: i32) {
        let mut state = self.state.lock().unwrap();
        state
            .workloads
            .insert(source.to_string(), ObservedWorkload::new(source, desired, available));
    }

    pub fn set_available(&self, source: &str, available: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(workload) = state.workloads.get_mut(source) {
            workload.available_replicas = available;
        }
    }

    pub fn set_members(&self, source: &str, members: Vec<Member>) {
        let mut state = self.state.lock().unwrap();
        state.members.insert(source.to_string(), members);
    }

    pub fn set_usage(&self, source: &str, usage: ResourceUsage) {
        let mut state = self.state.lock().unwrap();
        state.usage.insert(source.to_string(), usage);
    }

    /// Fail every call to `operation`, or only those for one source when
    /// given as `operation:source`
    pub fn fail(&self, key: &str) {
        self.state.lock().unwrap().failing.insert(key.to_string());
    }

    pub fn workload(&self, source: &str) -> Option<ObservedWorkload> {
        self.state.lock().unwrap().workloads.get(source).cloned()
    }

    pub fn restarts(&self, source: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.restarts.get(source).copied().unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl ClusterStateClient for FakeCluster {
    async fn create_workload(&self, template: &WorkloadTemplate) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("create", &template.source)?;
        state.workloads.insert(
            template.source.clone(),
            ObservedWorkload::new(&template.source, template.replicas, template.replicas),
        );
        Ok(())
    }

    async fn list_workloads(&self, _selector: &str) -> Result<Vec<ObservedWorkload>> {
        let mut state = self.state.lock().unwrap();
        state.check("list_workloads", "*")?;
        Ok(state.workloads.values().cloned().collect())
    }

    async fn get_workload(&self, source: &str) -> Result<Option<ObservedWorkload>> {
        let mut state = self.state.lock().unwrap();
        state.check("get", source)?;
        Ok(state.workloads.get(source).cloned())
    }

    async fn patch_workload(&self, source: &str, patch: &WorkloadPatch) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("patch", source)?;
        if !state.workloads.contains_key(source) {
            return Err(Error::NotFound {
                kind: "Deployment".to_string(),
                name: workload_name(source),
                namespace: "logging".to_string(),
            });
        }
        match patch {
            WorkloadPatch::Replicas(replicas) => {
                if let Some(workload) = state.workloads.get_mut(source) {
                    workload.desired_replicas = *replicas;
                }
            }
            WorkloadPatch::RestartedAt(_) => {
                *state.restarts.entry(source.to_string()).or_default() += 1;
            }
        }
        Ok(())
    }

    async fn delete_workload(&self, source: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("delete", source)?;
        state.workloads.remove(source);
        Ok(())
    }

    async fn list_members(&self, selector: &str) -> Result<Vec<Member>> {
        let source = selected_source(selector).unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();
        state.check("list_members", &source)?;
        Ok(state.members.get(&source).cloned().unwrap_or_default())
    }

    async fn sample_usage(&self, selector: &str) -> Result<Option<ResourceUsage>> {
        let source = selected_source(selector).unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();
        state.check("sample_usage", &source)?;
        Ok(state.usage.get(&source).copied())
    }
}

/// Prober answering from per-address scripts, then from a fixed map.
/// Unknown addresses are healthy.
#[derive(Default)]
pub struct FakeProber {
    scripts: Mutex<HashMap<String, VecDeque<bool>>>,
    fixed: Mutex<HashMap<String, bool>>,
    probed: Mutex<Vec<String>>,
    latency: Mutex<Duration>,
}

impl FakeProber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, address: &str, healthy: bool) {
        self.fixed
            .lock()
            .unwrap()
            .insert(address.to_string(), healthy);
    }

    /// Answers returned in order before falling back to [`FakeProber::set`]
    pub fn script(&self, address: &str, answers: &[bool]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(address.to_string(), answers.iter().copied().collect());
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }

    /// Delay every probe answer by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }
}

#[async_trait]
impl EndpointProber for FakeProber {
    async fn probe(&self, address: &str, _timeout: Duration) -> bool {
        self.probed.lock().unwrap().push(address.to_string());
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(address)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(answer) => answer,
            None => self
                .fixed
                .lock()
                .unwrap()
                .get(address)
                .copied()
                .unwrap_or(true),
        }
    }
}

/// Desired-state provider whose answer tests can swap between loads
pub struct FakeProvider {
    state: Mutex<Option<DesiredState>>,
    loads: Mutex<usize>,
}

impl FakeProvider {
    pub fn new(state: DesiredState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Some(state)),
            loads: Mutex::new(0),
        })
    }

    /// Provider whose every load fails
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            loads: Mutex::new(0),
        })
    }

    pub fn set(&self, state: Option<DesiredState>) {
        *self.state.lock().unwrap() = state;
    }

    pub fn loads(&self) -> usize {
        *self.loads.lock().unwrap()
    }
}

#[async_trait]
impl DesiredStateProvider for FakeProvider {
    async fn load(&self) -> Result<DesiredState> {
        *self.loads.lock().unwrap() += 1;
        self.state
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::ConfigError("Configuration file not found: fake".to_string()))
    }
}

fn metric_key(name: &str, labels: &[(&str, &str)]) -> String {
    let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}{{{}}}", name, labels.join(","))
}

/// Metrics sink that remembers every value it was given
#[derive(Default)]
pub struct RecordingMetrics {
    gauges: Mutex<HashMap<String, f64>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges
            .lock()
            .unwrap()
            .get(&metric_key(name, labels))
            .copied()
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(&metric_key(name, labels))
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsSink for RecordingMetrics {
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges
            .lock()
            .unwrap()
            .insert(metric_key(name, labels), value);
    }

    fn remove_gauge(&self, name: &str, labels: &[(&str, &str)]) {
        self.gauges.lock().unwrap().remove(&metric_key(name, labels));
    }

    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(metric_key(name, labels))
            .or_default() += 1;
    }
}
