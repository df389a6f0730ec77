//! Cluster access for LFR workloads
//!
//! [`ClusterStateClient`] is the only way the control loop reads or mutates
//! the cluster. [`KubeClusterClient`] implements it against Deployments and
//! Pods in a single namespace.

mod kubernetes;
mod quantity;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::WorkloadSettings;
use crate::error::Result;
use crate::model::{Member, ObservedWorkload, ResourceUsage, WORKLOAD_PREFIX};

pub use kubernetes::KubeClusterClient;
pub use quantity::{parse_cpu_millicores, parse_memory_bytes};

/// Label shared by every LFR workload and pod
pub const APP_LABEL: &str = "app";
pub const APP_LABEL_VALUE: &str = "lfr";

/// Label carrying the log source name
pub const SOURCE_LABEL: &str = "source";

/// Selector matching every LFR workload
pub const LFR_SELECTOR: &str = "app=lfr";

/// Pod-template annotation bumped to force a rolling restart
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Workload object name for a source
pub fn workload_name(source: &str) -> String {
    format!("{}{}", WORKLOAD_PREFIX, source)
}

/// Selector matching the workload and pods of one source
pub fn source_selector(source: &str) -> String {
    format!("{}={},{}={}", APP_LABEL, APP_LABEL_VALUE, SOURCE_LABEL, source)
}

/// Labels stamped on a source's workload and pod template
pub fn source_labels(source: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), APP_LABEL_VALUE.to_string());
    labels.insert(SOURCE_LABEL.to_string(), source.to_string());
    labels
}

/// Everything needed to create a workload for a source
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadTemplate {
    pub source: String,
    pub replicas: i32,
    pub image: String,
    pub health_port: u16,
    pub cpu_request_millicores: u32,
    pub memory_request: String,
}

impl WorkloadTemplate {
    pub fn new(source: &str, replicas: i32, settings: &WorkloadSettings) -> Self {
        Self {
            source: source.to_string(),
            replicas,
            image: settings.image.clone(),
            health_port: settings.health_port,
            cpu_request_millicores: settings.cpu_request_millicores,
            memory_request: settings.memory_request.clone(),
        }
    }
}

/// Typed mutations applied to an existing workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadPatch {
    /// Set the replica count
    Replicas(i32),
    /// Stamp the restart annotation, forcing a rolling restart
    RestartedAt(DateTime<Utc>),
}

impl WorkloadPatch {
    /// Render as a JSON merge patch for a Deployment
    pub fn to_merge_patch(&self) -> serde_json::Value {
        match self {
            WorkloadPatch::Replicas(replicas) => serde_json::json!({
                "spec": { "replicas": replicas }
            }),
            WorkloadPatch::RestartedAt(time) => serde_json::json!({
                "spec": {
                    "template": {
                        "metadata": {
                            "annotations": {
                                RESTARTED_AT_ANNOTATION: time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
                            }
                        }
                    }
                }
            }),
        }
    }
}

/// Capability surface the control loop needs from the orchestrator.
///
/// Workloads are addressed by source name; implementations map that to
/// their own object names. Calls are made sequentially from the control
/// loop and concurrently from recovery tasks.
#[async_trait]
pub trait ClusterStateClient: Send + Sync {
    /// Create the workload described by `template`
    async fn create_workload(&self, template: &WorkloadTemplate) -> Result<()>;

    /// List workloads matching `selector`, without members
    async fn list_workloads(&self, selector: &str) -> Result<Vec<ObservedWorkload>>;

    /// Read a single workload by source name, without members
    async fn get_workload(&self, source: &str) -> Result<Option<ObservedWorkload>>;

    /// Apply a patch to a source's workload
    async fn patch_workload(&self, source: &str, patch: &WorkloadPatch) -> Result<()>;

    /// Delete a source's workload
    async fn delete_workload(&self, source: &str) -> Result<()>;

    /// List member processes matching `selector`
    async fn list_members(&self, selector: &str) -> Result<Vec<Member>>;

    /// Sum current resource usage of members matching `selector`
    async fn sample_usage(&self, selector: &str) -> Result<Option<ResourceUsage>>;
}
