//! Observed-state and control-loop types
//!
//! These types are produced fresh every cycle and shared between the
//! reconciler, the health evaluator and the recovery orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One running replica of a workload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Pod name
    pub name: String,

    /// Network address, if one has been assigned yet
    pub address: Option<String>,
}

impl Member {
    pub fn new(name: impl Into<String>, address: Option<&str>) -> Self {
        Self {
            name: name.into(),
            address: address.map(str::to_string),
        }
    }
}

/// The orchestrator's current view of an LFR workload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedWorkload {
    /// Source name (not the workload object name)
    pub name: String,

    /// Replicas the workload is asked to run
    pub desired_replicas: i32,

    /// Replicas currently available
    pub available_replicas: i32,

    /// Members in listing order; empty when members were not read
    #[serde(default)]
    pub members: Vec<Member>,
}

impl ObservedWorkload {
    pub fn new(name: impl Into<String>, desired_replicas: i32, available_replicas: i32) -> Self {
        Self {
            name: name.into(),
            desired_replicas,
            available_replicas: available_replicas.max(0),
            members: Vec::new(),
        }
    }

    /// Attach the member listing
    pub fn with_members(mut self, members: Vec<Member>) -> Self {
        self.members = members;
        self
    }

    /// Whether every requested replica is available
    pub fn is_fully_available(&self) -> bool {
        self.available_replicas == self.desired_replicas
    }

    /// Addresses of members that already have one, in member order
    pub fn member_addresses(&self) -> impl Iterator<Item = &str> {
        self.members.iter().filter_map(|m| m.address.as_deref())
    }
}

/// Per-source health verdict for one cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthVerdict {
    /// Source name
    pub source: String,

    /// Available replicas equal desired replicas
    pub workload_healthy: bool,

    /// Every addressed member answered its health probe
    pub endpoint_healthy: bool,

    /// `workload_healthy && endpoint_healthy`
    pub combined_healthy: bool,

    /// Human-readable explanation
    pub message: String,
}

impl HealthVerdict {
    pub fn new(
        source: impl Into<String>,
        workload_healthy: bool,
        endpoint_healthy: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            workload_healthy,
            endpoint_healthy,
            combined_healthy: workload_healthy && endpoint_healthy,
            message: message.into(),
        }
    }

    /// Verdict for a source whose workload does not exist
    pub fn missing(source: impl Into<String>) -> Self {
        Self::new(source, false, false, "Workload not found")
    }
}

/// Recovery state of a single source
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RecoveryState {
    /// No recovery in progress
    #[default]
    Healthy,
    /// Recovery in progress; `attempt` restarts issued so far
    Recovering { attempt: u32 },
    /// Attempt budget exhausted; waits for a fresh unhealthy verdict
    Failed,
}

impl RecoveryState {
    pub fn is_active(&self) -> bool {
        matches!(self, RecoveryState::Recovering { .. })
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryState::Healthy => write!(f, "Healthy"),
            RecoveryState::Recovering { attempt } => write!(f, "Recovering({})", attempt),
            RecoveryState::Failed => write!(f, "Failed"),
        }
    }
}

/// A single mutation the reconciler wants applied to the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Create { name: String, replicas: i32 },
    Scale { name: String, replicas: i32 },
    Delete { name: String },
}

impl Action {
    /// Source the action applies to
    pub fn source(&self) -> &str {
        match self {
            Action::Create { name, .. } | Action::Scale { name, .. } | Action::Delete { name } => {
                name
            }
        }
    }

    /// Short lowercase label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Create { .. } => "create",
            Action::Scale { .. } => "scale",
            Action::Delete { .. } => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create { name, replicas } => write!(f, "Create({}, {})", name, replicas),
            Action::Scale { name, replicas } => write!(f, "Scale({}, {})", name, replicas),
            Action::Delete { name } => write!(f, "Delete({})", name),
        }
    }
}

/// Resource usage summed over a workload's members
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResourceUsage {
    /// Total CPU in millicores
    pub cpu_millicores: f64,

    /// Total memory in bytes
    pub memory_bytes: f64,

    /// Members the sample covers
    pub members: u32,
}

impl ResourceUsage {
    /// Average CPU per member as a percentage of the per-member request
    pub fn cpu_percent_of(&self, request_millicores: f64) -> Option<f64> {
        if self.members == 0 || request_millicores <= 0.0 {
            return None;
        }
        Some(self.cpu_millicores / f64::from(self.members) / request_millicores * 100.0)
    }
}
