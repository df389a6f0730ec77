//! Desired-state definitions for log sources
//!
//! A [`DesiredState`] is the declared configuration of which log sources
//! should run and at what minimum scale.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Maximum length of a Kubernetes object name that is a DNS-1123 label
const MAX_DNS_LABEL_LEN: usize = 63;

/// Prefix applied to every workload name derived from a source name
pub const WORKLOAD_PREFIX: &str = "lfr-";

/// The declared fleet of log sources for one namespace.
///
/// # Example
///
/// ```yaml
/// namespace: logging
/// log_sources:
///   - name: nginx
///     enabled: true
///     instances:
///       min: 2
///       max: 5
///   - name: legacy-app
///     enabled: false
///     instances:
///       min: 1
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DesiredState {
    /// Namespace all LFR workloads live in
    pub namespace: String,

    /// Declared log sources, in declaration order
    pub log_sources: Vec<LogSourceSpec>,
}

/// A single log source the fleet should (or should not) be reading.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LogSourceSpec {
    /// Unique key of the source; the workload is named `lfr-<name>`
    pub name: String,

    /// Whether a workload should exist for this source
    pub enabled: bool,

    /// Replica bounds
    pub instances: ReplicaBounds,
}

/// Replica bounds for a log source
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReplicaBounds {
    /// Replicas to create the workload with; also the scaling floor
    pub min: i32,

    /// Upper bound for scale-up; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i32>,
}

impl LogSourceSpec {
    pub fn new(name: impl Into<String>, enabled: bool, min: i32, max: Option<i32>) -> Self {
        Self {
            name: name.into(),
            enabled,
            instances: ReplicaBounds { min, max },
        }
    }

    pub fn min_replicas(&self) -> i32 {
        self.instances.min
    }

    pub fn max_replicas(&self) -> Option<i32> {
        self.instances.max
    }

    /// Whether `replicas` stays within the declared upper bound
    pub fn allows_replicas(&self, replicas: i32) -> bool {
        self.instances.max.map_or(true, |max| replicas <= max)
    }

    /// Validate a single source
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("log_sources[].name must not be empty".to_string());
        }
        if !is_dns_label(&format!("{}{}", WORKLOAD_PREFIX, self.name)) {
            return Err(format!(
                "log source name '{}' must be a lowercase DNS label of at most {} characters",
                self.name,
                MAX_DNS_LABEL_LEN - WORKLOAD_PREFIX.len()
            ));
        }
        if self.instances.min < 0 {
            return Err(format!(
                "log source '{}': instances.min must be >= 0",
                self.name
            ));
        }
        if let Some(max) = self.instances.max {
            if max < self.instances.min {
                return Err(format!(
                    "log source '{}': instances.max must be >= instances.min",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

impl DesiredState {
    /// Validate the whole document
    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.trim().is_empty() {
            return Err("namespace must not be empty".to_string());
        }
        if !is_dns_label(&self.namespace) {
            return Err(format!(
                "namespace '{}' is not a valid DNS label",
                self.namespace
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.log_sources {
            source.validate()?;
            if !seen.insert(source.name.as_str()) {
                return Err(format!("duplicate log source name '{}'", source.name));
            }
        }

        Ok(())
    }

    /// Sources that should currently be running
    pub fn enabled_sources(&self) -> impl Iterator<Item = &LogSourceSpec> {
        self.log_sources.iter().filter(|s| s.enabled)
    }
}

fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_DNS_LABEL_LEN {
        return false;
    }
    let valid_char = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-';
    bytes.iter().all(valid_char)
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
}
