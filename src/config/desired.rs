//! Desired-state loading
//!
//! The desired state is a YAML document of the form
//!
//! ```yaml
//! namespace: logging
//! log_sources:
//!   - name: nginx
//!     enabled: true
//!     instances: { min: 2, max: 5 }
//! ```
//!
//! `kubernetes.namespace` is accepted in place of a top-level `namespace`.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{DesiredState, LogSourceSpec};

/// Source of the declared fleet, re-read at the start of every cycle
#[async_trait]
pub trait DesiredStateProvider: Send + Sync {
    /// Load and validate the current desired state
    async fn load(&self) -> Result<DesiredState>;
}

/// Reads the desired state from a YAML file on disk
#[derive(Debug, Clone)]
pub struct FileDesiredStateProvider {
    path: PathBuf,
}

impl FileDesiredStateProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DesiredStateProvider for FileDesiredStateProvider {
    async fn load(&self) -> Result<DesiredState> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ConfigError(format!(
                    "Configuration file not found: {}",
                    self.path.display()
                )));
            }
            Err(e) => return Err(Error::IoError(e)),
        };

        let state = parse_desired_state(&raw)?;
        debug!(
            "Loaded desired state from {}: {} source(s) in namespace {}",
            self.path.display(),
            state.log_sources.len(),
            state.namespace
        );
        Ok(state)
    }
}

#[derive(Debug, Deserialize)]
struct RawDesiredState {
    namespace: Option<String>,
    kubernetes: Option<RawKubernetesSection>,
    log_sources: Option<Vec<LogSourceSpec>>,
}

#[derive(Debug, Deserialize)]
struct RawKubernetesSection {
    namespace: Option<String>,
}

/// Parse and validate a desired-state document
pub fn parse_desired_state(raw: &str) -> Result<DesiredState> {
    let raw: RawDesiredState = serde_yaml::from_str(raw)?;

    let namespace = raw
        .namespace
        .or_else(|| raw.kubernetes.and_then(|k| k.namespace))
        .ok_or_else(|| Error::ConfigError("Missing required field: namespace".to_string()))?;

    let log_sources = raw
        .log_sources
        .ok_or_else(|| Error::ConfigError("Missing required field: log_sources".to_string()))?;

    let state = DesiredState {
        namespace,
        log_sources,
    };
    state.validate().map_err(Error::ConfigError)?;

    Ok(state)
}
