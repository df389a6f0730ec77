//! Central error types for the LFR manager
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Central error type for the LFR manager
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Desired-state document could not be parsed
    #[error("Invalid YAML configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Filesystem or socket error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A cluster call failed for a reason other than the transport
    #[error("Cluster API error during {operation} of {name}: {message}")]
    ClusterApi {
        operation: String,
        name: String,
        message: String,
    },

    /// Resource not found in the cluster
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// HTTP request error (from reqwest)
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Prometheus text encoding failed
    #[error("Failed to encode metrics: {0}")]
    MetricsEncodeError(#[from] std::fmt::Error),

    /// The operation was interrupted by shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// Recovery gave up after its attempt budget
    #[error("Recovery of {source_name} exhausted after {attempts} attempts")]
    RecoveryExhausted { source_name: String, attempts: u32 },
}

/// Result type alias for manager operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Build a [`Error::ClusterApi`] from any displayable cause
    pub fn cluster_api(
        operation: impl Into<String>,
        name: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Error::ClusterApi {
            operation: operation.into(),
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Convert to a human-readable message for logs
    pub fn status_message(&self) -> String {
        match self {
            Error::KubeError(e) => format!("Kubernetes error: {}", e),
            Error::ConfigError(msg) => format!("Invalid configuration: {}", msg),
            Error::ClusterApi {
                operation, name, ..
            } => format!("Failed to {} {}", operation, name),
            Error::HttpError(e) => format!("HTTP request failed: {}", e),
            Error::RecoveryExhausted {
                source_name,
                attempts,
            } => format!("Failed to recover {} after {} attempts", source_name, attempts),
            _ => self.to_string(),
        }
    }
}
