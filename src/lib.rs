//! LFR manager
//!
//! Keeps a fleet of log-file-reader (LFR) workloads on Kubernetes aligned
//! with a declared desired state, scales them on CPU pressure and restarts
//! unhealthy ones with a bounded number of attempts.
//!
//! The control loop in [`controller`] talks to the outside world only
//! through capability traits:
//!
//! - [`config::DesiredStateProvider`] for the declared log sources
//! - [`cluster::ClusterStateClient`] for workloads, members and usage
//! - [`probe::EndpointProber`] for member health endpoints
//! - [`controller::MetricsSink`] for counters and gauges

pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod probe;
pub mod rest_api;

pub use error::{Error, Result};
