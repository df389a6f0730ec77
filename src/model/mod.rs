//! Data model for the LFR manager
//!
//! Desired log sources come from configuration; everything else in here is
//! rebuilt from the cluster every control-loop cycle.

mod log_source;
mod types;


pub use log_source::{DesiredState, LogSourceSpec, ReplicaBounds, WORKLOAD_PREFIX};
pub use types::*;
