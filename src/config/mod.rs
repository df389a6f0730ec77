//! Configuration for the LFR manager
//!
//! Two layers: the desired-state document (which log sources to run), re-read
//! every cycle, and the operator [`ControllerSettings`] fixed at startup.

mod desired;
mod settings;

pub use desired::{parse_desired_state, DesiredStateProvider, FileDesiredStateProvider};
pub use settings::{ControllerSettings, OrphanPolicy, ProbeSettings, RecoverySettings, WorkloadSettings};
