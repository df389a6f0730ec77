//! Operator settings fixed for the lifetime of the process

use std::time::Duration;

use clap::ValueEnum;

/// Nominal pause between control-loop cycles
pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_secs(30);

/// Pause after a failed cycle
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Restarts issued per recovery episode before giving up
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Wait between issuing a restart and re-evaluating health
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(10);

/// Wait between failed recovery attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Port the LFR container serves `/health` on
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// What to do with `app=lfr` workloads that no desired source claims
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OrphanPolicy {
    /// Log and export a gauge, leave the workload alone
    #[default]
    Report,
    /// Delete the workload
    Delete,
}

/// Bounded-retry recovery timing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoverySettings {
    pub max_attempts: u32,
    pub settle_delay: Duration,
    pub retry_delay: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            settle_delay: DEFAULT_SETTLE_DELAY,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Endpoint probe parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeSettings {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_HEALTH_PORT,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Shape of the workloads the manager creates
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadSettings {
    /// Container image for the LFR container
    pub image: String,

    /// Container port serving `/health`
    pub health_port: u16,

    /// Per-member CPU request in millicores; also the utilization baseline
    pub cpu_request_millicores: u32,

    /// Per-member memory request (Kubernetes quantity)
    pub memory_request: String,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            image: "lmm-lfr:latest".to_string(),
            health_port: DEFAULT_HEALTH_PORT,
            cpu_request_millicores: 100,
            memory_request: "128Mi".to_string(),
        }
    }
}

/// Settings for the control loop and its collaborators
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerSettings {
    pub cycle_interval: Duration,
    pub error_backoff: Duration,

    /// Recovery tasks allowed to run at once
    pub max_concurrent_recoveries: usize,

    /// Average CPU, as a percentage of the request, that triggers a scale-up
    pub cpu_scale_threshold_percent: f64,

    pub orphan_policy: OrphanPolicy,
    pub recovery: RecoverySettings,
    pub probe: ProbeSettings,
    pub workload: WorkloadSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            cycle_interval: DEFAULT_CYCLE_INTERVAL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            max_concurrent_recoveries: 4,
            cpu_scale_threshold_percent: 80.0,
            orphan_policy: OrphanPolicy::default(),
            recovery: RecoverySettings::default(),
            probe: ProbeSettings::default(),
            workload: WorkloadSettings::default(),
        }
    }
}

impl ControllerSettings {
    /// Reject settings the control loop cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.recovery.max_attempts == 0 {
            return Err("max recovery attempts must be at least 1".to_string());
        }
        if self.max_concurrent_recoveries == 0 {
            return Err("max concurrent recoveries must be at least 1".to_string());
        }
        if self.workload.cpu_request_millicores == 0 {
            return Err("cpu request must be greater than 0".to_string());
        }
        let threshold = self.cpu_scale_threshold_percent;
        if threshold.is_nan() || threshold <= 0.0 {
            return Err("cpu scale threshold must be greater than 0".to_string());
        }
        if self.cycle_interval.is_zero() || self.error_backoff.is_zero() {
            return Err("cycle interval and error backoff must be non-zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_timing() {
        let settings = ControllerSettings::default();
        assert_eq!(settings.cycle_interval, Duration::from_secs(30));
        assert_eq!(settings.error_backoff, Duration::from_secs(60));
        assert_eq!(settings.recovery.max_attempts, 3);
        assert_eq!(settings.recovery.settle_delay, Duration::from_secs(10));
        assert_eq!(settings.recovery.retry_delay, Duration::from_secs(5));
        assert_eq!(settings.probe.port, 8080);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut settings = ControllerSettings::default();
        settings.recovery.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_nan_threshold_rejected() {
        let mut settings = ControllerSettings::default();
        settings.cpu_scale_threshold_percent = f64::NAN;
        assert!(settings.validate().is_err());
    }
}
