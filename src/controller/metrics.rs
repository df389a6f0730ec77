//! Prometheus metrics for the LFR manager
//!
//! Components receive an `Arc<dyn MetricsSink>` at construction and never
//! touch a global registry. [`PrometheusMetrics`] is the production sink;
//! it owns the registry that the `/metrics` endpoint encodes.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::warn;

use crate::error::Result;

/// Number of LFR workloads observed at the start of the cycle
pub const DEPLOYMENTS_TOTAL: &str = "lmm_lfr_deployments_total";
/// Health of each source (1 = healthy, 0 = unhealthy)
pub const HEALTH_STATUS: &str = "lmm_lfr_health_status";
/// Average CPU per member as a percentage of its request
pub const CPU_USAGE_PERCENT: &str = "lmm_lfr_cpu_usage_percent";
/// Memory used by all members of a source
pub const MEMORY_USAGE_BYTES: &str = "lmm_lfr_memory_usage_bytes";
/// LFR workloads with no desired source
pub const ORPHANED_WORKLOADS: &str = "lmm_lfr_orphaned_workloads";

/// Error-level events per component
pub const ERRORS_TOTAL: &str = "lmm_errors_total";
/// Reconcile actions applied, by source and action kind
pub const RECONCILE_ACTIONS_TOTAL: &str = "lmm_reconcile_actions_total";
/// Restarts issued by recovery
pub const RECOVERY_ATTEMPTS_TOTAL: &str = "lmm_recovery_attempts_total";
/// Finished recovery episodes, by outcome
pub const RECOVERY_OUTCOMES_TOTAL: &str = "lmm_recovery_outcomes_total";
/// Control-loop cycles, by result
pub const CONTROL_LOOP_CYCLES_TOTAL: &str = "lmm_control_loop_cycles_total";

const GAUGES: [(&str, &str); 5] = [
    (DEPLOYMENTS_TOTAL, "Number of LFR deployments"),
    (
        HEALTH_STATUS,
        "Health status of LFR deployments (1=healthy, 0=unhealthy)",
    ),
    (
        CPU_USAGE_PERCENT,
        "CPU usage percentage per LFR deployment",
    ),
    (
        MEMORY_USAGE_BYTES,
        "Memory usage in bytes per LFR deployment",
    ),
    (
        ORPHANED_WORKLOADS,
        "LFR deployments not declared in the desired state",
    ),
];

const COUNTERS: [(&str, &str); 5] = [
    (ERRORS_TOTAL, "Total number of errors"),
    (RECONCILE_ACTIONS_TOTAL, "Reconcile actions applied"),
    (RECOVERY_ATTEMPTS_TOTAL, "Recovery restarts issued"),
    (RECOVERY_OUTCOMES_TOTAL, "Recovery episodes finished"),
    (CONTROL_LOOP_CYCLES_TOTAL, "Control loop cycles run"),
];

/// Counter and gauge sink the core reports into
pub trait MetricsSink: Send + Sync {
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);

    /// Stop exposing one labelled series of a gauge
    fn remove_gauge(&self, name: &str, labels: &[(&str, &str)]);

    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Count an error-level event for `component`
    fn record_error(&self, component: &str) {
        self.increment_counter(ERRORS_TOTAL, &[("component", component)]);
    }
}

type LabelSet = Vec<(String, String)>;

fn label_set(labels: &[(&str, &str)]) -> LabelSet {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Registry-backed sink exposing every metric the manager emits
pub struct PrometheusMetrics {
    registry: Registry,
    gauges: HashMap<&'static str, Family<LabelSet, Gauge<f64, AtomicU64>>>,
    counters: HashMap<&'static str, Family<LabelSet, Counter>>,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let mut gauges = HashMap::new();
        let mut counters = HashMap::new();

        for (name, help) in GAUGES {
            let family = Family::<LabelSet, Gauge<f64, AtomicU64>>::default();
            registry.register(name, help, family.clone());
            gauges.insert(name, family);
        }

        // The text encoder appends `_total` to counters itself
        for (name, help) in COUNTERS {
            let family = Family::<LabelSet, Counter>::default();
            let base = name.strip_suffix("_total").unwrap_or(name);
            registry.register(base, help, family.clone());
            counters.insert(name, family);
        }

        Self {
            registry,
            gauges,
            counters,
        }
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        match self.gauges.get(name) {
            Some(family) => {
                family.get_or_create(&label_set(labels)).set(value);
            }
            None => warn!("Metric {} is not a gauge or does not exist.", name),
        }
    }

    fn remove_gauge(&self, name: &str, labels: &[(&str, &str)]) {
        if let Some(family) = self.gauges.get(name) {
            family.remove(&label_set(labels));
        }
    }

    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        match self.counters.get(name) {
            Some(family) => {
                family.get_or_create(&label_set(labels)).inc();
            }
            None => warn!("Metric {} not found.", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Value of the first sample line starting with `prefix`
    fn sample(text: &str, prefix: &str) -> Option<f64> {
        text.lines()
            .filter(|line| !line.starts_with('#'))
            .find(|line| line.starts_with(prefix))
            .and_then(|line| line.rsplit(' ').next())
            .and_then(|value| value.parse().ok())
    }

    #[test]
    fn test_gauges_are_exposed() {
        let metrics = PrometheusMetrics::new();
        metrics.set_gauge(DEPLOYMENTS_TOTAL, &[], 3.0);
        metrics.set_gauge(HEALTH_STATUS, &[("source", "nginx")], 1.0);

        let text = metrics.encode().unwrap();
        assert!(text.contains("# TYPE lmm_lfr_deployments_total gauge"));
        assert_eq!(sample(&text, "lmm_lfr_deployments_total"), Some(3.0));
        assert_eq!(
            sample(&text, "lmm_lfr_health_status{source=\"nginx\"}"),
            Some(1.0)
        );
    }

    #[test]
    fn test_counters_keep_total_suffix() {
        let metrics = PrometheusMetrics::new();
        metrics.record_error("reconciler");
        metrics.record_error("reconciler");

        let text = metrics.encode().unwrap();
        assert_eq!(
            sample(&text, "lmm_errors_total{component=\"reconciler\"}"),
            Some(2.0)
        );
        assert!(!text.contains("lmm_errors_total_total"));
    }

    #[test]
    fn test_removed_gauge_series_is_no_longer_exposed() {
        let metrics = PrometheusMetrics::new();
        metrics.set_gauge(HEALTH_STATUS, &[("source", "nginx")], 1.0);
        metrics.set_gauge(HEALTH_STATUS, &[("source", "app1")], 0.0);

        metrics.remove_gauge(HEALTH_STATUS, &[("source", "nginx")]);
        metrics.remove_gauge("lmm_unknown", &[("source", "nginx")]);

        let text = metrics.encode().unwrap();
        assert_eq!(sample(&text, "lmm_lfr_health_status{source=\"nginx\"}"), None);
        assert_eq!(
            sample(&text, "lmm_lfr_health_status{source=\"app1\"}"),
            Some(0.0)
        );
    }

    #[test]
    fn test_unknown_metric_is_dropped() {
        let metrics = PrometheusMetrics::new();
        metrics.set_gauge("lmm_unknown", &[], 1.0);
        metrics.increment_counter(HEALTH_STATUS, &[]);

        let text = metrics.encode().unwrap();
        assert!(!text.contains("lmm_unknown"));
        assert_eq!(sample(&text, "lmm_lfr_health_status"), None);
    }
}
