use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::health::HealthEvaluator;
use super::metrics::HEALTH_STATUS;
use super::testing::{FakeCluster, FakeProber, RecordingMetrics};
use crate::config::ProbeSettings;
use crate::error::Error;
use crate::model::Member;

fn members(addresses: &[Option<&str>]) -> Vec<Member> {
    addresses
        .iter()
        .enumerate()
        .map(|(i, address)| Member::new(format!("lfr-app1-{}", i), *address))
        .collect()
}

fn evaluator(
    cluster: &Arc<FakeCluster>,
    prober: &Arc<FakeProber>,
    metrics: &Arc<RecordingMetrics>,
) -> HealthEvaluator {
    HealthEvaluator::new(
        cluster.clone(),
        prober.clone(),
        metrics.clone(),
        &ProbeSettings::default(),
    )
}

#[tokio::test]
async fn test_fully_available_with_healthy_probes() {
    let cluster = FakeCluster::new();
    cluster.add_workload("app1", 3, 3);
    cluster.set_members(
        "app1",
        members(&[Some("10.0.0.1"), Some("10.0.0.2"), Some("10.0.0.3")]),
    );
    let prober = FakeProber::new();
    let metrics = RecordingMetrics::new();

    let verdict = evaluator(&cluster, &prober, &metrics)
        .evaluate("app1", &CancellationToken::new())
        .await
        .unwrap();

    assert!(verdict.workload_healthy);
    assert!(verdict.endpoint_healthy);
    assert!(verdict.combined_healthy);
    assert_eq!(prober.probed().len(), 3);
    assert_eq!(metrics.gauge(HEALTH_STATUS, &[("source", "app1")]), Some(1.0));
}

#[tokio::test]
async fn test_partial_availability_is_unhealthy() {
    let cluster = FakeCluster::new();
    cluster.add_workload("app1", 3, 2);
    cluster.set_members("app1", members(&[Some("10.0.0.1"), Some("10.0.0.2")]));
    let prober = FakeProber::new();
    let metrics = RecordingMetrics::new();

    let verdict = evaluator(&cluster, &prober, &metrics)
        .evaluate("app1", &CancellationToken::new())
        .await
        .unwrap();

    assert!(!verdict.workload_healthy);
    assert!(verdict.endpoint_healthy);
    assert!(!verdict.combined_healthy);
    assert_eq!(metrics.gauge(HEALTH_STATUS, &[("source", "app1")]), Some(0.0));
}

#[tokio::test]
async fn test_every_member_is_probed_after_a_failure() {
    let cluster = FakeCluster::new();
    cluster.add_workload("app1", 3, 3);
    cluster.set_members(
        "app1",
        members(&[Some("10.0.0.1"), Some("10.0.0.2"), Some("10.0.0.3")]),
    );
    let prober = FakeProber::new();
    prober.set("10.0.0.1", false);

    let verdict = evaluator(&cluster, &prober, &RecordingMetrics::new())
        .evaluate("app1", &CancellationToken::new())
        .await
        .unwrap();

    assert!(verdict.workload_healthy);
    assert!(!verdict.endpoint_healthy);
    assert!(!verdict.combined_healthy);
    assert_eq!(prober.probed(), vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    assert!(verdict.message.contains("10.0.0.1"));
}

#[tokio::test]
async fn test_members_without_address_are_skipped() {
    let cluster = FakeCluster::new();
    cluster.add_workload("app1", 2, 2);
    cluster.set_members("app1", members(&[None, Some("10.0.0.2")]));
    let prober = FakeProber::new();

    let verdict = evaluator(&cluster, &prober, &RecordingMetrics::new())
        .evaluate("app1", &CancellationToken::new())
        .await
        .unwrap();

    assert!(verdict.combined_healthy);
    assert_eq!(prober.probed(), vec!["10.0.0.2"]);
}

#[tokio::test]
async fn test_missing_workload_is_fully_unhealthy() {
    let cluster = FakeCluster::new();
    let prober = FakeProber::new();

    let verdict = evaluator(&cluster, &prober, &RecordingMetrics::new())
        .evaluate("ghost", &CancellationToken::new())
        .await
        .unwrap();

    assert!(!verdict.workload_healthy);
    assert!(!verdict.endpoint_healthy);
    assert!(!verdict.combined_healthy);
    assert!(prober.probed().is_empty());
}

#[tokio::test]
async fn test_cluster_read_error_is_returned() {
    let cluster = FakeCluster::new();
    cluster.add_workload("app1", 1, 1);
    cluster.fail("list_members:app1");
    let metrics = RecordingMetrics::new();

    let result = evaluator(&cluster, &FakeProber::new(), &metrics)
        .evaluate("app1", &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::ClusterApi { .. })));
    assert_eq!(metrics.gauge(HEALTH_STATUS, &[("source", "app1")]), None);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_slow_probes() {
    let cluster = FakeCluster::new();
    cluster.add_workload("app1", 1, 1);
    cluster.set_members("app1", members(&[Some("10.0.0.1")]));
    let prober = FakeProber::new();
    prober.set_latency(Duration::from_secs(3600));
    let metrics = RecordingMetrics::new();
    let evaluator = evaluator(&cluster, &prober, &metrics);

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        })
    };

    let start = tokio::time::Instant::now();
    let result = evaluator.evaluate("app1", &cancel).await;
    canceller.await.unwrap();

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(prober.probed(), vec!["10.0.0.1"]);
    assert_eq!(metrics.gauge(HEALTH_STATUS, &[("source", "app1")]), None);
}
