//! Bounded-retry recovery for unhealthy LFR workloads
//!
//! Each unhealthy source gets one recovery episode at a time:
//! 1. Restart the workload by stamping its pod template
//! 2. Wait for the restart to settle and re-evaluate health
//! 3. Retry after a short delay until the attempt budget is spent
//!
//! Episodes that run out of attempts leave the source `Failed` in the
//! in-memory [`RecoveryBook`] until a later cycle sees it again.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::health::HealthEvaluator;
use super::metrics::{MetricsSink, RECOVERY_ATTEMPTS_TOTAL, RECOVERY_OUTCOMES_TOTAL};
use super::sleep_or_cancel;
use crate::cluster::{ClusterStateClient, WorkloadPatch};
use crate::config::RecoverySettings;
use crate::error::Error;
use crate::model::RecoveryState;

/// How a recovery episode ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The source became healthy again
    Recovered,
    /// Every attempt was spent and the source is still unhealthy
    Exhausted,
    /// The episode was stopped before it finished
    Cancelled,
}

impl RecoveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryOutcome::Recovered => "recovered",
            RecoveryOutcome::Exhausted => "exhausted",
            RecoveryOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one recovery episode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryEpisode {
    pub source: String,

    /// States entered after arming, in order
    pub transitions: Vec<RecoveryState>,

    /// Restarts the cluster accepted
    pub restarts: u32,

    pub outcome: RecoveryOutcome,
}

impl RecoveryEpisode {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            transitions: Vec::new(),
            restarts: 0,
            outcome: RecoveryOutcome::Cancelled,
        }
    }
}

/// Per-source recovery state; a missing entry is `Healthy`
#[derive(Default)]
pub struct RecoveryBook {
    states: RwLock<HashMap<String, RecoveryState>>,
}

impl RecoveryBook {
    pub async fn state(&self, source: &str) -> RecoveryState {
        self.states
            .read()
            .await
            .get(source)
            .copied()
            .unwrap_or_default()
    }

    /// Move `source` to `Recovering{0}` unless an episode is already active
    pub async fn try_arm(&self, source: &str) -> bool {
        let mut states = self.states.write().await;
        let current = states.get(source).copied().unwrap_or_default();
        if current.is_active() {
            return false;
        }
        if current == RecoveryState::Failed {
            info!("Re-arming recovery for {} after a previous failure", source);
        }
        states.insert(source.to_string(), RecoveryState::Recovering { attempt: 0 });
        true
    }

    /// Reset a `Failed` source after a healthy verdict. Returns `true` when
    /// an entry was cleared.
    pub async fn mark_healthy(&self, source: &str) -> bool {
        let mut states = self.states.write().await;
        if states.get(source) == Some(&RecoveryState::Failed) {
            states.remove(source);
            info!("{} is healthy again, clearing failed recovery", source);
            return true;
        }
        false
    }

    /// Drop an entry that is still marked active
    pub async fn release(&self, source: &str) {
        let mut states = self.states.write().await;
        if states.get(source).is_some_and(RecoveryState::is_active) {
            warn!("Recovery of {} ended without a result, clearing it", source);
            states.remove(source);
        }
    }

    pub async fn snapshot(&self) -> BTreeMap<String, RecoveryState> {
        self.states
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    async fn set(&self, source: &str, state: RecoveryState) {
        let mut states = self.states.write().await;
        if state == RecoveryState::Healthy {
            states.remove(source);
        } else {
            states.insert(source.to_string(), state);
        }
    }
}

/// Runs recovery episodes for unhealthy sources
pub struct RecoveryOrchestrator {
    cluster: Arc<dyn ClusterStateClient>,
    evaluator: Arc<HealthEvaluator>,
    metrics: Arc<dyn MetricsSink>,
    settings: RecoverySettings,
    book: RecoveryBook,
}

impl RecoveryOrchestrator {
    pub fn new(
        cluster: Arc<dyn ClusterStateClient>,
        evaluator: Arc<HealthEvaluator>,
        metrics: Arc<dyn MetricsSink>,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            cluster,
            evaluator,
            metrics,
            settings,
            book: RecoveryBook::default(),
        }
    }

    pub fn book(&self) -> &RecoveryBook {
        &self.book
    }

    pub async fn try_arm(&self, source: &str) -> bool {
        self.book.try_arm(source).await
    }

    pub async fn mark_healthy(&self, source: &str) -> bool {
        self.book.mark_healthy(source).await
    }

    /// Run one episode for `source` until it recovers, exhausts its
    /// attempts or `cancel` fires
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, source: &str, cancel: CancellationToken) -> RecoveryEpisode {
        let mut episode = RecoveryEpisode::new(source);
        let max_attempts = self.settings.max_attempts;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return self.cancelled(episode).await;
            }

            let state = RecoveryState::Recovering { attempt };
            self.book.set(source, state).await;
            episode.transitions.push(state);

            info!("Recovery attempt {}/{} for {}", attempt, max_attempts, source);
            self.metrics
                .increment_counter(RECOVERY_ATTEMPTS_TOTAL, &[("source", source)]);

            let patch = WorkloadPatch::RestartedAt(Utc::now());
            let restart = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(episode).await,
                result = self.cluster.patch_workload(source, &patch) => result,
            };
            let restarted = match restart {
                Ok(()) => {
                    episode.restarts += 1;
                    true
                }
                Err(e) => {
                    warn!("Restart of {} failed: {}", source, e);
                    self.metrics.record_error("recovery");
                    false
                }
            };

            if restarted {
                if !sleep_or_cancel(&cancel, self.settings.settle_delay).await {
                    return self.cancelled(episode).await;
                }

                match self.evaluator.evaluate(source, &cancel).await {
                    Ok(verdict) if verdict.combined_healthy => {
                        info!("{} recovered after {} attempt(s)", source, attempt);
                        self.book.set(source, RecoveryState::Healthy).await;
                        episode.transitions.push(RecoveryState::Healthy);
                        return self.finish(episode, RecoveryOutcome::Recovered);
                    }
                    Ok(verdict) => {
                        debug!("{} still unhealthy: {}", source, verdict.message);
                    }
                    Err(Error::Cancelled) => return self.cancelled(episode).await,
                    Err(e) => {
                        warn!("Health re-check of {} failed: {}", source, e);
                    }
                }
            }

            if attempt < max_attempts
                && !sleep_or_cancel(&cancel, self.settings.retry_delay).await
            {
                return self.cancelled(episode).await;
            }
        }

        let exhausted = Error::RecoveryExhausted {
            source_name: source.to_string(),
            attempts: max_attempts,
        };
        error!("{}", exhausted.status_message());
        self.metrics.record_error("recovery");
        self.book.set(source, RecoveryState::Failed).await;
        episode.transitions.push(RecoveryState::Failed);
        self.finish(episode, RecoveryOutcome::Exhausted)
    }

    /// Close out an armed episode that never got to run
    pub async fn abandon(&self, source: &str) -> RecoveryEpisode {
        self.cancelled(RecoveryEpisode::new(source)).await
    }

    async fn cancelled(&self, episode: RecoveryEpisode) -> RecoveryEpisode {
        info!("Recovery of {} cancelled", episode.source);
        self.book.set(&episode.source, RecoveryState::Healthy).await;
        self.finish(episode, RecoveryOutcome::Cancelled)
    }

    fn finish(&self, mut episode: RecoveryEpisode, outcome: RecoveryOutcome) -> RecoveryEpisode {
        episode.outcome = outcome;
        self.metrics.increment_counter(
            RECOVERY_OUTCOMES_TOTAL,
            &[("source", episode.source.as_str()), ("outcome", outcome.as_str())],
        );
        episode
    }
}
