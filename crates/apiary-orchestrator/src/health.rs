//! Provider health guard.
//!
//! TTL-cached liveness probing per provider, independent of the circuit
//! breaker (this tracks liveness pings, not inference-call failures). A
//! provider is excluded from routing only once it is DEAD; a single slow or
//! failed probe keeps it routable as DEGRADED.

use crate::transport::HealthProber;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Health classification for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Probe succeeded within the latency threshold.
    Healthy,
    /// Probe slow or recently failed, but still routable.
    Degraded,
    /// Consecutive failures reached the threshold; excluded from routing.
    Dead,
}

/// Cached health record for one provider. Lazily created, TTL-refreshed.
#[derive(Debug, Clone)]
struct HealthScore {
    up: bool,
    latency: Duration,
    last_checked: Instant,
    failures: u32,
    status: HealthStatus,
}

/// Telemetry snapshot of one provider's health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Whether the last probe succeeded.
    pub up: bool,
    /// Status label.
    pub status: HealthStatus,
    /// Last probe round-trip in milliseconds.
    pub latency_ms: u64,
    /// Consecutive probe failures.
    pub failures: u32,
}

/// TTL-cached provider liveness guard.
pub struct HealthGuard {
    prober: Arc<dyn HealthProber>,
    scores: Arc<RwLock<HashMap<String, HealthScore>>>,
    /// How long a probe result stays trusted (default 60s).
    cache_ttl: Duration,
    /// Probe latency above this is DEGRADED (default 1000ms).
    degraded_latency: Duration,
    /// Consecutive failures before DEAD (default 2).
    dead_threshold: u32,
}

impl HealthGuard {
    /// Creates a guard with default settings.
    ///
    /// Defaults:
    /// - Cache TTL: 60 seconds
    /// - Degraded latency threshold: 1000ms
    /// - Dead threshold: 2 consecutive failures
    #[must_use]
    pub fn new(prober: Arc<dyn HealthProber>) -> Self {
        Self::with_settings(prober, Duration::from_secs(60), Duration::from_millis(1000), 2)
    }

    /// Creates a guard with custom settings.
    ///
    /// # Arguments
    /// * `cache_ttl` - How long a probe result stays trusted
    /// * `degraded_latency` - Latency above which a success is DEGRADED
    /// * `dead_threshold` - Consecutive failures before DEAD
    #[must_use]
    pub fn with_settings(
        prober: Arc<dyn HealthProber>,
        cache_ttl: Duration,
        degraded_latency: Duration,
        dead_threshold: u32,
    ) -> Self {
        Self {
            prober,
            scores: Arc::new(RwLock::new(HashMap::new())),
            cache_ttl,
            degraded_latency,
            dead_threshold,
        }
    }

    /// Verifies a set of providers, returning usability per provider
    /// (`true` = routable). Cached entries fresher than the TTL are trusted
    /// without a probe; the rest are probed concurrently and the call
    /// returns once every probe has settled.
    pub async fn verify(&self, providers: &[String]) -> HashMap<String, bool> {
        let mut usable = HashMap::new();
        let mut stale: Vec<String> = Vec::new();

        {
            let scores = self.scores.read().expect("health lock poisoned");
            for provider in providers {
                match scores.get(provider) {
                    Some(score) if score.last_checked.elapsed() < self.cache_ttl => {
                        usable.insert(provider.clone(), score.status != HealthStatus::Dead);
                    }
                    _ => stale.push(provider.clone()),
                }
            }
        }

        if stale.is_empty() {
            return usable;
        }

        let probes = stale.iter().map(|provider| {
            let prober = Arc::clone(&self.prober);
            let provider = provider.clone();
            async move {
                let outcome = prober.probe(&provider).await;
                (provider, outcome)
            }
        });

        for (provider, outcome) in join_all(probes).await {
            let status = self.record_probe(&provider, outcome);
            usable.insert(provider, status != HealthStatus::Dead);
        }

        usable
    }

    /// Folds one probe outcome into the score map and returns the new status.
    fn record_probe(
        &self,
        provider: &str,
        outcome: Result<Duration, crate::failure::CallFailure>,
    ) -> HealthStatus {
        let mut scores = self.scores.write().expect("health lock poisoned");
        let now = Instant::now();

        match outcome {
            Ok(latency) => {
                let status = if latency <= self.degraded_latency {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                };
                debug!(
                    provider = %provider,
                    latency_ms = latency.as_millis() as u64,
                    status = ?status,
                    "Health probe succeeded"
                );
                scores.insert(
                    provider.to_string(),
                    HealthScore { up: true, latency, last_checked: now, failures: 0, status },
                );
                status
            }
            Err(failure) => {
                let failures = scores.get(provider).map_or(0, |s| s.failures) + 1;
                let status = if failures >= self.dead_threshold {
                    HealthStatus::Dead
                } else {
                    HealthStatus::Degraded
                };
                warn!(
                    provider = %provider,
                    failures = failures,
                    status = ?status,
                    error = %failure.message,
                    "Health probe failed"
                );
                scores.insert(
                    provider.to_string(),
                    HealthScore {
                        up: false,
                        latency: Duration::ZERO,
                        last_checked: now,
                        failures,
                        status,
                    },
                );
                status
            }
        }
    }

    /// Current status for a provider, if it has ever been probed.
    pub fn status(&self, provider: &str) -> Option<HealthStatus> {
        let scores = self.scores.read().expect("health lock poisoned");
        scores.get(provider).map(|s| s.status)
    }

    /// Telemetry snapshot of every probed provider.
    pub fn snapshot(&self) -> BTreeMap<String, HealthSnapshot> {
        let scores = self.scores.read().expect("health lock poisoned");
        scores
            .iter()
            .map(|(provider, score)| {
                (
                    provider.clone(),
                    HealthSnapshot {
                        up: score.up,
                        status: score.status,
                        latency_ms: score.latency.as_millis() as u64,
                        failures: score.failures,
                    },
                )
            })
            .collect()
    }
}

impl std::fmt::Debug for HealthGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthGuard")
            .field("cache_ttl", &self.cache_ttl)
            .field("dead_threshold", &self.dead_threshold)
            .finish_non_exhaustive()
    }
}
