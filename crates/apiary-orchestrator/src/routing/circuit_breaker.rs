//! Circuit breaker for per-destination inference failure detection.
//!
//! Tracks inference-call failures per (provider, model) key, independently
//! of the liveness-ping health guard. When a destination keeps failing,
//! calls against it fast-fail without touching the network until a cooldown
//! elapses, after which exactly one probe is admitted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker state for one (provider, model) destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Fast-failing until the cooldown expires.
    Open,
    /// Cooldown elapsed; one probe call admitted.
    HalfOpen,
}

impl CircuitState {
    /// Telemetry label.
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Failure-tracking record for one destination. Lazily created; lives for
/// the process lifetime.
#[derive(Debug, Clone)]
struct BreakerRecord {
    state: CircuitState,
    failures: u32,
    first_failure: Option<Instant>,
    next_attempt: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            first_failure: None,
            next_attempt: None,
            probe_in_flight: false,
        }
    }
}

/// Telemetry snapshot of one breaker record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// State label (`CLOSED`, `OPEN`, `HALF_OPEN`).
    pub state: String,
    /// Current failure count within the window.
    pub failures: u32,
}

/// Circuit breaker keyed by (provider, model).
pub struct CircuitBreaker {
    records: Arc<RwLock<HashMap<String, BreakerRecord>>>,
    /// Failures within the window before the circuit opens (default 5).
    failure_threshold: u32,
    /// Rolling failure window (default 60s).
    failure_window: Duration,
    /// Cooldown before a probe is admitted (default 30s).
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Creates a breaker with default settings.
    ///
    /// Defaults:
    /// - Failure threshold: 5 failures
    /// - Failure window: 60 seconds
    /// - Cooldown: 30 seconds
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(5, Duration::from_secs(60), Duration::from_secs(30))
    }

    /// Creates a breaker with custom settings.
    ///
    /// # Arguments
    /// * `failure_threshold` - Failures within the window before opening
    /// * `failure_window` - Rolling window for the failure count
    /// * `cooldown` - Open duration before a probe is admitted
    #[must_use]
    pub fn with_settings(failure_threshold: u32, failure_window: Duration, cooldown: Duration) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            failure_threshold,
            failure_window,
            cooldown,
        }
    }

    fn key(provider: &str, model: &str) -> String {
        format!("{provider}:{model}")
    }

    /// Checks whether calls to a destination should fast-fail right now.
    ///
    /// Also drives the OPEN -> HALF_OPEN transition and probe admission:
    /// when the cooldown has elapsed, the first caller is admitted as the
    /// single probe and concurrent callers keep fast-failing until the
    /// probe settles.
    pub fn is_open(&self, provider: &str, model: &str) -> bool {
        let key = Self::key(provider, model);
        let mut records = self.records.write().expect("breaker lock poisoned");
        let record = records.entry(key.clone()).or_insert_with(BreakerRecord::new);
        let now = Instant::now();

        match record.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if record.next_attempt.is_some_and(|at| now >= at) {
                    record.state = CircuitState::HalfOpen;
                    record.probe_in_flight = true;
                    // Fallback re-arm in case the probe never settles.
                    record.next_attempt = Some(now + self.cooldown);
                    debug!(key = %key, "Circuit breaker: Open -> HalfOpen, admitting one probe");
                    false
                } else {
                    true
                }
            }
            CircuitState::HalfOpen => {
                if record.probe_in_flight {
                    return true;
                }
                record.probe_in_flight = true;
                record.next_attempt = Some(now + self.cooldown);
                false
            }
        }
    }

    /// Records a successful call against a destination.
    ///
    /// A success in HALF_OPEN closes the circuit; a success in CLOSED with a
    /// nonzero failure count resets the counter (fast recovery from blips).
    pub fn record_success(&self, provider: &str, model: &str) {
        let key = Self::key(provider, model);
        let mut records = self.records.write().expect("breaker lock poisoned");
        if let Some(record) = records.get_mut(&key) {
            if record.state == CircuitState::HalfOpen || record.failures > 0 {
                debug!(key = %key, "Circuit breaker: recovered, Closed");
                *record = BreakerRecord::new();
            }
        }
    }

    /// Records a failed call against a destination.
    ///
    /// Opens the circuit when the threshold is reached within the window,
    /// or immediately when a HALF_OPEN probe fails.
    pub fn record_failure(&self, provider: &str, model: &str) {
        let key = Self::key(provider, model);
        let mut records = self.records.write().expect("breaker lock poisoned");
        let record = records.entry(key.clone()).or_insert_with(BreakerRecord::new);
        let now = Instant::now();

        // Stale-window decay: restart the count if the first failure fell
        // out of the rolling window while the circuit stayed closed.
        if record.state == CircuitState::Closed {
            if let Some(first) = record.first_failure {
                if now.duration_since(first) > self.failure_window {
                    record.failures = 0;
                    record.first_failure = None;
                }
            }
        }

        if record.first_failure.is_none() {
            record.first_failure = Some(now);
        }
        record.failures += 1;

        if record.state == CircuitState::HalfOpen || record.failures >= self.failure_threshold {
            record.state = CircuitState::Open;
            record.next_attempt = Some(now + self.cooldown);
            record.probe_in_flight = false;
            warn!(
                key = %key,
                failures = record.failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "Circuit breaker: Opened, fast-failing"
            );
        } else {
            record.probe_in_flight = false;
        }
    }

    /// Current state for a destination (`Closed` if never seen).
    pub fn state(&self, provider: &str, model: &str) -> CircuitState {
        let records = self.records.read().expect("breaker lock poisoned");
        records
            .get(&Self::key(provider, model))
            .map_or(CircuitState::Closed, |r| r.state)
    }

    /// Telemetry snapshot of every tracked destination.
    pub fn snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        let records = self.records.read().expect("breaker lock poisoned");
        records
            .iter()
            .map(|(key, record)| {
                (
                    key.clone(),
                    BreakerSnapshot { state: record.state.as_str().to_string(), failures: record.failures },
                )
            })
            .collect()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}
