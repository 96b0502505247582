//! Concurrency governor.
//!
//! Two governance layers over all outbound work: a global bounded pool that
//! caps in-flight network operations process-wide, and lazily-created
//! per-key pools (one per provider, plus a reserved key for local disk
//! work) that keep one slow destination from starving the others. Flagged
//! keys are additionally paced through a fixed-rate throttle.

use crate::error::{OrchestratorError, Result};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Reserved routing key for local disk work. Bypasses the global network
/// pool and the throttle; only its own per-key pool applies.
pub const DISK_KEY: &str = "io_context";

/// Governor limits.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Total in-flight network operations across the process.
    pub global_limit: usize,
    /// Concurrency per routing key.
    pub per_key_limit: usize,
    /// Minimum spacing between operations on throttled keys.
    pub throttle_interval: Duration,
    /// Keys paced through the fixed-rate throttle.
    pub throttled_keys: HashSet<String>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            global_limit: 50,
            per_key_limit: 5,
            // 5 operations per second.
            throttle_interval: Duration::from_millis(200),
            throttled_keys: HashSet::new(),
        }
    }
}

/// Snapshot of the global pool for telemetry.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct GovernorSnapshot {
    /// Operations currently holding a global permit.
    pub active: usize,
    /// Operations waiting on the global pool.
    pub queued: usize,
}

/// Bounded keyed dispatcher for outbound work.
pub struct ConcurrencyGovernor {
    config: GovernorConfig,
    global: Arc<Semaphore>,
    key_pools: Mutex<HashMap<String, Arc<Semaphore>>>,
    throttles: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Instant>>>>,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

impl ConcurrencyGovernor {
    /// Creates a governor with default limits (50 global, 5 per key,
    /// 5 ops/s throttle).
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(GovernorConfig::default())
    }

    /// Creates a governor with custom limits.
    #[must_use]
    pub fn with_config(config: GovernorConfig) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.global_limit)),
            config,
            key_pools: Mutex::new(HashMap::new()),
            throttles: Mutex::new(HashMap::new()),
            active: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Per-key pool, created on first use.
    fn pool_for(&self, key: &str) -> Arc<Semaphore> {
        let mut pools = self.key_pools.lock().expect("governor pool lock poisoned");
        Arc::clone(
            pools
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_key_limit))),
        )
    }

    /// Pacing slot for a throttled key, created on first use.
    fn throttle_for(&self, key: &str) -> Option<Arc<tokio::sync::Mutex<Instant>>> {
        if !self.config.throttled_keys.contains(key) {
            return None;
        }
        let mut throttles = self.throttles.lock().expect("governor throttle lock poisoned");
        Some(Arc::clone(
            throttles
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Instant::now()))),
        ))
    }

    /// Runs keyed operations under the governance layers, returning one
    /// slot per input in input order.
    ///
    /// Network-bound keys consume a global permit (and, when flagged, a
    /// throttle slot) before their per-key permit; the reserved disk key
    /// goes straight to its own pool. A panic inside one operation fills
    /// its slot with `TaskPanicked` and never aborts the siblings.
    pub async fn run_keyed<T, F>(&self, tasks: Vec<(String, F)>) -> Vec<Result<T>>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let mut handles = Vec::with_capacity(tasks.len());

        for (key, operation) in tasks {
            let pool = self.pool_for(&key);
            let needs_global = key != DISK_KEY;
            let throttle = if needs_global { self.throttle_for(&key) } else { None };
            let global = Arc::clone(&self.global);
            let interval = self.config.throttle_interval;
            let active = Arc::clone(&self.active);
            let queued = Arc::clone(&self.queued);

            handles.push(tokio::spawn(async move {
                let _global_permit = if needs_global {
                    queued.fetch_add(1, Ordering::SeqCst);
                    let permit = global.acquire_owned().await;
                    queued.fetch_sub(1, Ordering::SeqCst);
                    // acquire_owned only fails on a closed semaphore, which
                    // the governor never does.
                    Some(permit.expect("global pool closed"))
                } else {
                    None
                };

                if let Some(throttle) = throttle {
                    let wakeup = {
                        let mut next_allowed = throttle.lock().await;
                        let now = Instant::now();
                        let slot = (*next_allowed).max(now);
                        *next_allowed = slot + interval;
                        slot
                    };
                    tokio::time::sleep_until(wakeup).await;
                }

                let _key_permit = pool.acquire_owned().await.expect("key pool closed");
                active.fetch_add(1, Ordering::SeqCst);
                let output = operation.await;
                active.fetch_sub(1, Ordering::SeqCst);
                output
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.map_err(|err| {
                warn!(error = %err, "Dispatched operation escaped its slot");
                OrchestratorError::TaskPanicked(err.to_string())
            }));
        }

        debug!(slots = results.len(), "Keyed dispatch settled");
        results
    }

    /// Global-pool gauges for telemetry.
    pub fn snapshot(&self) -> GovernorSnapshot {
        GovernorSnapshot {
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }
}

impl Default for ConcurrencyGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConcurrencyGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGovernor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::AtomicI32;

    type BoxedOp<T> = Pin<Box<dyn Future<Output = T> + Send>>;

    fn keyed<F>(key: &str, op: F) -> (String, F) {
        (key.to_string(), op)
    }

    #[tokio::test]
    async fn test_results_preserve_input_order() {
        let governor = ConcurrencyGovernor::new();
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                keyed("groq", async move {
                    // Later tasks finish first.
                    tokio::time::sleep(Duration::from_millis(40 - i * 5)).await;
                    i
                })
            })
            .collect();

        let results = governor.run_keyed(tasks).await;
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_per_key_limit_bounds_concurrency() {
        let governor = ConcurrencyGovernor::with_config(GovernorConfig {
            per_key_limit: 2,
            ..GovernorConfig::default()
        });

        let active = Arc::new(AtomicI32::new(0));
        let peak = Arc::new(AtomicI32::new(0));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                keyed("groq", async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        governor.run_keyed(tasks).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panic_fills_one_slot_without_aborting_siblings() {
        let governor = ConcurrencyGovernor::new();
        let results = governor
            .run_keyed(vec![
                keyed("groq", Box::pin(async { 1 }) as BoxedOp<i32>),
                keyed("groq", Box::pin(async move {
                        panic!("boom");
                        #[allow(unreachable_code)]
                        0_i32
                    }) as BoxedOp<i32>),
                keyed("openai", Box::pin(async { 3 }) as BoxedOp<i32>),
            ])
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 1);
        assert!(matches!(results[1], Err(OrchestratorError::TaskPanicked(_))));
        assert_eq!(*results[2].as_ref().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_throttled_key_is_paced() {
        let governor = ConcurrencyGovernor::with_config(GovernorConfig {
            throttle_interval: Duration::from_millis(50),
            throttled_keys: ["mistral".to_string()].into_iter().collect(),
            ..GovernorConfig::default()
        });

        let started = std::time::Instant::now();
        let tasks: Vec<_> = (0..4).map(|i| keyed("mistral", async move { i })).collect();
        governor.run_keyed(tasks).await;

        // Four paced operations need at least three intervals.
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_disk_key_bypasses_global_pool() {
        let governor = ConcurrencyGovernor::with_config(GovernorConfig {
            global_limit: 1,
            ..GovernorConfig::default()
        });

        // One network task holds the single global permit while disk tasks
        // still run to completion.
        let tasks = vec![
            keyed(
                "groq",
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    0
                }) as BoxedOp<i32>,
            ),
            keyed(DISK_KEY, Box::pin(async { 1 }) as BoxedOp<i32>),
            keyed(DISK_KEY, Box::pin(async { 2 }) as BoxedOp<i32>),
        ];

        let results = governor.run_keyed(tasks).await;
        assert!(results.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_snapshot_settles_to_zero() {
        let governor = ConcurrencyGovernor::new();
        governor.run_keyed(vec![keyed("groq", async {})]).await;

        let snapshot = governor.snapshot();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.queued, 0);
    }
}
