//! Pre-flight token budget guard.
//!
//! Estimates the token footprint of a batch before any dispatch and rejects
//! the whole batch when it would exceed capacity. Estimation is best-effort
//! and intentionally cheap: characters divided by a provider-family token
//! density, plus a fixed safety headroom.

use crate::routing::AgentTask;
use serde::Serialize;
use tracing::{debug, warn};

/// Safety headroom applied to every estimate.
const HEADROOM: f64 = 1.25;

/// Hard ceiling for one task's headroomed estimate.
const PER_TASK_CEILING: u64 = 32_000;

/// Default characters-per-token density when a provider has no entry.
const DEFAULT_DENSITY: f64 = 4.0;

/// Characters-per-token density per provider family. Denser tokenizers get
/// a higher divisor (fewer tokens per character).
const PROVIDER_DENSITY: [(&str, f64); 5] = [
    ("openai", 4.0),
    ("anthropic", 3.8),
    ("google", 4.2),
    ("groq", 4.0),
    ("mistral", 3.9),
];

/// Verdict of a pre-flight budget check.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetVerdict {
    /// Whether the batch may proceed.
    pub allowed: bool,
    /// Sum of headroomed per-task estimates.
    pub estimated_tokens: u64,
    /// Human-readable rejection reason, when not allowed.
    pub reason: Option<String>,
}

/// Pre-flight token/cost estimator.
#[derive(Debug)]
pub struct BudgetGuard {
    per_task_ceiling: u64,
}

impl BudgetGuard {
    /// Creates a guard with the default per-task ceiling (32k tokens).
    #[must_use]
    pub fn new() -> Self {
        Self { per_task_ceiling: PER_TASK_CEILING }
    }

    /// Overrides the per-task ceiling (tests shrink this).
    #[must_use]
    pub fn with_per_task_ceiling(mut self, ceiling: u64) -> Self {
        self.per_task_ceiling = ceiling;
        self
    }

    fn density_for(provider: &str) -> f64 {
        PROVIDER_DENSITY
            .iter()
            .find(|(name, _)| *name == provider)
            .map_or(DEFAULT_DENSITY, |(_, density)| *density)
    }

    /// Headroomed token estimate for one task. Unreadable subjects
    /// contribute zero (estimation is best-effort, not authoritative).
    fn estimate_task(&self, task: &AgentTask) -> u64 {
        let content_len = match std::fs::metadata(&task.path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                debug!(path = %task.path.display(), "Unreadable subject skipped in budget estimate");
                return 0;
            }
        };
        let chars = content_len + task.prompt.len() as u64;
        let raw = (chars as f64 / Self::density_for(&task.provider)).ceil();
        (raw * HEADROOM).ceil() as u64
    }

    /// Checks a batch against per-task and aggregate capacity.
    ///
    /// Aggregate capacity scales linearly with the number of healthy
    /// providers: `healthy_provider_count x per_provider_threshold`. Any
    /// single task whose headroomed estimate exceeds the per-task ceiling
    /// rejects the batch immediately, regardless of aggregate headroom.
    pub fn check(
        &self,
        tasks: &[AgentTask],
        healthy_provider_count: usize,
        per_provider_threshold: u64,
    ) -> BudgetVerdict {
        let mut total = 0u64;

        for task in tasks {
            let estimate = self.estimate_task(task);
            if estimate > self.per_task_ceiling {
                warn!(
                    path = %task.path.display(),
                    estimate = estimate,
                    ceiling = self.per_task_ceiling,
                    "Single task exceeds the per-task token ceiling"
                );
                return BudgetVerdict {
                    allowed: false,
                    estimated_tokens: estimate,
                    reason: Some(format!(
                        "Task {} estimated at {estimate} tokens, above the {} per-task ceiling",
                        task.path.display(),
                        self.per_task_ceiling
                    )),
                };
            }
            total += estimate;
        }

        let capacity = healthy_provider_count as u64 * per_provider_threshold;
        if total > capacity {
            warn!(
                estimated = total,
                capacity = capacity,
                healthy_providers = healthy_provider_count,
                "Batch estimate exceeds aggregate capacity"
            );
            return BudgetVerdict {
                allowed: false,
                estimated_tokens: total,
                reason: Some(format!(
                    "Batch estimated at {total} tokens, above capacity {capacity} \
({healthy_provider_count} healthy providers x {per_provider_threshold})"
                )),
            };
        }

        debug!(estimated = total, capacity = capacity, "Budget check passed");
        BudgetVerdict { allowed: true, estimated_tokens: total, reason: None }
    }
}

impl Default for BudgetGuard {
    fn default() -> Self {
        Self::new()
    }
}
