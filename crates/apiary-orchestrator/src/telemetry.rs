//! Swarm timing and efficiency metrics.
//!
//! Captures phase boundaries of an orchestration run and folds the agent
//! results into a structured metrics payload. Rendering belongs to the
//! host; this module produces data only.

use crate::governor::GovernorSnapshot;
use crate::health::HealthSnapshot;
use crate::result::AgentResult;
use crate::routing::BreakerSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

/// Phase boundaries of one orchestration run, anchored at start.
#[derive(Debug, Clone)]
pub struct PhaseTimestamps {
    start: Instant,
    after_decomposition: Instant,
    after_context: Instant,
    after_dispatch: Instant,
    after_inference: Instant,
    after_aggregation: Instant,
}

impl PhaseTimestamps {
    /// Creates a fresh set of timestamps, all anchored at now.
    #[must_use]
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            after_decomposition: now,
            after_context: now,
            after_dispatch: now,
            after_inference: now,
            after_aggregation: now,
        }
    }

    /// Marks the end of task decomposition/routing.
    pub fn mark_decomposition(&mut self) {
        self.after_decomposition = Instant::now();
    }

    /// Marks the end of the context resolution phase.
    pub fn mark_context(&mut self) {
        self.after_context = Instant::now();
    }

    /// Marks the end of dispatch setup.
    pub fn mark_dispatch(&mut self) {
        self.after_dispatch = Instant::now();
    }

    /// Marks the end of inference.
    pub fn mark_inference(&mut self) {
        self.after_inference = Instant::now();
    }

    /// Marks the end of aggregation.
    pub fn mark_aggregation(&mut self) {
        self.after_aggregation = Instant::now();
    }
}

/// Collaborative-board counters attached to swarm metrics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CollaborationCounts {
    /// Insights posted to the swarm ledger.
    pub insights_posted: usize,
    /// Follow-up tasks spawned on the board.
    pub subtasks_spawned: usize,
    /// Deduplication insights recorded.
    pub deduplication_hits: usize,
}

/// Structured timing/efficiency payload for one swarm or batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmMetrics {
    /// Swarm or batch identifier.
    pub swarm_id: String,
    /// Wall time from start to after aggregation.
    pub total_wall_time_ms: u64,
    /// Routing/decomposition phase duration.
    pub decomposition_ms: u64,
    /// Context resolution phase duration.
    pub context_ms: u64,
    /// Dispatch setup duration.
    pub dispatch_overhead_ms: u64,
    /// Inference phase duration.
    pub inference_wall_time_ms: u64,
    /// Aggregation phase duration.
    pub aggregation_ms: u64,
    /// Slowest single agent latency.
    pub max_agent_latency_ms: u64,
    /// Slowest agent latency divided by total wall time.
    pub parallel_efficiency: f64,
    /// Retries beyond each first attempt, summed across agents.
    pub total_retries: u64,
    /// Distinct extra providers tried by exhausted agents.
    pub provider_switches: u64,
    /// Distinct extra models tried by exhausted agents.
    pub model_escalations: u64,
    /// Sum of individual agent latencies.
    pub sequential_estimate_ms: u64,
    /// Sequential estimate divided by wall time.
    pub speedup_factor: f64,
    /// Sequential estimate minus wall time (negative when overhead wins).
    pub time_saved_ms: i64,
    /// Collaborative-board counters.
    #[serde(default)]
    pub collaboration: CollaborationCounts,
    /// Circuit breaker state per destination.
    pub circuit_breakers: BTreeMap<String, BreakerSnapshot>,
    /// Global dispatch pool gauges.
    pub global_queue: GovernorSnapshot,
    /// Health state per probed provider.
    pub health: BTreeMap<String, HealthSnapshot>,
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn agent_latency(result: &AgentResult) -> u64 {
    match result {
        AgentResult::Success { latency_ms, .. } | AgentResult::Exhausted { latency_ms, .. } => *latency_ms,
        AgentResult::FatalError { .. } => 0,
    }
}

/// Computes the metrics payload from phase timestamps and agent results.
#[must_use]
pub fn compute_swarm_metrics(
    swarm_id: &str,
    ts: &PhaseTimestamps,
    results: &[AgentResult],
    collaboration: CollaborationCounts,
    circuit_breakers: BTreeMap<String, BreakerSnapshot>,
    global_queue: GovernorSnapshot,
    health: BTreeMap<String, HealthSnapshot>,
) -> SwarmMetrics {
    let total_wall = ts.after_aggregation.duration_since(ts.start).as_millis() as u64;

    let latencies: Vec<u64> = results.iter().map(agent_latency).collect();
    let max_agent_latency = latencies.iter().copied().max().unwrap_or(0);
    let sequential_estimate: u64 = latencies.iter().sum();

    let parallel_efficiency = if total_wall > 0 && max_agent_latency > 0 {
        round3(max_agent_latency as f64 / total_wall as f64)
    } else {
        0.0
    };
    let speedup_factor = if total_wall > 0 && sequential_estimate > 0 {
        round2(sequential_estimate as f64 / total_wall as f64)
    } else {
        1.0
    };

    let mut total_retries = 0u64;
    let mut provider_switches = 0u64;
    let mut model_escalations = 0u64;
    for result in results {
        match result {
            AgentResult::Success { attempts, .. } => {
                total_retries += u64::from(attempts.saturating_sub(1));
            }
            AgentResult::Exhausted { attempted, .. } => {
                for log in attempted {
                    total_retries += u64::from(log.attempts.saturating_sub(1));
                }
                if attempted.len() > 1 {
                    let providers: HashSet<&str> =
                        attempted.iter().map(|log| log.provider.as_str()).collect();
                    let models: HashSet<&str> = attempted.iter().map(|log| log.model.as_str()).collect();
                    provider_switches += providers.len() as u64 - 1;
                    model_escalations += models.len() as u64 - 1;
                }
            }
            AgentResult::FatalError { .. } => {}
        }
    }

    SwarmMetrics {
        swarm_id: swarm_id.to_string(),
        total_wall_time_ms: total_wall,
        decomposition_ms: ts.after_decomposition.duration_since(ts.start).as_millis() as u64,
        context_ms: ts.after_context.duration_since(ts.after_decomposition).as_millis() as u64,
        dispatch_overhead_ms: ts.after_dispatch.duration_since(ts.after_context).as_millis() as u64,
        inference_wall_time_ms: ts.after_inference.duration_since(ts.after_dispatch).as_millis() as u64,
        aggregation_ms: ts.after_aggregation.duration_since(ts.after_inference).as_millis() as u64,
        max_agent_latency_ms: max_agent_latency,
        parallel_efficiency,
        total_retries,
        provider_switches,
        model_escalations,
        sequential_estimate_ms: sequential_estimate,
        speedup_factor,
        time_saved_ms: sequential_estimate as i64 - total_wall as i64,
        collaboration,
        circuit_breakers,
        global_queue,
        health,
    }
}
