//! Terminal result types for agent execution.
//!
//! Every task produces exactly one [`AgentResult`]: the variants are
//! mutually exclusive and exhaustive, and consumers switch on the `status`
//! tag alone. Batch aggregation lives here too.

use crate::failure::FailureKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single finding reported by an analysis agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Finding category (e.g. `vulnerability`, `orchestrator_intervention`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Severity label (`low`, `medium`, `high`, `critical`).
    pub severity: String,
    /// Source location, typically `path:line`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Finding {
    /// Creates a finding emitted by the orchestrator itself rather than a model.
    pub fn intervention(description: impl Into<String>, severity: &str, location: Option<String>) -> Self {
        Self {
            kind: "orchestrator_intervention".to_string(),
            description: description.into(),
            severity: severity.to_string(),
            location,
        }
    }
}

/// One entry per exhausted candidate in a task's escalation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptLog {
    /// Logical model name.
    pub model: String,
    /// Provider that served the attempts.
    pub provider: String,
    /// Number of local attempts spent on this candidate.
    pub attempts: u32,
    /// Tag of the last error observed (`429`, `ECONNRESET`, `circuit_open`, ...).
    pub last_error: String,
}

/// The terminal outcome of a single agent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentResult {
    /// The task produced findings.
    Success {
        /// Task identifier (role name).
        role: String,
        /// Provider that served the winning attempt.
        provider: String,
        /// Logical model that produced the result.
        model: String,
        /// Attempts spent on the winning candidate.
        attempts: u32,
        /// Wall time from first attempt to success.
        latency_ms: u64,
        /// Findings extracted from the model response.
        findings: Vec<Finding>,
        /// Confidence score derived from the result content.
        overall_confidence: f64,
    },
    /// Every candidate in the ladder was tried without success or a fatal
    /// verdict. Retryable at a higher level.
    Exhausted {
        /// Task identifier (role name).
        role: String,
        /// One log entry per candidate attempted.
        attempted: Vec<AttemptLog>,
        /// Always `true` for this variant.
        retryable: bool,
        /// Wall time spent before giving up.
        latency_ms: u64,
    },
    /// A candidate returned a hard error; no further escalation was attempted.
    FatalError {
        /// Task identifier (role name).
        role: String,
        /// Provider that raised the fatal error (`none` if pre-dispatch).
        provider: String,
        /// Model involved (`none` if pre-dispatch).
        model: String,
        /// Machine-readable error category.
        error_type: FailureKind,
        /// Human-readable message.
        message: String,
        /// Always `false` for this variant.
        retryable: bool,
        /// Findings attached by the orchestrator (e.g. sandbox or capacity
        /// interventions). Empty for plain call failures.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        findings: Vec<Finding>,
    },
}

impl AgentResult {
    /// Returns the task identifier regardless of variant.
    pub fn role(&self) -> &str {
        match self {
            AgentResult::Success { role, .. }
            | AgentResult::Exhausted { role, .. }
            | AgentResult::FatalError { role, .. } => role,
        }
    }

    /// Returns `true` for the `Success` variant.
    pub fn is_success(&self) -> bool {
        matches!(self, AgentResult::Success { .. })
    }

    /// Wall time spent on the task, where tracked.
    pub fn latency_ms(&self) -> u64 {
        match self {
            AgentResult::Success { latency_ms, .. } | AgentResult::Exhausted { latency_ms, .. } => *latency_ms,
            AgentResult::FatalError { .. } => 0,
        }
    }

    /// Findings carried by the result, if any.
    pub fn findings(&self) -> &[Finding] {
        match self {
            AgentResult::Success { findings, .. } | AgentResult::FatalError { findings, .. } => findings,
            AgentResult::Exhausted { .. } => &[],
        }
    }

    /// Escalation history, if any.
    pub fn attempted(&self) -> &[AttemptLog] {
        match self {
            AgentResult::Exhausted { attempted, .. } => attempted,
            _ => &[],
        }
    }
}

/// Aggregate response for a batch or harvested swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Identifier of the swarm this batch belongs to, for async flows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm_id: Option<String>,
    /// Total number of agent results.
    pub total_agents: usize,
    /// Count of `success` results.
    pub successful: usize,
    /// Count of `exhausted` results.
    pub exhausted: usize,
    /// Count of `fatal_error` results.
    pub fatal: usize,
    /// Per-task results, in input order.
    pub results: Vec<AgentResult>,
    /// Roles of every non-success result, order-preserving.
    pub failed_roles: Vec<String>,
    /// Distinct error tags observed per provider, when any were recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<BTreeMap<String, Vec<String>>>,
    /// Timing and efficiency telemetry for the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<crate::telemetry::SwarmMetrics>,
}

/// Aggregates typed results into a [`BatchResponse`].
///
/// Counts the three terminal states and populates `failed_roles`. No
/// inference happens here: every result carries an explicit status.
pub fn aggregate_batch(results: Vec<AgentResult>) -> BatchResponse {
    let total = results.len();
    let mut successful = 0;
    let mut exhausted = 0;
    let mut fatal = 0;
    let mut failed_roles = Vec::new();
    let mut diagnostics: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for result in &results {
        match result {
            AgentResult::Success { .. } => successful += 1,
            AgentResult::Exhausted { .. } => {
                exhausted += 1;
                failed_roles.push(result.role().to_string());
            }
            AgentResult::FatalError { .. } => {
                fatal += 1;
                failed_roles.push(result.role().to_string());
            }
        }

        for attempt in result.attempted() {
            if !attempt.last_error.is_empty() {
                diagnostics
                    .entry(attempt.provider.clone())
                    .or_default()
                    .insert(attempt.last_error.clone());
            }
        }
    }

    let diagnostics = if diagnostics.is_empty() {
        None
    } else {
        Some(
            diagnostics
                .into_iter()
                .map(|(provider, errors)| (provider, errors.into_iter().collect()))
                .collect(),
        )
    };

    BatchResponse {
        swarm_id: None,
        total_agents: total,
        successful,
        exhausted,
        fatal,
        results,
        failed_roles,
        diagnostics,
        metrics: None,
    }
}
