//! Orchestration pipeline.
//!
//! Coordinates the guards, router, governor and execution engine into two
//! request flows: a synchronous batch that returns every result, and an
//! asynchronous swarm that fractures its inputs, launches a bounded set of
//! live workers in the background, and returns immediately with overflow
//! findings. Background results are written to the durable store and
//! retrieved later via harvest.

use crate::budget::BudgetGuard;
use crate::chunker::{fracture_file, FileChunk, DEFAULT_MAX_TOKENS_PER_CHUNK};
use crate::context::resolve_context;
use crate::error::{OrchestratorError, Result};
use crate::executor::ExecutionEngine;
use crate::failure::FailureKind;
use crate::governor::{ConcurrencyGovernor, DISK_KEY};
use crate::health::HealthGuard;
use crate::provider::{PathSandbox, ProviderDirectory};
use crate::result::{aggregate_batch, AgentResult, BatchResponse, Finding};
use crate::routing::{AgentTask, CircuitBreaker, RawTask, Router};
use crate::store::{InsightType, SwarmResult, SwarmStatus, SwarmStore};
use crate::telemetry::{compute_swarm_metrics, CollaborationCounts, PhaseTimestamps};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Pipeline limits.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Hard cap on tasks per batch and live workers per swarm.
    pub max_agents_per_batch: usize,
    /// Minimum credentialed providers before any batch is accepted.
    pub min_provider_redundancy: usize,
    /// Aggregate token capacity contributed by each healthy provider.
    pub per_provider_token_threshold: u64,
    /// Per-task timeout for the best-effort context phase.
    pub context_timeout: Duration,
    /// Chunk budget for swarm-mode fracturing, in estimated tokens.
    pub max_chunk_tokens: usize,
    /// Workspace root handed to the path sandbox.
    pub workspace_root: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents_per_batch: 15,
            min_provider_redundancy: 2,
            per_provider_token_threshold: 100_000,
            context_timeout: Duration::from_secs(2),
            max_chunk_tokens: DEFAULT_MAX_TOKENS_PER_CHUNK,
            workspace_root: None,
        }
    }
}

/// Outcome of harvesting a background swarm.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Harvest {
    /// Live workers are still running; try again later.
    Processing,
    /// Every worker reported; the aggregated response is ready.
    Ready {
        /// Aggregated results in the synchronous batch shape.
        #[serde(flatten)]
        batch: Box<BatchResponse>,
    },
}

/// One live swarm worker, paired with the chunk it analyzes and its board
/// row.
struct LiveWorker {
    task: AgentTask,
    chunk: FileChunk,
    board_id: String,
}

/// Coordinates the full request pipeline.
pub struct Orchestrator {
    directory: Arc<ProviderDirectory>,
    health: Arc<HealthGuard>,
    router: Arc<Router>,
    budget: Arc<BudgetGuard>,
    governor: Arc<ConcurrencyGovernor>,
    engine: Arc<ExecutionEngine>,
    breaker: Arc<CircuitBreaker>,
    sandbox: Arc<dyn PathSandbox>,
    store: SwarmStore,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Creates an orchestrator over the given services.
    #[allow(clippy::too_many_arguments)] // wiring seam, called once at startup
    pub fn new(
        directory: Arc<ProviderDirectory>,
        health: Arc<HealthGuard>,
        router: Arc<Router>,
        budget: Arc<BudgetGuard>,
        governor: Arc<ConcurrencyGovernor>,
        engine: Arc<ExecutionEngine>,
        breaker: Arc<CircuitBreaker>,
        sandbox: Arc<dyn PathSandbox>,
        store: SwarmStore,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            directory,
            health,
            router,
            budget,
            governor,
            engine,
            breaker,
            sandbox,
            store,
            config,
        }
    }

    /// Validates provider redundancy and returns the healthy provider set.
    async fn healthy_providers(&self) -> Result<Vec<String>> {
        let credentialed = self.directory.credentialed_providers();
        if credentialed.len() < self.config.min_provider_redundancy {
            return Err(OrchestratorError::InsufficientRedundancy {
                found: credentialed.len(),
                required: self.config.min_provider_redundancy,
            });
        }

        let usable = self.health.verify(&credentialed).await;
        let mut active: Vec<String> = credentialed
            .into_iter()
            .filter(|provider| usable.get(provider).copied().unwrap_or(false))
            .collect();
        if active.is_empty() {
            return Err(OrchestratorError::NoHealthyProviders);
        }
        active.sort();
        Ok(active)
    }

    /// Sandbox-validates raw tasks, splitting them into accepted tasks with
    /// normalized paths and direct fatal results for rejected paths.
    fn sandbox_tasks(&self, raw_tasks: Vec<RawTask>) -> (Vec<RawTask>, Vec<AgentResult>) {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for mut raw in raw_tasks {
            let verdict = self.sandbox.validate_path(&raw.path, self.config.workspace_root.as_deref());
            if verdict.valid {
                if let Some(normalized) = verdict.normalized_path {
                    raw.path = normalized;
                }
                accepted.push(raw);
            } else {
                let reason = verdict.reason.unwrap_or_else(|| "Invalid path".to_string());
                warn!(path = %raw.path.display(), reason = %reason, "Sandbox rejected task path");
                rejected.push(AgentResult::FatalError {
                    role: raw.role.unwrap_or_else(|| "custom".to_string()),
                    provider: "none".to_string(),
                    model: "none".to_string(),
                    error_type: FailureKind::SecurityViolation,
                    message: reason.clone(),
                    retryable: false,
                    findings: vec![Finding::intervention(
                        format!("Sandbox blocked file access: {reason}"),
                        "critical",
                        Some(raw.path.display().to_string()),
                    )],
                });
            }
        }

        (accepted, rejected)
    }

    /// Resolves auxiliary context for every task concurrently through the
    /// disk pool. Best-effort: a slow or failing resolution degrades to no
    /// context for that task.
    async fn context_phase(&self, tasks: &[AgentTask]) -> HashMap<PathBuf, String> {
        let timeout = self.config.context_timeout;
        let ops: Vec<_> = tasks
            .iter()
            .map(|task| {
                let path = task.path.clone();
                (
                    DISK_KEY.to_string(),
                    async move {
                        let resolved = tokio::time::timeout(
                            timeout,
                            tokio::task::spawn_blocking({
                                let path = path.clone();
                                move || resolve_context(&path)
                            }),
                        )
                        .await;
                        let context = match resolved {
                            Ok(Ok(context)) => context,
                            _ => String::new(),
                        };
                        (path, context)
                    },
                )
            })
            .collect();

        let mut map = HashMap::new();
        for slot in self.governor.run_keyed(ops).await {
            if let Ok((path, context)) = slot {
                if !context.is_empty() {
                    map.insert(path, context);
                }
            }
        }
        map
    }

    fn user_prompt_for(task: &AgentTask, context: Option<&String>) -> String {
        match context {
            Some(context) => format!("{context}\n\nAnalyze file: {}", task.path.display()),
            None => format!("Analyze file: {}", task.path.display()),
        }
    }

    /// Runs a batch synchronously, returning every result.
    ///
    /// Pre-flight violations (redundancy, batch cap, no healthy provider,
    /// budget) fail the whole call before any dispatch; everything after
    /// that is encoded per task in the response.
    ///
    /// # Errors
    /// Only pre-flight violations error; partial failure is data.
    pub async fn orchestrate(
        &self,
        raw_tasks: Vec<RawTask>,
        batch_id: Option<String>,
    ) -> Result<BatchResponse> {
        let batch_id = batch_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut ts = PhaseTimestamps::start();

        if raw_tasks.len() > self.config.max_agents_per_batch {
            return Err(OrchestratorError::BatchTooLarge {
                size: raw_tasks.len(),
                max: self.config.max_agents_per_batch,
            });
        }

        let active = self.healthy_providers().await?;
        let active_set: HashSet<String> = active.iter().cloned().collect();

        let (accepted, direct_fatal) = self.sandbox_tasks(raw_tasks);
        let tasks = self.router.expand(&accepted, &active_set)?;

        let verdict =
            self.budget.check(&tasks, active.len(), self.config.per_provider_token_threshold);
        if !verdict.allowed {
            return Err(OrchestratorError::BudgetExceeded(
                verdict.reason.unwrap_or_else(|| "Token budget exceeded".to_string()),
            ));
        }
        ts.mark_decomposition();

        let contexts = self.context_phase(&tasks).await;
        ts.mark_context();

        let ops: Vec<_> = tasks
            .iter()
            .map(|task| {
                let engine = Arc::clone(&self.engine);
                let task = task.clone();
                let prompt = Self::user_prompt_for(&task, contexts.get(&task.path));
                (task.provider.clone(), async move { engine.execute(&task, &prompt).await })
            })
            .collect();
        ts.mark_dispatch();

        let slots = self.governor.run_keyed(ops).await;
        let results: Vec<AgentResult> = slots
            .into_iter()
            .zip(tasks.iter())
            .map(|(slot, task)| match slot {
                Ok(result) => result,
                Err(err) => {
                    error!(role = %task.role, error = %err, "Dispatch slot failed outside the engine");
                    AgentResult::FatalError {
                        role: task.role.clone(),
                        provider: task.provider.clone(),
                        model: task.model.clone(),
                        error_type: FailureKind::RuntimeTaskError,
                        message: err.to_string(),
                        retryable: false,
                        findings: vec![Finding::intervention(
                            format!("Worker crashed at runtime: {err}"),
                            "critical",
                            Some(task.path.display().to_string()),
                        )],
                    }
                }
            })
            .collect();
        ts.mark_inference();

        let mut final_results = results;
        final_results.extend(direct_fatal);
        let mut batch = aggregate_batch(final_results);
        ts.mark_aggregation();

        batch.swarm_id = Some(batch_id.clone());
        batch.metrics = Some(compute_swarm_metrics(
            &batch_id,
            &ts,
            &batch.results,
            self.collaboration_counts(&batch_id),
            self.breaker.snapshot(),
            self.governor.snapshot(),
            self.health.snapshot(),
        ));

        info!(
            batch_id = %batch_id,
            total = batch.total_agents,
            successful = batch.successful,
            "Batch completed"
        );
        Ok(batch)
    }

    fn collaboration_counts(&self, swarm_id: &str) -> CollaborationCounts {
        CollaborationCounts {
            insights_posted: self.store.insight_count(swarm_id).unwrap_or(0),
            subtasks_spawned: self.store.subtask_count(swarm_id).unwrap_or(0),
            deduplication_hits: self.store.dedup_count(swarm_id).unwrap_or(0),
        }
    }

    /// Launches a background swarm and returns immediately.
    ///
    /// Each input is fractured into overlapping micro-chunks; the first
    /// `max_agents_per_batch` become live workers running detached, the
    /// rest come back at once as capacity-exceeded findings carrying the
    /// exact line range that was dropped. Live results are written to the
    /// durable store and retrieved via [`Orchestrator::harvest_swarm`].
    pub async fn orchestrate_swarm(
        &self,
        raw_tasks: Vec<RawTask>,
        swarm_id: Option<String>,
    ) -> Result<BatchResponse> {
        let swarm_id = swarm_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let active = self.healthy_providers().await?;
        let active_set: HashSet<String> = active.iter().cloned().collect();

        let (accepted, direct_fatal) = self.sandbox_tasks(raw_tasks);

        // Fracture every readable input into micro-tasks.
        let mut micro: Vec<(RawTask, FileChunk)> = Vec::new();
        for raw in accepted {
            let Ok(content) = std::fs::read_to_string(&raw.path) else {
                warn!(path = %raw.path.display(), "Unreadable swarm input skipped");
                continue;
            };
            for chunk in fracture_file(&raw.path, &content, self.config.max_chunk_tokens) {
                micro.push((raw.clone(), chunk));
            }
        }

        let live_count = micro.len().min(self.config.max_agents_per_batch);
        let overflow = micro.split_off(live_count);
        let total_micro = live_count + overflow.len();

        // Durable state exists before any work starts.
        self.store.create(&swarm_id, live_count)?;

        let live_raw: Vec<RawTask> = micro.iter().map(|(raw, _)| raw.clone()).collect();
        let expanded = match self.router.expand(&live_raw, &active_set) {
            Ok(expanded) => expanded,
            Err(err) => {
                self.store.fail_swarm(&swarm_id)?;
                return Err(err);
            }
        };

        let mut workers = Vec::with_capacity(expanded.len());
        for (task, (_, chunk)) in expanded.into_iter().zip(micro) {
            let board_id = self.store.record_task(
                &swarm_id,
                &serde_json::json!({
                    "path": chunk.path.display().to_string(),
                    "start_line": chunk.start_line,
                    "end_line": chunk.end_line,
                }),
            )?;
            workers.push(LiveWorker { task, chunk, board_id });
        }

        if workers.is_empty() {
            // Nothing launched (all inputs unreadable or rejected); leave a
            // terminal record instead of a swarm stuck in processing.
            self.store.fail_swarm(&swarm_id)?;
        } else {
            self.spawn_background_loop(swarm_id.clone(), workers);
        }

        // Instant spillover: overflow becomes structured escalation
        // findings, not an error.
        let mut immediate: Vec<AgentResult> = overflow
            .into_iter()
            .map(|(raw, chunk)| {
                let role = raw.role.unwrap_or_else(|| "custom".to_string());
                AgentResult::FatalError {
                    role,
                    provider: "none".to_string(),
                    model: "none".to_string(),
                    error_type: FailureKind::CapacityExceeded,
                    message: format!(
                        "Capacity exhausted. Caller intervention required for {} lines {}-{}.",
                        chunk.path.display(),
                        chunk.start_line,
                        chunk.end_line
                    ),
                    retryable: false,
                    findings: vec![Finding::intervention(
                        format!(
                            "Worker limit hit. Caller must process {} lines {}-{}.",
                            chunk.path.display(),
                            chunk.start_line,
                            chunk.end_line
                        ),
                        "medium",
                        Some(format!("{}:{}", chunk.path.display(), chunk.start_line)),
                    )],
                }
            })
            .collect();
        let direct_count = direct_fatal.len();
        immediate.extend(direct_fatal);

        let mut batch = aggregate_batch(immediate);
        batch.swarm_id = Some(swarm_id.clone());
        // Live workers count toward the batch even though they report later.
        batch.total_agents = total_micro + direct_count;

        info!(
            swarm_id = %swarm_id,
            live = live_count,
            overflow = batch.results.len(),
            "Swarm launched"
        );
        Ok(batch)
    }

    /// Runs the live workers detached. Every completion path, success or
    /// failure, writes a terminal state back to the store.
    fn spawn_background_loop(&self, swarm_id: String, workers: Vec<LiveWorker>) {
        let engine = Arc::clone(&self.engine);
        let governor = Arc::clone(&self.governor);
        let store = self.store.clone();

        tokio::spawn(async move {
            let ops: Vec<_> = workers
                .into_iter()
                .map(|worker| {
                    let engine = Arc::clone(&engine);
                    let store = store.clone();
                    let swarm_id = swarm_id.clone();
                    let key = worker.task.provider.clone();
                    (key, async move {
                        let _ = store.claim_task(
                            &worker.board_id,
                            &format!("{}/{}", worker.task.provider, worker.task.model),
                        );
                        let prompt = format!(
                            "Analyzing {} lines {}-{}. [SWARM_ID: {swarm_id}, TASK_ID: {}]\n\n\
You are part of a cooperative swarm: post insights so sibling tasks can \
see them, and spawn a follow-up task when a finding needs a different \
specialist.\n\n{}",
                            worker.chunk.path.display(),
                            worker.chunk.start_line,
                            worker.chunk.end_line,
                            worker.board_id,
                            worker.chunk.content,
                        );

                        let result = engine.execute(&worker.task, &prompt).await;
                        let stored = SwarmResult {
                            role: worker.task.role.clone(),
                            file_path: worker.chunk.path.display().to_string(),
                            status: match &result {
                                AgentResult::Success { .. } => "success".to_string(),
                                AgentResult::Exhausted { .. } => "exhausted".to_string(),
                                AgentResult::FatalError { .. } => "fatal_error".to_string(),
                            },
                            findings: result.findings().to_vec(),
                        };

                        let _ = store.settle_task(&worker.board_id, result.is_success());
                        if let Err(err) = store.update_task(&swarm_id, &stored) {
                            error!(swarm_id = %swarm_id, error = %err, "Failed to persist task completion");
                        }
                    })
                })
                .collect();

            let slots = governor.run_keyed(ops).await;
            for slot in slots {
                if let Err(err) = slot {
                    // The engine never errors; this is a crashed slot. The
                    // store must still reach a terminal count.
                    error!(swarm_id = %swarm_id, error = %err, "Background worker slot crashed");
                    let stored = SwarmResult {
                        role: "custom".to_string(),
                        file_path: String::new(),
                        status: "fatal_error".to_string(),
                        findings: vec![Finding::intervention(
                            format!("Background worker crashed: {err}"),
                            "critical",
                            None,
                        )],
                    };
                    if let Err(err) = store.update_task(&swarm_id, &stored) {
                        error!(swarm_id = %swarm_id, error = %err, "Failed to persist crashed slot");
                    }
                }
            }
        });
    }

    /// Collects results from a background swarm.
    ///
    /// # Errors
    /// `SwarmNotFound` when the id is unknown or already reaped.
    pub fn harvest_swarm(&self, swarm_id: &str) -> Result<Harvest> {
        let Some(state) = self.store.get(swarm_id)? else {
            return Err(OrchestratorError::SwarmNotFound(swarm_id.to_string()));
        };

        if state.status == SwarmStatus::Processing {
            return Ok(Harvest::Processing);
        }

        let results: Vec<AgentResult> = state
            .results
            .into_iter()
            .map(|stored| match stored.status.as_str() {
                "success" => AgentResult::Success {
                    role: stored.role,
                    provider: "bg_worker".to_string(),
                    model: "bg_model".to_string(),
                    attempts: 1,
                    latency_ms: 0,
                    findings: stored.findings,
                    overall_confidence: 1.0,
                },
                "exhausted" => AgentResult::Exhausted {
                    role: stored.role,
                    attempted: Vec::new(),
                    retryable: true,
                    latency_ms: 0,
                },
                _ => AgentResult::FatalError {
                    role: stored.role,
                    provider: "bg_worker".to_string(),
                    model: "bg_model".to_string(),
                    error_type: FailureKind::RuntimeTaskError,
                    message: "Background worker reported failure".to_string(),
                    retryable: false,
                    findings: stored.findings,
                },
            })
            .collect();

        let mut batch = aggregate_batch(results);
        batch.swarm_id = Some(swarm_id.to_string());
        Ok(Harvest::Ready { batch: Box::new(batch) })
    }

    /// Posts a cross-task insight to a running swarm's shared ledger.
    pub fn post_insight(
        &self,
        swarm_id: &str,
        task_id: Option<&str>,
        insight_type: InsightType,
        content: &serde_json::Value,
        source_agent: &str,
    ) -> Result<String> {
        self.store.post_insight(swarm_id, task_id, insight_type, content, source_agent)
    }

    /// Insights posted to a swarm so far, newest first.
    pub fn insights_for(&self, swarm_id: &str) -> Result<Vec<crate::store::Insight>> {
        self.store.insights_for(swarm_id)
    }

    /// Spawns a follow-up task on a running swarm's board.
    pub fn spawn_subtask(
        &self,
        swarm_id: &str,
        parent_task_id: &str,
        task_type: &str,
        context: &serde_json::Value,
    ) -> Result<String> {
        self.store.spawn_subtask(swarm_id, parent_task_id, task_type, context)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").field("config", &self.config).finish_non_exhaustive()
    }
}
