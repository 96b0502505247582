//! Per-task execution engine.
//!
//! The unit of resilience: runs one agent task through its candidate
//! ladder with three escalation tiers — local retry on the same candidate,
//! provider escalation for the same logical model, then model escalation —
//! under an absolute wall-clock deadline. Never errors out: every failure
//! mode is encoded in the returned [`AgentResult`].

use crate::failure::{classify, is_retryable, FailureKind};
use crate::result::{AgentResult, AttemptLog};
use crate::routing::{AgentTask, CircuitBreaker, ModelCandidate, Resolver};
use crate::transport::{ModelCall, ModelCaller};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Execution timing and retry limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Absolute wall-clock budget per task.
    pub task_deadline: Duration,
    /// Task budget when the front candidate is flagged for extended
    /// reasoning.
    pub extended_task_deadline: Duration,
    /// Network timeout per attempt.
    pub attempt_timeout: Duration,
    /// Attempt timeout for extended-reasoning candidates.
    pub extended_attempt_timeout: Duration,
    /// Calls per candidate before escalating (tier 1 width).
    pub max_attempts_per_candidate: u32,
    /// First backoff ceiling; doubles per retry.
    pub backoff_base: Duration,
    /// Upper bound on any single backoff delay.
    pub backoff_cap: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_deadline: Duration::from_secs(45),
            extended_task_deadline: Duration::from_secs(150),
            attempt_timeout: Duration::from_secs(15),
            extended_attempt_timeout: Duration::from_secs(120),
            max_attempts_per_candidate: 2,
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(8000),
        }
    }
}

/// Full-jitter exponential backoff delay for retry attempt `n` (1-based):
/// uniform over `[0, min(base * 2^(n-1), cap)]`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << (attempt.saturating_sub(1)).min(16));
    let ceiling = exp.min(cap.as_millis()) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
}

/// Confidence heuristic for a successful response.
fn confidence_for(finding_count: usize) -> f64 {
    if finding_count > 0 {
        0.8
    } else {
        0.5
    }
}

/// Runs tasks through their candidate ladders.
pub struct ExecutionEngine {
    resolver: Arc<Resolver>,
    breaker: Arc<CircuitBreaker>,
    caller: Arc<dyn ModelCaller>,
    config: EngineConfig,
}

impl ExecutionEngine {
    /// Creates an engine with default timing limits.
    pub fn new(resolver: Arc<Resolver>, breaker: Arc<CircuitBreaker>, caller: Arc<dyn ModelCaller>) -> Self {
        Self::with_config(resolver, breaker, caller, EngineConfig::default())
    }

    /// Creates an engine with custom timing limits.
    pub fn with_config(
        resolver: Arc<Resolver>,
        breaker: Arc<CircuitBreaker>,
        caller: Arc<dyn ModelCaller>,
        config: EngineConfig,
    ) -> Self {
        Self { resolver, breaker, caller, config }
    }

    /// Ladder for the task, with the router's pre-assigned destination
    /// moved to the front so load-balancing assignments are honored first.
    fn ladder_for(&self, task: &AgentTask) -> crate::error::Result<Vec<ModelCandidate>> {
        let mut ladder = self.resolver.resolve(&task.capability)?;
        if let Some(pos) = ladder
            .iter()
            .position(|c| c.provider == task.provider && c.model_string == task.model)
        {
            let assigned = ladder.remove(pos);
            ladder.insert(0, assigned);
        }
        Ok(ladder)
    }

    /// Executes one task to a terminal result. Never returns an error.
    ///
    /// `user_prompt` is the subject content plus any resolved context; the
    /// orchestrator prepares it before dispatch.
    pub async fn execute(&self, task: &AgentTask, user_prompt: &str) -> AgentResult {
        let started = Instant::now();
        let mut attempted: Vec<AttemptLog> = Vec::new();

        let ladder = match self.ladder_for(task) {
            Ok(ladder) => ladder,
            Err(err) => {
                return AgentResult::FatalError {
                    role: task.role.clone(),
                    provider: "none".to_string(),
                    model: "none".to_string(),
                    error_type: FailureKind::NoCandidates,
                    message: err.to_string(),
                    retryable: false,
                    findings: Vec::new(),
                }
            }
        };

        // The front candidate's extended-budget flag picks the timing
        // profile for the whole task.
        let extended = ladder.first().is_some_and(|c| c.extended_budget);
        let deadline = if extended {
            self.config.extended_task_deadline
        } else {
            self.config.task_deadline
        };
        let attempt_timeout = if extended {
            self.config.extended_attempt_timeout
        } else {
            self.config.attempt_timeout
        };

        for candidate in &ladder {
            // Breaker pre-condition: an open destination costs no network
            // attempt, just a synthetic log entry.
            if self.breaker.is_open(&candidate.provider, &candidate.model_string) {
                debug!(
                    provider = %candidate.provider,
                    model = %candidate.model_string,
                    "Circuit open, escalating without a call"
                );
                attempted.push(AttemptLog {
                    model: candidate.logical_model.clone(),
                    provider: candidate.provider.clone(),
                    attempts: 0,
                    last_error: "circuit_open".to_string(),
                });
                continue;
            }

            let mut attempts = 0u32;
            let mut last_error = String::from("unknown");

            while attempts < self.config.max_attempts_per_candidate {
                if started.elapsed() > deadline {
                    attempted.push(AttemptLog {
                        model: candidate.logical_model.clone(),
                        provider: candidate.provider.clone(),
                        attempts,
                        last_error: "agent_timeout".to_string(),
                    });
                    warn!(role = %task.role, elapsed_ms = started.elapsed().as_millis() as u64, "Task deadline exceeded");
                    return AgentResult::Exhausted {
                        role: task.role.clone(),
                        attempted,
                        retryable: true,
                        latency_ms: started.elapsed().as_millis() as u64,
                    };
                }

                attempts += 1;

                let call = ModelCall {
                    provider: &candidate.provider,
                    model: &candidate.model_string,
                    system_prompt: &task.prompt,
                    user_prompt,
                    timeout: attempt_timeout,
                };

                match self.caller.call(call).await {
                    Ok(outcome) => {
                        self.breaker.record_success(&candidate.provider, &candidate.model_string);
                        info!(
                            role = %task.role,
                            provider = %candidate.provider,
                            model = %candidate.logical_model,
                            attempts = attempts,
                            latency_ms = started.elapsed().as_millis() as u64,
                            "Task succeeded"
                        );
                        return AgentResult::Success {
                            role: task.role.clone(),
                            provider: candidate.provider.clone(),
                            model: candidate.logical_model.clone(),
                            attempts,
                            latency_ms: started.elapsed().as_millis() as u64,
                            overall_confidence: confidence_for(outcome.findings.len()),
                            findings: outcome.findings,
                        };
                    }
                    Err(failure) => {
                        self.breaker.record_failure(&candidate.provider, &candidate.model_string);
                        last_error = failure.error_tag();

                        if !is_retryable(&failure) {
                            warn!(
                                role = %task.role,
                                provider = %candidate.provider,
                                error = %failure.message,
                                "Fatal failure, stopping escalation"
                            );
                            return AgentResult::FatalError {
                                role: task.role.clone(),
                                provider: candidate.provider.clone(),
                                model: candidate.logical_model.clone(),
                                error_type: classify(&failure),
                                message: failure.message,
                                retryable: false,
                                findings: Vec::new(),
                            };
                        }

                        debug!(
                            role = %task.role,
                            provider = %candidate.provider,
                            attempt = attempts,
                            max = self.config.max_attempts_per_candidate,
                            error = %last_error,
                            "Transient failure"
                        );

                        if attempts < self.config.max_attempts_per_candidate {
                            let delay =
                                backoff_delay(attempts, self.config.backoff_base, self.config.backoff_cap);
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }

            // Tier 2/3: candidate exhausted, escalate down the ladder.
            attempted.push(AttemptLog {
                model: candidate.logical_model.clone(),
                provider: candidate.provider.clone(),
                attempts,
                last_error,
            });
            debug!(
                role = %task.role,
                provider = %candidate.provider,
                model = %candidate.logical_model,
                "Candidate exhausted, escalating"
            );
        }

        AgentResult::Exhausted {
            role: task.role.clone(),
            attempted,
            retryable: true,
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine").field("config", &self.config).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::CallFailure;
    use crate::provider::test_support::StaticCredentials;
    use crate::provider::ProviderDirectory;
    use crate::result::Finding;
    use crate::transport::CallOutcome;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Caller that replays a scripted queue of outcomes, recording the
    /// destination of every call.
    struct ScriptedCaller {
        script: Mutex<VecDeque<Result<CallOutcome, CallFailure>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedCaller {
        fn new(script: Vec<Result<CallOutcome, CallFailure>>) -> Self {
            Self { script: Mutex::new(script.into()), calls: Mutex::new(Vec::new()) }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelCaller for ScriptedCaller {
        async fn call(&self, request: ModelCall<'_>) -> Result<CallOutcome, CallFailure> {
            self.calls.lock().unwrap().push(format!("{}/{}", request.provider, request.model));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CallFailure::http(503, "script exhausted")))
        }
    }

    fn ok_outcome(findings: usize) -> Result<CallOutcome, CallFailure> {
        Ok(CallOutcome {
            findings: (0..findings)
                .map(|i| Finding {
                    kind: "bug".to_string(),
                    description: format!("finding {i}"),
                    severity: "medium".to_string(),
                    location: None,
                })
                .collect(),
            usage: crate::provider::TokenUsage { prompt_tokens: 100, completion_tokens: 50 },
            latency: Duration::from_millis(80),
        })
    }

    const REGISTRY: &str = r#"{
        "models": [
            {
                "name": "kimi-k2",
                "capabilities": ["general_analysis"],
                "providers": {"groq": "moonshotai/kimi-k2", "openrouter": "moonshotai/kimi-k2"}
            }
        ]
    }"#;

    fn engine_with(
        dir: &tempfile::TempDir,
        caller: Arc<ScriptedCaller>,
        providers: &[&str],
    ) -> (ExecutionEngine, Arc<CircuitBreaker>) {
        let path = dir.path().join("models.json");
        std::fs::write(&path, REGISTRY).unwrap();
        let creds = Arc::new(StaticCredentials::for_providers(providers));
        let resolver = Arc::new(Resolver::new(path, Arc::new(ProviderDirectory::new(creds))));
        let breaker = Arc::new(CircuitBreaker::new());
        let config = EngineConfig {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(2),
            ..EngineConfig::default()
        };
        (
            ExecutionEngine::with_config(resolver, Arc::clone(&breaker), caller, config),
            breaker,
        )
    }

    fn task(provider: &str) -> AgentTask {
        AgentTask {
            role: "security".to_string(),
            path: PathBuf::from("src/main.rs"),
            capability: "general_analysis".to_string(),
            prompt: "Find problems.".to_string(),
            provider: provider.to_string(),
            model: "moonshotai/kimi-k2".to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(ScriptedCaller::new(vec![ok_outcome(2)]));
        let (engine, _) = engine_with(&dir, Arc::clone(&caller), &["groq"]);

        let result = engine.execute(&task("groq"), "content").await;
        match result {
            AgentResult::Success { attempts, overall_confidence, ref findings, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(findings.len(), 2);
                assert!((overall_confidence - 0.8).abs() < f64::EPSILON);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_findings_lower_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(ScriptedCaller::new(vec![ok_outcome(0)]));
        let (engine, _) = engine_with(&dir, caller, &["groq"]);

        match engine.execute(&task("groq"), "content").await {
            AgentResult::Success { overall_confidence, .. } => {
                assert!((overall_confidence - 0.5).abs() < f64::EPSILON);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_retries_same_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(ScriptedCaller::new(vec![
            Err(CallFailure::http(429, "rate limited")),
            ok_outcome(1),
        ]));
        let (engine, _) = engine_with(&dir, Arc::clone(&caller), &["groq"]);

        match engine.execute(&task("groq"), "content").await {
            AgentResult::Success { attempts, ref provider, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(provider, "groq");
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(caller.calls(), vec!["groq/moonshotai/kimi-k2", "groq/moonshotai/kimi-k2"]);
    }

    #[tokio::test]
    async fn test_tier_two_escalates_to_next_provider() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(ScriptedCaller::new(vec![
            Err(CallFailure::http(429, "rate limited")),
            Err(CallFailure::http(429, "rate limited")),
            ok_outcome(1),
        ]));
        let (engine, _) = engine_with(&dir, Arc::clone(&caller), &["groq", "openrouter"]);

        // Pre-assigned groq exhausts tier 1, then openrouter serves it.
        match engine.execute(&task("groq"), "content").await {
            AgentResult::Success { ref provider, .. } => assert_eq!(provider, "openrouter"),
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(caller.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_logs_every_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(ScriptedCaller::new(vec![
            Err(CallFailure::http(503, "down")),
            Err(CallFailure::http(503, "down")),
            Err(CallFailure::http(503, "down")),
            Err(CallFailure::http(503, "down")),
        ]));
        let (engine, _) = engine_with(&dir, caller, &["groq", "openrouter"]);

        match engine.execute(&task("groq"), "content").await {
            AgentResult::Exhausted { ref attempted, retryable, .. } => {
                assert!(retryable);
                assert_eq!(attempted.len(), 2);
                assert!(attempted.iter().all(|log| log.attempts == 2 && log.last_error == "503"));
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fatal_error_stops_escalation() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(ScriptedCaller::new(vec![Err(CallFailure::http(401, "bad key"))]));
        let (engine, _) = engine_with(&dir, Arc::clone(&caller), &["groq", "openrouter"]);

        match engine.execute(&task("groq"), "content").await {
            AgentResult::FatalError { error_type, retryable, .. } => {
                assert_eq!(error_type, FailureKind::InvalidApiKey);
                assert!(!retryable);
            }
            other => panic!("expected fatal, got {other:?}"),
        }
        // No second candidate was tried.
        assert_eq!(caller.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_candidate_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(ScriptedCaller::new(vec![ok_outcome(1)]));
        let (engine, breaker) = engine_with(&dir, Arc::clone(&caller), &["groq", "openrouter"]);

        for _ in 0..5 {
            breaker.record_failure("groq", "moonshotai/kimi-k2");
        }

        match engine.execute(&task("groq"), "content").await {
            AgentResult::Success { ref provider, .. } => assert_eq!(provider, "openrouter"),
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(caller.calls(), vec!["openrouter/moonshotai/kimi-k2"]);
    }

    #[tokio::test]
    async fn test_deadline_exceeded_returns_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(ScriptedCaller::new(vec![Err(CallFailure::http(503, "down"))]));
        let path = dir.path().join("models.json");
        std::fs::write(&path, REGISTRY).unwrap();
        let creds = Arc::new(StaticCredentials::for_providers(&["groq"]));
        let resolver = Arc::new(Resolver::new(path, Arc::new(ProviderDirectory::new(creds))));
        let config = EngineConfig {
            task_deadline: Duration::from_millis(0),
            ..EngineConfig::default()
        };
        let engine =
            ExecutionEngine::with_config(resolver, Arc::new(CircuitBreaker::new()), caller, config);

        match engine.execute(&task("groq"), "content").await {
            AgentResult::Exhausted { ref attempted, retryable, .. } => {
                assert!(retryable);
                assert_eq!(attempted[0].last_error, "agent_timeout");
                assert_eq!(attempted[0].attempts, 0);
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unresolvable_capability_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(ScriptedCaller::new(vec![]));
        let (engine, _) = engine_with(&dir, caller, &["groq"]);

        let mut bad = task("groq");
        bad.capability = "quantum_divination".to_string();
        match engine.execute(&bad, "content").await {
            AgentResult::FatalError { error_type, .. } => {
                assert_eq!(error_type, FailureKind::NoCandidates);
            }
            other => panic!("expected fatal, got {other:?}"),
        }
    }

    #[test]
    fn test_backoff_delay_stays_within_jitter_envelope() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(8000);
        for attempt in 1..=6 {
            let ceiling = (1000u64 * (1 << (attempt - 1))).min(8000);
            for _ in 0..50 {
                let delay = backoff_delay(attempt as u32, base, cap);
                assert!(delay.as_millis() as u64 <= ceiling);
            }
        }
    }
}
