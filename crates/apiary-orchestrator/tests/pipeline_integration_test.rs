//! End-to-end pipeline tests over scripted transport doubles.
//!
//! Every test wires a full orchestrator (directory, health guard, router,
//! budget, governor, engine, breaker, store) around a scripted model
//! caller, so failover, escalation and swarm durability are exercised the
//! way a host process would see them.

use apiary_orchestrator::failure::{CallFailure, FailureKind};
use apiary_orchestrator::governor::ConcurrencyGovernor;
use apiary_orchestrator::health::HealthGuard;
use apiary_orchestrator::orchestrator::{Harvest, Orchestrator, OrchestratorConfig};
use apiary_orchestrator::provider::{
    CredentialSource, PathSandbox, PathValidation, ProviderDirectory, TokenUsage,
};
use apiary_orchestrator::result::{AgentResult, Finding};
use apiary_orchestrator::routing::{CircuitBreaker, RawTask, Resolver, RoleBook, RoleSpec, Router};
use apiary_orchestrator::store::SwarmStore;
use apiary_orchestrator::transport::{CallOutcome, HealthProber, ModelCall, ModelCaller};
use apiary_orchestrator::executor::{EngineConfig, ExecutionEngine};
use apiary_orchestrator::budget::BudgetGuard;
use apiary_orchestrator::error::OrchestratorError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Credential source over a fixed set of `*_API_KEY` names.
struct TestCredentials(HashSet<String>);

impl TestCredentials {
    fn for_providers(providers: &[&str]) -> Self {
        Self(providers.iter().map(|p| format!("{}_API_KEY", p.to_uppercase())).collect())
    }
}

impl CredentialSource for TestCredentials {
    fn lookup(&self, key: &str) -> Option<String> {
        self.0.contains(key).then(|| "test-key".to_string())
    }
}

/// Sandbox that rejects paths containing `..` and accepts the rest as-is.
struct DotDotSandbox;

impl PathSandbox for DotDotSandbox {
    fn validate_path(&self, path: &Path, _root: Option<&Path>) -> PathValidation {
        if path.components().any(|c| c.as_os_str() == "..") {
            PathValidation::reject("Path traversal outside workspace root")
        } else {
            PathValidation::accept(path.to_path_buf())
        }
    }
}

/// Prober that always reports a fast, healthy provider.
struct UpProber;

#[async_trait]
impl HealthProber for UpProber {
    async fn probe(&self, _provider: &str) -> Result<Duration, CallFailure> {
        Ok(Duration::from_millis(40))
    }
}

/// Model caller driven by per-destination outcome scripts. Destinations
/// without a script succeed with a single canned finding.
struct ScriptedCaller {
    scripts: Mutex<HashMap<String, VecDeque<Result<CallOutcome, CallFailure>>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedCaller {
    fn new() -> Self {
        Self { scripts: Mutex::new(HashMap::new()), calls: Mutex::new(Vec::new()) }
    }

    fn script(&self, provider: &str, model: &str, outcomes: Vec<Result<CallOutcome, CallFailure>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(format!("{provider}:{model}"), outcomes.into_iter().collect());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn ok_outcome() -> CallOutcome {
        CallOutcome {
            findings: vec![Finding {
                kind: "vulnerability".to_string(),
                description: "Unparameterized query".to_string(),
                severity: "high".to_string(),
                location: Some("src/db.rs:42".to_string()),
            }],
            usage: TokenUsage { prompt_tokens: 120, completion_tokens: 80 },
            latency: Duration::from_millis(5),
        }
    }
}

#[async_trait]
impl ModelCaller for ScriptedCaller {
    async fn call(&self, request: ModelCall<'_>) -> Result<CallOutcome, CallFailure> {
        let key = format!("{}:{}", request.provider, request.model);
        self.calls.lock().unwrap().push(key.clone());
        if let Some(queue) = self.scripts.lock().unwrap().get_mut(&key) {
            if let Some(next) = queue.pop_front() {
                return next;
            }
        }
        Ok(Self::ok_outcome())
    }
}

const REGISTRY: &str = r#"{
    "models": [
        {
            "name": "kimi-k2",
            "capabilities": ["security_detection", "general_analysis"],
            "providers": {"groq": "kimi-k2", "openrouter": "kimi-k2"}
        },
        {
            "name": "gpt-4o",
            "capabilities": ["security_detection", "general_analysis"],
            "providers": {"openai": "gpt-4o", "openrouter": "gpt-4o"}
        }
    ]
}"#;

struct Harness {
    orchestrator: Orchestrator,
    caller: Arc<ScriptedCaller>,
    dir: TempDir,
}

impl Harness {
    fn subject(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn harness_with(providers: &[&str], config: OrchestratorConfig) -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let registry_path = dir.path().join("models.json");
    std::fs::write(&registry_path, REGISTRY).unwrap();

    let creds = Arc::new(TestCredentials::for_providers(providers));
    let directory = Arc::new(ProviderDirectory::new(creds));
    let resolver = Arc::new(Resolver::new(registry_path, Arc::clone(&directory)));
    let breaker = Arc::new(CircuitBreaker::new());
    let caller = Arc::new(ScriptedCaller::new());
    let engine = Arc::new(ExecutionEngine::with_config(
        Arc::clone(&resolver),
        Arc::clone(&breaker),
        Arc::clone(&caller) as Arc<dyn ModelCaller>,
        EngineConfig {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(2),
            ..EngineConfig::default()
        },
    ));

    let mut role_book = RoleBook::new();
    role_book.insert(
        "security",
        RoleSpec {
            capability: Some("security_detection".to_string()),
            system_prompt: Some("Find vulnerabilities in the provided code.".to_string()),
        },
    );
    role_book.insert(
        "performance",
        RoleSpec {
            capability: Some("general_analysis".to_string()),
            system_prompt: Some("Find performance problems in the provided code.".to_string()),
        },
    );

    let orchestrator = Orchestrator::new(
        directory,
        Arc::new(HealthGuard::new(Arc::new(UpProber))),
        Arc::new(Router::new(resolver, role_book)),
        Arc::new(BudgetGuard::new()),
        Arc::new(ConcurrencyGovernor::new()),
        engine,
        breaker,
        Arc::new(DotDotSandbox),
        SwarmStore::in_memory().unwrap(),
        config,
    );

    Harness { orchestrator, caller, dir }
}

fn harness(providers: &[&str]) -> Harness {
    harness_with(providers, OrchestratorConfig::default())
}

fn task(path: PathBuf, role: &str) -> RawTask {
    RawTask { path, role: Some(role.to_string()), capability: None, instruction: None }
}

#[tokio::test]
async fn test_two_task_batch_succeeds_across_providers() {
    let h = harness(&["groq", "openrouter"]);
    let a = h.subject("auth.rs", "fn login() {}\n");
    let b = h.subject("db.rs", "fn query() {}\n");

    let response = h
        .orchestrator
        .orchestrate(vec![task(a, "security"), task(b, "security")], None)
        .await
        .unwrap();

    assert_eq!(response.total_agents, 2);
    assert_eq!(response.successful, 2);
    assert!(response.failed_roles.is_empty());
    assert!(response.swarm_id.is_some());

    let metrics = response.metrics.unwrap();
    assert_eq!(metrics.total_retries, 0);
    assert_eq!(metrics.provider_switches, 0);
    assert_eq!(metrics.swarm_id, response.swarm_id.unwrap());

    // Same capability group, two healthy providers: round-robin spreads the
    // two tasks across distinct providers.
    let providers: HashSet<&str> = response
        .results
        .iter()
        .filter_map(|r| match r {
            AgentResult::Success { provider, .. } => Some(provider.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(providers.len(), 2);
}

#[tokio::test]
async fn test_rate_limit_retries_on_same_destination() {
    let h = harness(&["groq", "openrouter"]);
    let a = h.subject("auth.rs", "fn login() {}\n");

    // First call 429s, the retry lands on the same destination.
    h.caller.script(
        "openrouter",
        "kimi-k2",
        vec![Err(CallFailure::http(429, "rate limited")), Ok(ScriptedCaller::ok_outcome())],
    );

    let response = h.orchestrator.orchestrate(vec![task(a, "security")], None).await.unwrap();

    assert_eq!(response.successful, 1);
    match &response.results[0] {
        AgentResult::Success { provider, attempts, .. } => {
            assert_eq!(provider, "openrouter");
            assert_eq!(*attempts, 2);
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(response.metrics.unwrap().total_retries, 1);
}

#[tokio::test]
async fn test_exhausted_destination_escalates_down_the_ladder() {
    let h = harness(&["groq", "openrouter"]);
    let a = h.subject("auth.rs", "fn login() {}\n");

    // The assigned destination stays down for both allowed calls; the next
    // ladder rung (same provider, stronger model) answers.
    h.caller.script(
        "openrouter",
        "kimi-k2",
        vec![
            Err(CallFailure::http(503, "upstream down")),
            Err(CallFailure::http(503, "upstream down")),
        ],
    );

    let response = h.orchestrator.orchestrate(vec![task(a, "security")], None).await.unwrap();

    assert_eq!(response.successful, 1);
    match &response.results[0] {
        AgentResult::Success { model, .. } => assert_eq!(model, "gpt-4o"),
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(
        h.caller.calls().iter().filter(|c| *c == "openrouter:kimi-k2").count(),
        2
    );
}

#[tokio::test]
async fn test_invalid_api_key_is_fatal_without_retry() {
    let h = harness(&["groq", "openrouter"]);
    let a = h.subject("auth.rs", "fn login() {}\n");

    h.caller.script(
        "openrouter",
        "kimi-k2",
        vec![Err(CallFailure::http(401, "invalid api key"))],
    );

    let response = h.orchestrator.orchestrate(vec![task(a, "security")], None).await.unwrap();

    assert_eq!(response.fatal, 1);
    match &response.results[0] {
        AgentResult::FatalError { error_type, retryable, .. } => {
            assert_eq!(*error_type, FailureKind::InvalidApiKey);
            assert!(!retryable);
        }
        other => panic!("expected fatal error, got {other:?}"),
    }
    assert_eq!(h.caller.calls().len(), 1);
    assert_eq!(response.failed_roles, vec!["security".to_string()]);
}

#[tokio::test]
async fn test_oversized_subject_rejected_by_budget() {
    let h = harness(&["groq", "openrouter"]);
    // Way past the 32k-token per-task ceiling at ~4 chars per token.
    let big = h.subject("generated.rs", &"x".repeat(200_000));

    let err = h.orchestrator.orchestrate(vec![task(big, "security")], None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::BudgetExceeded(_)));
}

#[tokio::test]
async fn test_batch_cap_and_redundancy_gates() {
    let h = harness(&["groq", "openrouter"]);
    let a = h.subject("auth.rs", "fn login() {}\n");

    let too_many: Vec<RawTask> = (0..16).map(|_| task(a.clone(), "security")).collect();
    assert!(matches!(
        h.orchestrator.orchestrate(too_many, None).await.unwrap_err(),
        OrchestratorError::BatchTooLarge { size: 16, max: 15 }
    ));

    let lone = harness(&["groq"]);
    let b = lone.subject("auth.rs", "fn login() {}\n");
    assert!(matches!(
        lone.orchestrator.orchestrate(vec![task(b, "security")], None).await.unwrap_err(),
        OrchestratorError::InsufficientRedundancy { found: 1, required: 2 }
    ));
}

#[tokio::test]
async fn test_sandbox_rejection_becomes_fatal_result_not_error() {
    let h = harness(&["groq", "openrouter"]);
    let good = h.subject("auth.rs", "fn login() {}\n");
    let bad = PathBuf::from("../outside/secrets.txt");

    let response = h
        .orchestrator
        .orchestrate(vec![task(good, "security"), task(bad, "security")], None)
        .await
        .unwrap();

    assert_eq!(response.total_agents, 2);
    assert_eq!(response.successful, 1);
    assert_eq!(response.fatal, 1);

    let fatal = response
        .results
        .iter()
        .find(|r| matches!(r, AgentResult::FatalError { .. }))
        .unwrap();
    match fatal {
        AgentResult::FatalError { error_type, findings, .. } => {
            assert_eq!(*error_type, FailureKind::SecurityViolation);
            assert_eq!(findings.len(), 1);
            assert_eq!(findings[0].severity, "critical");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_swarm_overflow_reports_exact_line_ranges() {
    let config = OrchestratorConfig {
        max_agents_per_batch: 2,
        // ~40 chars per chunk forces many chunks out of a small file.
        max_chunk_tokens: 10,
        ..OrchestratorConfig::default()
    };
    let h = harness_with(&["groq", "openrouter"], config);

    let lines: String = (1..=40).map(|i| format!("line number {i:03}\n")).collect();
    let big = h.subject("large.rs", &lines);

    let response = h
        .orchestrator
        .orchestrate_swarm(vec![task(big.clone(), "security")], Some("swarm-overflow".to_string()))
        .await
        .unwrap();

    assert_eq!(response.swarm_id.as_deref(), Some("swarm-overflow"));
    // Everything past the two live workers comes back immediately as
    // capacity findings carrying the dropped line range.
    assert!(response.fatal >= 5, "expected at least 5 overflow results, got {}", response.fatal);
    assert_eq!(response.total_agents, 2 + response.fatal);
    for result in &response.results {
        match result {
            AgentResult::FatalError { error_type, findings, .. } => {
                assert_eq!(*error_type, FailureKind::CapacityExceeded);
                assert!(findings[0].description.contains("lines"));
                assert!(findings[0]
                    .location
                    .as_deref()
                    .unwrap()
                    .starts_with(&big.display().to_string()));
            }
            other => panic!("expected overflow fatal, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_swarm_completes_in_background_and_harvests() {
    let config = OrchestratorConfig {
        max_agents_per_batch: 4,
        max_chunk_tokens: 10,
        ..OrchestratorConfig::default()
    };
    let h = harness_with(&["groq", "openrouter"], config);

    let lines: String = (1..=12).map(|i| format!("line number {i:03}\n")).collect();
    let big = h.subject("large.rs", &lines);

    h.orchestrator
        .orchestrate_swarm(vec![task(big, "security")], Some("swarm-bg".to_string()))
        .await
        .unwrap();

    // Poll until the background loop drains.
    let mut harvested = None;
    for _ in 0..100 {
        match h.orchestrator.harvest_swarm("swarm-bg").unwrap() {
            Harvest::Processing => tokio::time::sleep(Duration::from_millis(20)).await,
            Harvest::Ready { batch } => {
                harvested = Some(batch);
                break;
            }
        }
    }

    let batch = harvested.expect("swarm never completed");
    assert_eq!(batch.swarm_id.as_deref(), Some("swarm-bg"));
    assert!(batch.total_agents >= 1);
    assert_eq!(batch.successful, batch.total_agents);
    assert!(batch.results.iter().all(|r| !r.findings().is_empty()));
}

#[tokio::test]
async fn test_harvest_unknown_swarm_is_not_found() {
    let h = harness(&["groq", "openrouter"]);
    assert!(matches!(
        h.orchestrator.harvest_swarm("ghost").unwrap_err(),
        OrchestratorError::SwarmNotFound(_)
    ));
}
