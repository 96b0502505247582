//! Apiary - resilient multi-provider inference orchestration.
//!
//! This crate fans analysis tasks out across a pool of LLM providers and
//! brings back one structured response per task, surviving provider
//! outages, rate limits and slow tails along the way:
//! - Capability-based model resolution with a credential-filtered
//!   provider-ladder per task
//! - Health guard, circuit breaker and token budget guard in front of
//!   every dispatch
//! - Keyed concurrency governance with global and per-provider pools
//! - Per-task retry, backoff and model escalation
//! - Synchronous batches and durable background swarms (SQLite-backed)
//!
//! # Example
//!
//! ```rust,no_run
//! use apiary_orchestrator::routing::RawTask;
//!
//! # async fn run(orchestrator: apiary_orchestrator::Orchestrator) -> anyhow::Result<()> {
//! let tasks = vec![RawTask {
//!     path: "src/auth.rs".into(),
//!     role: Some("security".to_string()),
//!     capability: None,
//!     instruction: None,
//! }];
//! let response = orchestrator.orchestrate(tasks, None).await?;
//! println!("{} of {} succeeded", response.successful, response.total_agents);
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod chunker;
pub mod context;
pub mod error;
pub mod executor;
pub mod failure;
pub mod governor;
pub mod health;
pub mod orchestrator;
pub mod provider;
pub mod result;
pub mod routing;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use budget::{BudgetGuard, BudgetVerdict};
pub use error::{OrchestratorError, Result};
pub use executor::{EngineConfig, ExecutionEngine};
pub use failure::{CallFailure, FailureKind};
pub use governor::{ConcurrencyGovernor, GovernorConfig};
pub use health::{HealthGuard, HealthStatus};
pub use orchestrator::{Harvest, Orchestrator, OrchestratorConfig};
pub use provider::{CredentialSource, EnvCredentials, PathSandbox, ProviderDirectory};
pub use result::{AgentResult, BatchResponse, Finding};
pub use routing::{CircuitBreaker, RawTask, Resolver, RoleBook, Router};
pub use store::{SwarmStatus, SwarmStore};
pub use telemetry::SwarmMetrics;
pub use transport::{HttpHealthProber, HttpModelCaller, ModelCaller};
