//! Candidate ladder resolution.
//!
//! Maps a capability to a prioritized, credential-filtered list of
//! (provider, model) candidates. Insertion order is the escalation order
//! used by the execution engine, so the ordering must be deterministic for
//! a given registry and credential snapshot.

use crate::error::{OrchestratorError, Result};
use crate::provider::ProviderDirectory;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default provider escalation priority. Unlisted providers (e.g. customs)
/// are appended in lexical order.
const DEFAULT_PROVIDER_PRIORITY: [&str; 8] = [
    "openrouter",
    "groq",
    "openai",
    "anthropic",
    "google",
    "together",
    "mistral",
    "fireworks",
];

/// How long a loaded registry stays fresh. Short enough that registry
/// edits take effect without a restart.
const REGISTRY_CACHE_TTL: Duration = Duration::from_secs(60);

/// One logical model entry in the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Logical model name (provider-independent).
    pub name: String,
    /// Capability keys this model satisfies.
    pub capabilities: Vec<String>,
    /// Provider name -> provider-specific model string.
    pub providers: HashMap<String, String>,
    /// Whether the model runs with an extended reasoning budget.
    #[serde(default)]
    pub extended_budget: bool,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    models: Vec<ModelSpec>,
}

/// One (provider, model) pairing capable of serving a capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCandidate {
    /// Provider name.
    pub provider: String,
    /// Provider-specific model string.
    pub model_string: String,
    /// Logical model name shared across providers.
    pub logical_model: String,
    /// Extended-budget flag inherited from the model spec.
    pub extended_budget: bool,
}

struct CachedRegistry {
    loaded_at: Instant,
    models: Arc<Vec<ModelSpec>>,
}

/// Resolves capability requirements into candidate ladders.
pub struct Resolver {
    registry_path: PathBuf,
    directory: Arc<ProviderDirectory>,
    provider_priority: Vec<String>,
    cache_ttl: Duration,
    cache: RwLock<Option<CachedRegistry>>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("registry_path", &self.registry_path)
            .field("provider_priority", &self.provider_priority)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Creates a resolver over a JSON model registry file.
    pub fn new(registry_path: PathBuf, directory: Arc<ProviderDirectory>) -> Self {
        Self::with_priority(
            registry_path,
            directory,
            DEFAULT_PROVIDER_PRIORITY.iter().map(ToString::to_string).collect(),
        )
    }

    /// Creates a resolver with a custom provider priority list.
    pub fn with_priority(
        registry_path: PathBuf,
        directory: Arc<ProviderDirectory>,
        provider_priority: Vec<String>,
    ) -> Self {
        Self {
            registry_path,
            directory,
            provider_priority,
            cache_ttl: REGISTRY_CACHE_TTL,
            cache: RwLock::new(None),
        }
    }

    /// Overrides the registry cache TTL (tests shrink this).
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    fn load_registry(&self) -> Result<Arc<Vec<ModelSpec>>> {
        {
            let cache = self.cache.read().expect("resolver cache lock poisoned");
            if let Some(cached) = cache.as_ref() {
                if cached.loaded_at.elapsed() < self.cache_ttl {
                    return Ok(Arc::clone(&cached.models));
                }
            }
        }

        let raw = std::fs::read_to_string(&self.registry_path).map_err(|err| {
            OrchestratorError::Registry(format!("Cannot read {}: {err}", self.registry_path.display()))
        })?;
        let parsed: RegistryFile = serde_json::from_str(&raw)
            .map_err(|err| OrchestratorError::Registry(format!("Invalid model registry: {err}")))?;

        debug!(
            path = %self.registry_path.display(),
            models = parsed.models.len(),
            "Model registry reloaded"
        );

        let models = Arc::new(parsed.models);
        let mut cache = self.cache.write().expect("resolver cache lock poisoned");
        *cache = Some(CachedRegistry { loaded_at: Instant::now(), models: Arc::clone(&models) });
        Ok(models)
    }

    /// Full provider escalation order: the configured priority list, then
    /// every other known provider in lexical order.
    fn priority_order(&self) -> Vec<String> {
        let mut order = self.provider_priority.clone();
        let mut extras: Vec<String> = self
            .directory
            .provider_names()
            .into_iter()
            .filter(|name| !order.contains(name))
            .collect();
        extras.sort();
        order.extend(extras);
        order
    }

    /// Resolves the candidate ladder for a capability.
    ///
    /// Candidates are grouped by provider priority, then by registry order
    /// within a provider. Providers without valid credentials never appear.
    ///
    /// # Errors
    /// `NoCandidates` when no model supports the capability;
    /// `NoCredentialedProvider` when models match but no provider is usable.
    pub fn resolve(&self, capability: &str) -> Result<Vec<ModelCandidate>> {
        let models = self.load_registry()?;

        let matching: Vec<&ModelSpec> = models
            .iter()
            .filter(|spec| spec.capabilities.iter().any(|c| c == capability))
            .collect();

        if matching.is_empty() {
            return Err(OrchestratorError::NoCandidates { capability: capability.to_string() });
        }

        let mut candidates = Vec::new();
        for provider in self.priority_order() {
            if !self.directory.has_credentials(&provider) {
                continue;
            }
            for spec in &matching {
                if let Some(model_string) = spec.providers.get(&provider) {
                    candidates.push(ModelCandidate {
                        provider: provider.clone(),
                        model_string: model_string.clone(),
                        logical_model: spec.name.clone(),
                        extended_budget: spec.extended_budget,
                    });
                }
            }
        }

        if candidates.is_empty() {
            warn!(capability = %capability, "Models match but no credentialed provider serves them");
            return Err(OrchestratorError::NoCredentialedProvider { capability: capability.to_string() });
        }

        Ok(candidates)
    }
}
