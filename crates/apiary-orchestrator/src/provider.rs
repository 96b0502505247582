//! Provider configuration and collaborator seams.
//!
//! The orchestrator never speaks a provider's wire protocol itself: request
//! shaping and response extraction are delegated to a [`ProviderAdapter`]
//! selected by the protocol tag on the provider's configuration. This module
//! owns the built-in provider table, credential lookup, and the optional
//! on-disk registry of custom provider definitions.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Wire protocol family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireProtocol {
    /// OpenAI-compatible chat completions.
    ChatCompletions,
    /// Messages-style protocol.
    Messages,
    /// Generate-content style protocol.
    GenerateContent,
}

/// Resolved configuration for one provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Provider name (lowercase).
    pub name: String,
    /// Base URL for API requests.
    pub base_url: String,
    /// API key, absent only when the provider allows anonymous access.
    pub api_key: Option<String>,
    /// Protocol family used to select the adapter.
    pub protocol: WireProtocol,
}

struct BuiltinProvider {
    name: &'static str,
    env_key: &'static str,
    base_url: &'static str,
    protocol: WireProtocol,
}

const BUILTIN_PROVIDERS: [BuiltinProvider; 8] = [
    BuiltinProvider {
        name: "openrouter",
        env_key: "OPENROUTER_API_KEY",
        base_url: "https://api.openrouter.ai/api/v1",
        protocol: WireProtocol::ChatCompletions,
    },
    BuiltinProvider {
        name: "openai",
        env_key: "OPENAI_API_KEY",
        base_url: "https://api.openai.com/v1",
        protocol: WireProtocol::ChatCompletions,
    },
    BuiltinProvider {
        name: "anthropic",
        env_key: "ANTHROPIC_API_KEY",
        base_url: "https://api.anthropic.com/v1",
        protocol: WireProtocol::Messages,
    },
    BuiltinProvider {
        name: "google",
        env_key: "GOOGLE_API_KEY",
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        protocol: WireProtocol::GenerateContent,
    },
    BuiltinProvider {
        name: "groq",
        env_key: "GROQ_API_KEY",
        base_url: "https://api.groq.com/openai/v1",
        protocol: WireProtocol::ChatCompletions,
    },
    BuiltinProvider {
        name: "together",
        env_key: "TOGETHER_API_KEY",
        base_url: "https://api.together.xyz/v1",
        protocol: WireProtocol::ChatCompletions,
    },
    BuiltinProvider {
        name: "mistral",
        env_key: "MISTRAL_API_KEY",
        base_url: "https://api.mistral.ai/v1",
        protocol: WireProtocol::ChatCompletions,
    },
    BuiltinProvider {
        name: "fireworks",
        env_key: "FIREWORKS_API_KEY",
        base_url: "https://api.fireworks.ai/inference/v1",
        protocol: WireProtocol::ChatCompletions,
    },
];

/// Key-value credential lookup, environment-backed in production.
///
/// Injectable so tests can run against a fixed key set.
pub trait CredentialSource: Send + Sync {
    /// Looks up a credential by its key name. Blank values count as absent.
    fn lookup(&self, key: &str) -> Option<String>;
}

/// [`CredentialSource`] backed by process environment variables.
#[derive(Debug, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn lookup(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

/// A custom provider definition from the on-disk registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomProviderSpec {
    /// Provider name (lowercase).
    pub name: String,
    /// Protocol family for adapter selection.
    pub protocol: WireProtocol,
    /// Env key holding the base URL.
    pub base_url_key: String,
    /// Whether the provider accepts unauthenticated requests.
    #[serde(default)]
    pub optional_auth: bool,
    /// Env key that must be truthy for the provider to participate.
    #[serde(default)]
    pub enabled_key: Option<String>,
}

impl CustomProviderSpec {
    fn api_key_env(&self) -> String {
        format!("{}_API_KEY", self.name.to_uppercase())
    }
}

/// Directory of known providers and their credentials.
pub struct ProviderDirectory {
    credentials: Arc<dyn CredentialSource>,
    custom: Vec<CustomProviderSpec>,
}

impl std::fmt::Debug for ProviderDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDirectory")
            .field("custom_providers", &self.custom.len())
            .finish_non_exhaustive()
    }
}

impl ProviderDirectory {
    /// Creates a directory with the built-in provider table only.
    pub fn new(credentials: Arc<dyn CredentialSource>) -> Self {
        Self { credentials, custom: Vec::new() }
    }

    /// Creates a directory that also loads custom provider definitions
    /// from a JSON registry file.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    /// A missing file is not an error: the directory falls back to the
    /// built-in table.
    pub fn with_custom_registry(credentials: Arc<dyn CredentialSource>, path: &Path) -> Result<Self> {
        let custom = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let specs: Vec<CustomProviderSpec> = serde_json::from_str(&raw)?;
            debug!(path = %path.display(), count = specs.len(), "Loaded custom provider registry");
            specs
        } else {
            Vec::new()
        };
        Ok(Self { credentials, custom })
    }

    fn custom_enabled(&self, spec: &CustomProviderSpec) -> bool {
        match &spec.enabled_key {
            Some(key) => self
                .credentials
                .lookup(key)
                .is_some_and(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes")),
            None => true,
        }
    }

    /// All provider names known to this directory, built-ins first.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = BUILTIN_PROVIDERS.iter().map(|p| p.name.to_string()).collect();
        for spec in &self.custom {
            if self.custom_enabled(spec) {
                names.push(spec.name.clone());
            }
        }
        names
    }

    /// Whether a provider has usable credentials (or allows anonymous access).
    pub fn has_credentials(&self, provider: &str) -> bool {
        let provider = provider.to_lowercase();
        if let Some(builtin) = BUILTIN_PROVIDERS.iter().find(|p| p.name == provider) {
            return self.credentials.lookup(builtin.env_key).is_some();
        }
        if let Some(spec) = self.custom.iter().find(|s| s.name == provider) {
            if !self.custom_enabled(spec) {
                return false;
            }
            return spec.optional_auth || self.credentials.lookup(&spec.api_key_env()).is_some();
        }
        false
    }

    /// Provider names with usable credentials, in directory order.
    pub fn credentialed_providers(&self) -> Vec<String> {
        self.provider_names()
            .into_iter()
            .filter(|p| self.has_credentials(p))
            .collect()
    }

    /// Resolves the full configuration for a provider.
    ///
    /// # Errors
    /// Returns `UnknownProvider` for names outside the directory and
    /// `MissingCredentials` when a required API key is absent.
    pub fn config(&self, provider: &str) -> Result<ProviderConfig> {
        let provider = provider.to_lowercase();

        if let Some(builtin) = BUILTIN_PROVIDERS.iter().find(|p| p.name == provider) {
            let api_key = self
                .credentials
                .lookup(builtin.env_key)
                .ok_or_else(|| OrchestratorError::MissingCredentials(provider.clone()))?;
            return Ok(ProviderConfig {
                name: provider,
                base_url: builtin.base_url.to_string(),
                api_key: Some(api_key),
                protocol: builtin.protocol,
            });
        }

        if let Some(spec) = self.custom.iter().find(|s| s.name == provider) {
            let base_url = self
                .credentials
                .lookup(&spec.base_url_key)
                .ok_or_else(|| OrchestratorError::Registry(format!("Missing base URL ({}) for provider {provider}", spec.base_url_key)))?;
            let api_key = self.credentials.lookup(&spec.api_key_env());
            if api_key.is_none() && !spec.optional_auth {
                return Err(OrchestratorError::MissingCredentials(provider));
            }
            return Ok(ProviderConfig {
                name: provider,
                base_url,
                api_key,
                protocol: spec.protocol,
            });
        }

        Err(OrchestratorError::UnknownProvider(provider))
    }
}

/// A fully shaped outbound request, ready for the transport.
#[derive(Debug, Clone)]
pub struct WireRequest {
    /// Absolute request URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// JSON body, if the request carries one.
    pub body: Option<serde_json::Value>,
}

/// Prompt/completion token counts reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens produced by the completion.
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Total tokens for the call.
    pub fn total(self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Wire-protocol translation collaborator, one implementation per protocol
/// family. Consumed as a black box: the orchestrator only routes through it.
pub trait ProviderAdapter: Send + Sync {
    /// Builds a provider-specific inference request.
    fn build_request(
        &self,
        config: &ProviderConfig,
        system_prompt: &str,
        user_prompt: &str,
        model: &str,
        max_tokens: u32,
    ) -> WireRequest;

    /// Extracts the assistant text from a provider-specific response body.
    fn extract_content(&self, config: &ProviderConfig, body: &serde_json::Value) -> Option<String>;

    /// Extracts token usage from a provider-specific response body.
    fn extract_usage(&self, config: &ProviderConfig, body: &serde_json::Value) -> TokenUsage;

    /// Builds a lightweight liveness probe request.
    fn build_health_check_request(&self, config: &ProviderConfig) -> WireRequest;
}

/// Salvage collaborator: repairs malformed model output into a candidate
/// JSON structure, or gives up.
pub trait OutputRepair: Send + Sync {
    /// Attempts to coerce raw model text into a JSON value.
    fn repair(&self, raw: &str) -> Option<serde_json::Value>;
}

/// Verdict from the path sandbox collaborator.
#[derive(Debug, Clone)]
pub struct PathValidation {
    /// Whether the path may be read.
    pub valid: bool,
    /// Root-resolved path, when valid.
    pub normalized_path: Option<PathBuf>,
    /// Rejection reason, when invalid.
    pub reason: Option<String>,
}

impl PathValidation {
    /// An accepted path.
    pub fn accept(normalized: PathBuf) -> Self {
        Self { valid: true, normalized_path: Some(normalized), reason: None }
    }

    /// A rejected path.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self { valid: false, normalized_path: None, reason: Some(reason.into()) }
    }
}

/// Filesystem sandboxing collaborator (traversal/symlink/size checks).
pub trait PathSandbox: Send + Sync {
    /// Validates a task's subject path against the workspace root.
    fn validate_path(&self, path: &Path, root: Option<&Path>) -> PathValidation;
}


#[cfg(test)]
mod tests {
    use super::test_support::StaticCredentials;
    use super::*;

    #[test]
    fn test_builtin_provider_lookup() {
        let creds = Arc::new(StaticCredentials::for_providers(&["groq"]));
        let directory = ProviderDirectory::new(creds);

        assert!(directory.has_credentials("groq"));
        assert!(!directory.has_credentials("openai"));
        assert!(!directory.has_credentials("nonexistent"));

        let config = directory.config("groq").unwrap();
        assert_eq!(config.protocol, WireProtocol::ChatCompletions);
        assert_eq!(config.api_key.as_deref(), Some("test-key"));
    }

    #[test]
    fn test_missing_credentials_error() {
        let directory = ProviderDirectory::new(Arc::new(StaticCredentials::new(&[])));
        assert!(matches!(
            directory.config("openai"),
            Err(OrchestratorError::MissingCredentials(_))
        ));
        assert!(matches!(
            directory.config("not-a-provider"),
            Err(OrchestratorError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_credentialed_providers_filters_and_orders() {
        let creds = Arc::new(StaticCredentials::for_providers(&["openai", "groq"]));
        let directory = ProviderDirectory::new(creds);
        // Directory order: built-in table order.
        assert_eq!(directory.credentialed_providers(), vec!["openai", "groq"]);
    }

    #[test]
    fn test_custom_provider_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join("providers.json");
        std::fs::write(
            &registry_path,
            r#"[{"name": "localllm", "protocol": "chat_completions",
                 "base_url_key": "LOCALLLM_BASE_URL", "optional_auth": true,
                 "enabled_key": "LOCALLLM_ENABLED"}]"#,
        )
        .unwrap();

        let creds = Arc::new(StaticCredentials::new(&[
            ("LOCALLLM_BASE_URL", "http://127.0.0.1:8080/v1"),
            ("LOCALLLM_ENABLED", "true"),
        ]));
        let directory = ProviderDirectory::with_custom_registry(creds, &registry_path).unwrap();

        assert!(directory.provider_names().contains(&"localllm".to_string()));
        assert!(directory.has_credentials("localllm"));
        let config = directory.config("localllm").unwrap();
        assert_eq!(config.base_url, "http://127.0.0.1:8080/v1");
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_custom_provider_disabled_by_flag() {
        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join("providers.json");
        std::fs::write(
            &registry_path,
            r#"[{"name": "localllm", "protocol": "chat_completions",
                 "base_url_key": "LOCALLLM_BASE_URL", "optional_auth": true,
                 "enabled_key": "LOCALLLM_ENABLED"}]"#,
        )
        .unwrap();

        let creds = Arc::new(StaticCredentials::new(&[("LOCALLLM_BASE_URL", "http://x")]));
        let directory = ProviderDirectory::with_custom_registry(creds, &registry_path).unwrap();
        assert!(!directory.has_credentials("localllm"));
    }
}
