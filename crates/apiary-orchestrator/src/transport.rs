//! Network transport for inference calls and liveness probes.
//!
//! The transport owns the per-attempt timeout and the translation of
//! HTTP/network faults into [`CallFailure`] metadata; everything
//! provider-specific (request shape, response shape) goes through the
//! [`ProviderAdapter`] collaborator.

use crate::failure::CallFailure;
use crate::provider::{OutputRepair, ProviderAdapter, ProviderDirectory, TokenUsage, WireRequest};
use crate::result::Finding;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One inference call attempt against a specific (provider, model) pair.
#[derive(Debug, Clone)]
pub struct ModelCall<'a> {
    /// Target provider name.
    pub provider: &'a str,
    /// Provider-specific model string.
    pub model: &'a str,
    /// System prompt (role instruction plus output contract).
    pub system_prompt: &'a str,
    /// User prompt (subject content plus resolved context).
    pub user_prompt: &'a str,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

/// Successful outcome of one inference call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Findings parsed from the assistant response.
    pub findings: Vec<Finding>,
    /// Token usage reported by the provider.
    pub usage: TokenUsage,
    /// Round-trip latency of the call.
    pub latency: Duration,
}

/// Executes a single inference attempt. Does NOT retry: retry and
/// escalation logic live in the execution engine.
#[async_trait]
pub trait ModelCaller: Send + Sync {
    /// Runs one attempt, classifiable failure on any error path.
    async fn call(&self, request: ModelCall<'_>) -> std::result::Result<CallOutcome, CallFailure>;
}

/// Issues a lightweight liveness probe against a provider.
#[async_trait]
pub trait HealthProber: Send + Sync {
    /// Probes the provider, returning round-trip latency on success.
    async fn probe(&self, provider: &str) -> std::result::Result<Duration, CallFailure>;
}

/// reqwest-backed [`ModelCaller`].
pub struct HttpModelCaller {
    client: reqwest::Client,
    directory: Arc<ProviderDirectory>,
    adapter: Arc<dyn ProviderAdapter>,
    repair: Arc<dyn OutputRepair>,
    max_output_tokens: u32,
}

impl HttpModelCaller {
    /// Creates a caller over the given directory and protocol adapter.
    pub fn new(
        directory: Arc<ProviderDirectory>,
        adapter: Arc<dyn ProviderAdapter>,
        repair: Arc<dyn OutputRepair>,
        max_output_tokens: u32,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            directory,
            adapter,
            repair,
            max_output_tokens,
        }
    }

    async fn send(
        &self,
        request: &WireRequest,
        timeout: Duration,
        target: &str,
    ) -> std::result::Result<serde_json::Value, CallFailure> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| CallFailure::network("BAD_METHOD", format!("Invalid method {}", request.method)))?;

        let mut builder = self.client.request(method, &request.url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                CallFailure::timeout(started.elapsed().as_millis() as u64, target)
            } else if err.is_connect() {
                CallFailure::network("ECONNRESET", err.to_string())
            } else {
                CallFailure::network("NETWORK_ERROR", err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            // Best-effort extraction of the provider's own error code.
            let provider_code = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|payload| {
                    payload
                        .pointer("/error/type")
                        .or_else(|| payload.pointer("/error/code"))
                        .or_else(|| payload.get("code"))
                        .and_then(|v| v.as_str().map(ToString::to_string))
                });

            let message = format!("HTTP {} from {target}", status.as_u16());
            return Err(match provider_code {
                Some(code) => CallFailure::http_with_code(status.as_u16(), code, message),
                None => CallFailure::http(status.as_u16(), message),
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| CallFailure::network("BAD_RESPONSE", err.to_string()))
    }

    fn parse_findings(&self, content: &str) -> std::result::Result<Vec<Finding>, CallFailure> {
        let value = match serde_json::from_str::<serde_json::Value>(content) {
            Ok(value) => value,
            Err(_) => self.repair.repair(content).ok_or_else(|| {
                CallFailure::http_with_code(
                    422,
                    "VALIDATION_ERROR",
                    "Model output was not valid JSON and could not be repaired",
                )
            })?,
        };

        serde_json::from_value::<Vec<Finding>>(value).map_err(|err| {
            CallFailure::http_with_code(422, "VALIDATION_ERROR", format!("Model output violated the findings schema: {err}"))
        })
    }
}

#[async_trait]
impl ModelCaller for HttpModelCaller {
    async fn call(&self, request: ModelCall<'_>) -> std::result::Result<CallOutcome, CallFailure> {
        let config = self
            .directory
            .config(request.provider)
            .map_err(|err| CallFailure::network("CONFIG_ERROR", err.to_string()))?;

        let wire = self.adapter.build_request(
            &config,
            request.system_prompt,
            request.user_prompt,
            request.model,
            self.max_output_tokens,
        );

        let target = format!("{}/{}", request.provider, request.model);
        let started = Instant::now();
        let body = self.send(&wire, request.timeout, &target).await?;
        let latency = started.elapsed();

        let content = self.adapter.extract_content(&config, &body).ok_or_else(|| {
            CallFailure::http_with_code(422, "VALIDATION_ERROR", format!("No assistant content in response from {target}"))
        })?;

        let findings = self.parse_findings(&content)?;
        let usage = self.adapter.extract_usage(&config, &body);

        debug!(
            target = %target,
            latency_ms = latency.as_millis() as u64,
            findings = findings.len(),
            tokens = usage.total(),
            "Inference call succeeded"
        );

        Ok(CallOutcome { findings, usage, latency })
    }
}

/// reqwest-backed [`HealthProber`] with a short hard timeout.
pub struct HttpHealthProber {
    client: reqwest::Client,
    directory: Arc<ProviderDirectory>,
    adapter: Arc<dyn ProviderAdapter>,
    timeout: Duration,
}

impl HttpHealthProber {
    /// Default probe timeout: generous enough to avoid transient false
    /// positives, short enough not to stall verification.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);

    /// Creates a prober with the default timeout.
    pub fn new(directory: Arc<ProviderDirectory>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            client: reqwest::Client::new(),
            directory,
            adapter,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

#[async_trait]
impl HealthProber for HttpHealthProber {
    async fn probe(&self, provider: &str) -> std::result::Result<Duration, CallFailure> {
        let config = self
            .directory
            .config(provider)
            .map_err(|err| CallFailure::network("CONFIG_ERROR", err.to_string()))?;
        let request = self.adapter.build_health_check_request(&config);

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| CallFailure::network("BAD_METHOD", format!("Invalid method {}", request.method)))?;
        let mut builder = self.client.request(method, &request.url).timeout(self.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let started = Instant::now();
        match builder.send().await {
            Ok(response) if response.status().is_success() => Ok(started.elapsed()),
            Ok(response) => {
                warn!(provider = %provider, status = response.status().as_u16(), "Health probe rejected");
                Err(CallFailure::http(response.status().as_u16(), format!("Probe rejected by {provider}")))
            }
            Err(err) => Err(if err.is_timeout() {
                CallFailure::timeout(started.elapsed().as_millis() as u64, provider)
            } else {
                CallFailure::network("ECONNRESET", err.to_string())
            }),
        }
    }
}
