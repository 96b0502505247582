//! Failure classification for inference calls.
//!
//! Determines whether a call failure is transient (retryable) or fatal
//! (hard-stop), and categorizes fatal failures for structured reporting.
//! Classification is a pure function of the failure metadata, independent
//! of the execution engine that consumes it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// HTTP status codes that are safe to retry.
const RETRYABLE_STATUS_CODES: [u16; 3] = [429, 503, 504];

/// Transport-level error codes that are safe to retry.
const RETRYABLE_ERROR_CODES: [&str; 4] = ["ETIMEDOUT", "ECONNRESET", "UND_ERR_CONNECT_TIMEOUT", "ABORT_ERR"];

/// A failure raised by a single inference call attempt.
///
/// Carries HTTP-style metadata (status and provider error code) so the
/// classification functions can decide retryability without knowing which
/// transport produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    /// HTTP status code, if the failure came from a response.
    pub status: Option<u16>,
    /// Transport or provider error code (e.g. `ECONNRESET`, `ABORT_ERR`).
    pub code: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl CallFailure {
    /// Creates a failure from an HTTP response status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self { status: Some(status), code: None, message: message.into() }
    }

    /// Creates a failure from an HTTP response status with a provider error code.
    pub fn http_with_code(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { status: Some(status), code: Some(code.into()), message: message.into() }
    }

    /// Creates a network-level failure (no HTTP status available).
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { status: None, code: Some(code.into()), message: message.into() }
    }

    /// Creates a per-attempt timeout failure.
    pub fn timeout(elapsed_ms: u64, target: &str) -> Self {
        Self {
            status: None,
            code: Some("ABORT_ERR".to_string()),
            message: format!("Timeout after {elapsed_ms}ms on {target}"),
        }
    }

    /// Short machine-readable tag for attempt logs and diagnostics.
    pub fn error_tag(&self) -> String {
        if let Some(code) = &self.code {
            return code.clone();
        }
        if let Some(status) = self.status {
            return status.to_string();
        }
        "unknown".to_string()
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CallFailure {}

/// Determines if a failure is transient and safe to retry.
///
/// Retryable: 429 (rate limit), 503 (service unavailable), 504 (gateway
/// timeout), network timeouts, connection resets, aborted attempts.
///
/// NOT retryable: 400, 401, 403, 404, schema violations.
pub fn is_retryable(failure: &CallFailure) -> bool {
    if let Some(status) = failure.status {
        if RETRYABLE_STATUS_CODES.contains(&status) {
            return true;
        }
    }
    if let Some(code) = &failure.code {
        if RETRYABLE_ERROR_CODES.contains(&code.as_str()) {
            return true;
        }
    }
    false
}

/// Machine-readable category for a non-retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Authentication failed (401/403).
    InvalidApiKey,
    /// The request body was malformed (400).
    InvalidRequest,
    /// The requested model does not exist (404).
    ModelNotFound,
    /// The prompt exceeded the provider's payload limit (413).
    PromptTooLarge,
    /// No model in the registry satisfies the requested capability.
    NoCandidates,
    /// The path sandbox rejected the task's subject file.
    SecurityViolation,
    /// An exception escaped a dispatched operation and was normalized
    /// at the dispatch boundary.
    RuntimeTaskError,
    /// The swarm's live-worker slots were full; the caller must process
    /// the dropped range itself.
    CapacityExceeded,
    /// Anything else.
    UnknownError,
}

impl FailureKind {
    /// Stable snake_case tag used in serialized results.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::InvalidApiKey => "invalid_api_key",
            FailureKind::InvalidRequest => "invalid_request",
            FailureKind::ModelNotFound => "model_not_found",
            FailureKind::PromptTooLarge => "prompt_too_large",
            FailureKind::NoCandidates => "no_candidates",
            FailureKind::SecurityViolation => "security_violation",
            FailureKind::RuntimeTaskError => "runtime_task_error",
            FailureKind::CapacityExceeded => "capacity_exceeded",
            FailureKind::UnknownError => "unknown_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classifies a non-retryable failure into a [`FailureKind`].
pub fn classify(failure: &CallFailure) -> FailureKind {
    match failure.status {
        Some(401 | 403) => FailureKind::InvalidApiKey,
        Some(400) => FailureKind::InvalidRequest,
        Some(404) => FailureKind::ModelNotFound,
        Some(413) => FailureKind::PromptTooLarge,
        _ => FailureKind::UnknownError,
    }
}
