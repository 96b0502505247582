// Error types for orchestration

use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Orchestration errors.
///
/// These are whole-batch, pre-flight failures: once dispatch has started,
/// per-task failure is always encoded in `AgentResult` instead.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Fewer credentialed providers than the redundancy floor requires
    #[error("Insufficient redundancy: found {found} credentialed provider(s), at least {required} required")]
    InsufficientRedundancy {
        /// Number of providers with valid credentials
        found: usize,
        /// Minimum required
        required: usize,
    },

    /// Batch exceeds the hard scale cap
    #[error("Batch size {size} exceeds maximum limit of {max}")]
    BatchTooLarge {
        /// Requested batch size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Every credentialed provider is marked DEAD
    #[error("No healthy providers available to service the batch")]
    NoHealthyProviders,

    /// Budget guard rejected the batch before dispatch
    #[error("Token budget exceeded: {0}")]
    BudgetExceeded(String),

    /// No model in the registry supports the requested capability
    #[error("No model supports capability '{capability}'")]
    NoCandidates {
        /// The capability that could not be satisfied
        capability: String,
    },

    /// Models exist for the capability, but no provider has credentials
    #[error("No credentialed provider available for capability '{capability}'")]
    NoCredentialedProvider {
        /// The capability that could not be served
        capability: String,
    },

    /// The candidate ladder for a capability has no healthy provider left
    #[error("No healthy provider can serve capability '{capability}'")]
    NoHealthyProvider {
        /// The capability that could not be served
        capability: String,
    },

    /// Unknown provider name
    #[error("Unsupported provider: {0}")]
    UnknownProvider(String),

    /// Provider is known but its API key is missing
    #[error("API key missing for provider: {0}")]
    MissingCredentials(String),

    /// Harvest requested for an unknown swarm id
    #[error("Swarm {0} not found")]
    SwarmNotFound(String),

    /// Model registry file is missing or malformed
    #[error("Model registry error: {0}")]
    Registry(String),

    /// A task is missing both a usable role and a custom instruction
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// A dispatched operation escaped its slot (panic or abort)
    #[error("Dispatched task failed unexpectedly: {0}")]
    TaskPanicked(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Store(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
