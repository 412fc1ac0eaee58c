//! Error types for capability resolution.
//!
//! Every fallible layer has its own `thiserror` enum; the resolver folds them
//! into [`ResolutionError`] and, at the public boundary, into an [`ErrorKind`]
//! carried by a structured failure result.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed resolution, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The registry returned no usable provider.
    NoProvidersAvailable,
    /// Binding would close an unresolvable dependency cycle.
    CircularDependency,
    /// The store or evaluation exceeded its time bound.
    ResolutionTimeout,
    /// Malformed capability or consumer.
    InvalidRequest,
    /// Binding created but not durably recorded.
    StorePersistenceWarning,
    /// The caller abandoned the resolution.
    Cancelled,
    /// Anything else (store backend failure, selector invariant breach).
    Internal,
}

impl ErrorKind {
    /// Stable snake_case name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoProvidersAvailable => "no_providers_available",
            ErrorKind::CircularDependency => "circular_dependency",
            ErrorKind::ResolutionTimeout => "resolution_timeout",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::StorePersistenceWarning => "store_persistence_warning",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a metadata store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend did not answer within the configured bound.
    #[error("Store operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Connection or I/O level failure.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A persisted value could not be encoded or decoded.
    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors raised while picking a provider from scored candidates.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// `select` was called with an empty candidate list.
    #[error("No candidates to select from for capability '{capability}'")]
    NoCandidates { capability: String },
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config value for {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Errors returned by a provider handle when invoked.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Provider '{0}' has no registered handle")]
    MissingHandle(String),

    #[error("Provider input rejected: {0}")]
    InvalidInput(String),
}

/// Errors raised by an auto-generation collaborator.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation request for '{capability}' was rejected: {message}")]
    Rejected { capability: String, message: String },

    #[error("Generation channel closed")]
    ChannelClosed,
}

/// Errors raised when registering monitoring for a binding.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Monitoring registration failed: {0}")]
    RegistrationFailed(String),
}

/// Errors surfaced by the resolver pipeline.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("No providers available for capability '{capability}'")]
    NoProvidersAvailable { capability: String },

    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency {
        cycle: Vec<String>,
        suggestion: Option<String>,
    },

    #[error("Resolution timed out during {stage}")]
    Timeout { stage: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Resolution cancelled before {stage}")]
    Cancelled { stage: String },

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ResolutionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout { operation, .. } => ResolutionError::Timeout { stage: operation },
            other => ResolutionError::Store(other),
        }
    }
}

impl ResolutionError {
    /// Public classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolutionError::NoProvidersAvailable { .. } => ErrorKind::NoProvidersAvailable,
            ResolutionError::CircularDependency { .. } => ErrorKind::CircularDependency,
            ResolutionError::Timeout { .. } => ErrorKind::ResolutionTimeout,
            ResolutionError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ResolutionError::Cancelled { .. } => ErrorKind::Cancelled,
            ResolutionError::Selection(_) | ResolutionError::Store(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller should degrade gracefully rather than abort.
    ///
    /// Cycles and malformed requests are never eligible: proceeding would be
    /// unsafe or meaningless.
    pub fn fallback_required(&self) -> bool {
        !matches!(
            self,
            ResolutionError::CircularDependency { .. } | ResolutionError::InvalidRequest(_)
        )
    }
}
