//! # Pipeline Error Types
//!
//! All fallible component boundaries in the pipeline return
//! [`PipelineResult`]. Errors are plain data: the persister decides
//! whether a failure is retryable, the circuit breaker decides whether
//! it should count against a circuit, and the error manager maps it
//! into the user-facing taxonomy.

use thiserror::Error;

/// Main result type used throughout the pipeline
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error types for the telemetry pipeline
///
/// Each variant represents a different failure category. The
/// `#[error("...")]` attribute from `thiserror` implements `Display`.
#[derive(Debug, Error, Clone)]
pub enum PipelineError {
    /// Configuration validation failures
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The named circuit is open and the operation was gated off
    #[error("Circuit open for '{circuit}'")]
    CircuitOpen { circuit: String },

    /// The persister queue is at its bound and the entry was rejected
    #[error("Queue full for '{stream}' ({limit} entries)")]
    QueueFull { stream: String, limit: usize },

    /// A transport call to the remote collector failed
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// A transport call failed after the full retry budget
    #[error("Retry budget exhausted after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },

    /// Entry serialization failed (size accounting or payload encoding)
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// A bus handler rejected an event
    #[error("Event handler failed for '{event}': {message}")]
    EventHandler { event: String, message: String },

    /// Aggregation bookkeeping failed
    #[error("Aggregation error: {message}")]
    Aggregation { message: String },

    /// Unexpected internal failure
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a transport error with a custom message
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Create an aggregation error with a custom message
    pub fn aggregation<S: Into<String>>(message: S) -> Self {
        Self::Aggregation { message: message.into() }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether a send that failed with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Whether this error should count against a circuit
    pub fn should_trigger_circuit_breaker(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::RetryExhausted { .. } | Self::QueueFull { .. }
        )
    }

    /// Stable string tag for events and metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::QueueFull { .. } => "queue_full",
            Self::Transport { .. } => "transport_error",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Serialization { .. } => "serialization_error",
            Self::EventHandler { .. } => "event_handler_error",
            Self::Aggregation { .. } => "aggregation_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization { message: err.to_string() }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport { message: err.to_string() }
    }
}
