use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience type alias for Results with ChorusError
pub type Result<T> = std::result::Result<T, ChorusError>;

/// Main error type for Chorus Core
///
/// Every failure raised inside the engine maps onto one of these variants.
/// Each variant corresponds to a stable [`ErrorKind`] used in client-facing
/// error events and HTTP status mapping.
#[derive(Error, Debug)]
pub enum ChorusError {
    #[error("Invalid input: {0}")]
    BadInput(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("LLM provider error: {message}")]
    Llm { message: String, transient: bool },

    #[error("Store error: {store}: {message}")]
    Store { store: String, message: String },

    #[error("Task queue is full")]
    CapacityExhausted,

    #[error("Interrupted")]
    Interrupted,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Agent error: {message}")]
    Agent { message: String },

    #[error("Task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Stable error taxonomy surfaced to clients.
///
/// The string form of each kind is part of the event JSON contract and must
/// not change without versioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadInput,
    Unauthorized,
    NotFound,
    Timeout,
    LlmError,
    StoreError,
    CapacityExhausted,
    Interrupted,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadInput => "bad_input",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::LlmError => "llm_error",
            ErrorKind::StoreError => "store_error",
            ErrorKind::CapacityExhausted => "capacity_exhausted",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Internal => "internal",
        }
    }
}

impl ChorusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChorusError::BadInput(_) => ErrorKind::BadInput,
            ChorusError::Unauthorized => ErrorKind::Unauthorized,
            ChorusError::NotFound(_) => ErrorKind::NotFound,
            ChorusError::Timeout { .. } => ErrorKind::Timeout,
            ChorusError::Llm { .. } | ChorusError::Http(_) => ErrorKind::LlmError,
            ChorusError::Store { .. } => ErrorKind::StoreError,
            ChorusError::CapacityExhausted => ErrorKind::CapacityExhausted,
            ChorusError::Interrupted => ErrorKind::Interrupted,
            ChorusError::Configuration(_)
            | ChorusError::Agent { .. }
            | ChorusError::TaskExecution { .. }
            | ChorusError::Serialization(_)
            | ChorusError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the scheduler may re-enqueue a task that failed with this error.
    ///
    /// Validation and identity failures never retry, transport-level failures
    /// retry within their bounded budget, interruption is always terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChorusError::Timeout { .. } => true,
            ChorusError::Llm { transient, .. } => *transient,
            ChorusError::Http(_) => true,
            ChorusError::Store { .. } => true,
            ChorusError::BadInput(_)
            | ChorusError::Unauthorized
            | ChorusError::NotFound(_)
            | ChorusError::CapacityExhausted
            | ChorusError::Interrupted
            | ChorusError::Configuration(_)
            | ChorusError::Agent { .. }
            | ChorusError::TaskExecution { .. }
            | ChorusError::Serialization(_)
            | ChorusError::Internal(_) => false,
        }
    }

    /// Client-safe message. Internal variants collapse to a generic string so
    /// wrapped error chains never reach the wire.
    pub fn client_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}
