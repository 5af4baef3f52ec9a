//! Error types for deployd

use thiserror::Error;

use crate::protocol::Stage;

/// Main error type for the orchestrator and the execution agent
#[derive(Error, Debug)]
pub enum DeployError {
    /// Malformed task input, rejected before persistence
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Illegal task status transition
    #[error("State error: {0}")]
    StateError(String),

    /// Secret tamper or app id mismatch
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    /// Execution agent unreachable or stream interrupted
    #[error("Transport error: {0}")]
    TransportError(String),

    /// A pipeline stage failed on the agent side
    #[error("Execution error ({stage}): {message}")]
    ExecutionError { stage: Stage, message: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timed out: {0}")]
    TimedOut(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Shorthand for an agent-side stage failure
    pub fn execution(stage: Stage, message: impl Into<String>) -> Self {
        DeployError::ExecutionError {
            stage,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}
