//! Error types for the logfleet orchestrator

use thiserror::Error;

use crate::remote::channel::SshError;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Illegal transition: cannot {action} while {state}")]
    IllegalTransition { state: String, action: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Environment error: {0}")]
    EnvironmentError(String),

    #[error("Remote error: {0}")]
    RemoteError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Errors that reject a request before anything is attempted remotely
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ValidationError(_)
                | OrchestratorError::IllegalTransition { .. }
                | OrchestratorError::NotFound(_)
        )
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}

impl From<SshError> for OrchestratorError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::ToolMissing { .. } => OrchestratorError::EnvironmentError(err.to_string()),
            SshError::Timeout { .. } => OrchestratorError::Timeout(err.to_string()),
            other => OrchestratorError::RemoteError(other.to_string()),
        }
    }
}
