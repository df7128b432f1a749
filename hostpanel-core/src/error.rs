use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    /// Bad domain, database identifier or account name. Raised before any side effect.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An OS or process level create operation failed.
    #[error("Resource creation failed: {0}")]
    ResourceCreation(String),

    /// A generated configuration did not pass its syntax check.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("Command timed out after {secs}s: {command}")]
    Timeout { command: String, secs: u64 },

    #[error("Dependency unmet: {0}")]
    DependencyUnmet(String),

    #[error("Command failed with exit code {code:?}: {command}\n{stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serializable classification of a [`HostError`], persisted with step outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ResourceCreation,
    ConfigValidation,
    ExternalTimeout,
    DependencyUnmet,
    CommandFailed,
    InvalidTransition,
    NotFound,
    Lock,
    Config,
    Internal,
}

impl HostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::Validation(_) => ErrorKind::Validation,
            HostError::ResourceCreation(_) => ErrorKind::ResourceCreation,
            HostError::ConfigValidation(_) => ErrorKind::ConfigValidation,
            HostError::Timeout { .. } => ErrorKind::ExternalTimeout,
            HostError::DependencyUnmet(_) => ErrorKind::DependencyUnmet,
            HostError::CommandFailed { .. } => ErrorKind::CommandFailed,
            HostError::InvalidTransition(_) => ErrorKind::InvalidTransition,
            HostError::NotFound(_) => ErrorKind::NotFound,
            HostError::Lock(_) => ErrorKind::Lock,
            HostError::Config(_) => ErrorKind::Config,
            HostError::Template(_) | HostError::Serialization(_) | HostError::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether re-running the reconciliation may succeed without operator changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ExternalTimeout
                | ErrorKind::CommandFailed
                | ErrorKind::ResourceCreation
                | ErrorKind::DependencyUnmet
                | ErrorKind::Lock
                | ErrorKind::Internal
        )
    }
}

impl From<serde_yaml_ng::Error> for HostError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        HostError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        HostError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
