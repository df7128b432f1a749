use hostpanel_core::HostError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error("Site not found: {0}")]
    SiteNotFound(String),

    #[error("Invalid transition for {domain}: {from} -> {to}")]
    InvalidTransition {
        domain: String,
        from: String,
        to: String,
    },

    #[error("Site {0} is being reconciled elsewhere, try again later")]
    Busy(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

impl OrchestratorError {
    /// Whether the error was raised before anything on the host was touched.
    pub fn is_validation(&self) -> bool {
        matches!(self, OrchestratorError::Host(HostError::Validation(_)))
    }
}
