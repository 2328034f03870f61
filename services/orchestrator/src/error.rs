//! Error types for the orchestrator.

use nodeorch_events::InstallId;
use thiserror::Error;

/// Errors talking to the backend task-management service.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The request never produced a response.
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered with a non-success status.
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The response body could not be decoded.
    #[error("malformed response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("invalid backend url: {0}")]
    InvalidUrl(String),

    /// Failure reported by a non-HTTP backend.
    #[error("{0}")]
    Unavailable(String),
}

/// Errors surfaced by orchestrator commands.
///
/// Lock and single-flight rejections are not errors; they come back as
/// [`crate::CommandOutcome::Rejected`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("unknown bundle: {0}")]
    UnknownBundle(String),

    #[error("node {0} is running; deactivate it first")]
    NodeRunning(String),

    #[error("node {node} needs `{field}` before it can be activated")]
    MissingField { node: String, field: &'static str },

    #[error("install {0} is already in flight")]
    InstallInFlight(InstallId),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl OrchestratorError {
    /// Returns true if the error came from the backend rather than local validation.
    pub fn is_backend(&self) -> bool {
        matches!(self, OrchestratorError::Backend(_))
    }
}
