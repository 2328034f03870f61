//! Error types for event decoding.

use thiserror::Error;

/// Errors that can occur when decoding events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The install step key is not part of the canonical step order.
    #[error("unknown install step: {0}")]
    UnknownStep(String),

    /// The event payload is invalid.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The install ID string is malformed.
    #[error("invalid install id: {0}")]
    InvalidId(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
