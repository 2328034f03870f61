//! # nodeorch-events
//!
//! Wire contracts for the server-pushed streams the node orchestrator consumes.
//!
//! ## Design Principles
//!
//! - Events are facts reported by the backend; the client never authors them
//! - Events within one stream are ordered; events across streams are not
//! - Unknown values are surfaced as errors at decode time, never guessed
//!
//! ## Streams
//!
//! - Install events (`/v1/installs/{install_id}/events`): one per bundle install job
//! - Activation events (`/v1/nodes/{name}/events`): one per node activation cycle
//! - Download progress: a single platform-level source, one download at a time
//!
//! All stream payloads are JSON objects with camelCase field names, delivered
//! one per SSE `data:` frame.

mod activation;
mod download;
mod error;
mod id;
mod install;

pub use activation::{ActivationEvent, ActivationEventData, ActivationEventStatus};
pub use download::{DownloadProgressEvent, DownloadProgressState};
pub use error::EventError;
pub use id::InstallId;
pub use install::{InstallEvent, InstallEventStatus, InstallStep};

/// Decode a single event payload (the body of one SSE `data:` frame).
pub fn decode_event<T: serde::de::DeserializeOwned>(payload: &str) -> Result<T, EventError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(EventError::InvalidPayload("empty payload".to_string()));
    }
    Ok(serde_json::from_str(payload)?)
}
