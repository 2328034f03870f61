//! Bundle install job events.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EventError;

/// Canonical install steps, in the order the backend executes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStep {
    Authenticate,
    Download,
    Verify,
    Unpack,
    Persist,
    Activate,
    Ready,
}

impl InstallStep {
    /// All steps in canonical order.
    pub const ORDER: [InstallStep; 7] = [
        InstallStep::Authenticate,
        InstallStep::Download,
        InstallStep::Verify,
        InstallStep::Unpack,
        InstallStep::Persist,
        InstallStep::Activate,
        InstallStep::Ready,
    ];

    /// Position of this step in the canonical order.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The final step; `done` on it completes the job.
    pub fn is_final(self) -> bool {
        self == InstallStep::Ready
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstallStep::Authenticate => "authenticate",
            InstallStep::Download => "download",
            InstallStep::Verify => "verify",
            InstallStep::Unpack => "unpack",
            InstallStep::Persist => "persist",
            InstallStep::Activate => "activate",
            InstallStep::Ready => "ready",
        }
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallStep {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstallStep::ORDER
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| EventError::UnknownStep(s.to_string()))
    }
}

/// Status carried by an install event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallEventStatus {
    Active,
    Done,
    Failed,
}

/// One event on an install job stream.
///
/// The step is kept as the raw key so a newer backend announcing an extra
/// step does not break decoding of the whole stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallEvent {
    pub step: String,
    pub status: InstallEventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl InstallEvent {
    /// Build an event for a known step.
    pub fn new(step: InstallStep, status: InstallEventStatus) -> Self {
        Self {
            step: step.as_str().to_string(),
            status,
            received_bytes: None,
            total_bytes: None,
            message: None,
        }
    }

    /// Attach byte progress (meaningful for the download step).
    pub fn with_bytes(mut self, received: u64, total: u64) -> Self {
        self.received_bytes = Some(received);
        self.total_bytes = Some(total);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Resolve the step key against the canonical order.
    pub fn step(&self) -> Result<InstallStep, EventError> {
        self.step.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_order_indices_are_positions() {
        for (i, step) in InstallStep::ORDER.iter().enumerate() {
            assert_eq!(step.index(), i);
        }
        assert!(InstallStep::Ready.is_final());
        assert!(!InstallStep::Persist.is_final());
    }

    #[test]
    fn test_unknown_step_is_an_error() {
        let event: InstallEvent =
            serde_json::from_str(r#"{"step":"warmup","status":"active"}"#).unwrap();
        assert_eq!(event.step(), Err(EventError::UnknownStep("warmup".to_string())));
    }

    #[test]
    fn test_download_event_deserialization() {
        let json = r#"{"step":"download","status":"active","receivedBytes":500,"totalBytes":1000}"#;
        let event: InstallEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.step().unwrap(), InstallStep::Download);
        assert_eq!(event.status, InstallEventStatus::Active);
        assert_eq!(event.received_bytes, Some(500));
        assert_eq!(event.total_bytes, Some(1000));
        assert!(event.message.is_none());
    }

    #[test]
    fn test_failed_event_serialization_skips_empty_fields() {
        let event = InstallEvent::new(InstallStep::Verify, InstallEventStatus::Failed)
            .with_message("checksum mismatch");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"status\":\"failed\""));
        assert!(json.contains("\"message\":\"checksum mismatch\""));
        assert!(!json.contains("receivedBytes"));
    }

    proptest! {
        #[test]
        fn prop_only_canonical_keys_parse(key in "[a-z_]{1,12}") {
            let known = InstallStep::ORDER.iter().any(|step| step.as_str() == key);
            prop_assert_eq!(key.parse::<InstallStep>().is_ok(), known);
        }
    }
}
