//! Per-node activation events.

use serde::{Deserialize, Serialize};

/// Status carried by an activation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationEventStatus {
    /// The node process is being set up.
    Starting,
    /// The node process is serving.
    Ready,
    /// The node process failed to come up.
    Failed,
}

impl ActivationEventStatus {
    /// `Ready` and `Failed` end the activation cycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, ActivationEventStatus::Ready | ActivationEventStatus::Failed)
    }
}

/// Diagnostic payload of an activation event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationEventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One event on a node's activation stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationEvent {
    pub status: ActivationEventStatus,
    #[serde(default)]
    pub data: ActivationEventData,
}

impl ActivationEvent {
    pub fn starting() -> Self {
        Self {
            status: ActivationEventStatus::Starting,
            data: ActivationEventData::default(),
        }
    }

    pub fn ready() -> Self {
        Self {
            status: ActivationEventStatus::Ready,
            data: ActivationEventData::default(),
        }
    }

    pub fn failed(data: ActivationEventData) -> Self {
        Self {
            status: ActivationEventStatus::Failed,
            data,
        }
    }
}
