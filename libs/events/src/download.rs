//! Platform-level download progress events.

use serde::{Deserialize, Serialize};

/// State reported by the platform download mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadProgressState {
    Progressing,
    Completed,
    Interrupted,
    Cancelled,
    Failed,
}

impl DownloadProgressState {
    /// `interrupted`, `cancelled` and `failed` all end a download without a file.
    pub fn is_interruption(self) -> bool {
        matches!(
            self,
            DownloadProgressState::Interrupted
                | DownloadProgressState::Cancelled
                | DownloadProgressState::Failed
        )
    }
}

/// One progress update for the (single) platform download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgressEvent {
    pub state: DownloadProgressState,
    #[serde(default)]
    pub received_bytes: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_deserialization() {
        let json = r#"{"state":"progressing","receivedBytes":10,"totalBytes":40,"url":"https://x/b.zip"}"#;
        let event: DownloadProgressEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.state, DownloadProgressState::Progressing);
        assert_eq!(event.received_bytes, 10);
        assert_eq!(event.total_bytes, 40);
        assert!(event.file_path.is_none());
    }

    #[test]
    fn test_interruption_states() {
        assert!(DownloadProgressState::Interrupted.is_interruption());
        assert!(DownloadProgressState::Cancelled.is_interruption());
        assert!(DownloadProgressState::Failed.is_interruption());
        assert!(!DownloadProgressState::Completed.is_interruption());
        assert!(!DownloadProgressState::Progressing.is_interruption());
    }
}
