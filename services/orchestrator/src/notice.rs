//! User-facing notices.
//!
//! Every terminal outcome (install finished, node ready, activation failed,
//! node stopped) is announced exactly once on a broadcast channel. Hosts
//! render them as toasts; the CLI prints them.

use nodeorch_events::{DownloadProgressState, InstallId};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::activation::FailureMeta;

const NOTICE_CAPACITY: usize = 256;

/// A single user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// A command was refused without side effects (lock held, already running, ...).
    Rejected { subject: String, reason: String },

    /// The backend accepted an activation and reported where the node logs go.
    LogAvailable { node: String, log_path: String },

    NodeReady { node: String },

    ActivationFailed { node: String, failure: FailureMeta },

    /// `confirmed` is false when the node was still listed as running at the
    /// end of the post-stop poll window.
    NodeStopped { node: String, confirmed: bool },

    NodeDeleted { node: String },

    /// A backend call failed outright.
    CommandFailed {
        subject: String,
        command: String,
        message: String,
    },

    InstallCompleted {
        install_id: InstallId,
        bundle_ref: String,
    },

    InstallFailed {
        install_id: InstallId,
        bundle_ref: String,
        step: Option<String>,
        message: String,
    },

    DownloadCompleted { url: String, file_path: Option<String> },

    DownloadInterrupted {
        url: String,
        state: DownloadProgressState,
    },
}

impl Notice {
    /// Log file a "view logs" action should open, if the notice carries one.
    pub fn log_path(&self) -> Option<&str> {
        match self {
            Notice::LogAvailable { log_path, .. } => Some(log_path),
            Notice::ActivationFailed { failure, .. } => failure.log_path.as_deref(),
            _ => None,
        }
    }

    /// True for notices describing something that went wrong.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Notice::ActivationFailed { .. }
                | Notice::CommandFailed { .. }
                | Notice::InstallFailed { .. }
                | Notice::DownloadInterrupted { .. }
        )
    }
}

/// Broadcast fan-out of notices.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    /// Publish a notice. Having no subscribers is not an error.
    pub fn emit(&self, notice: Notice) {
        if notice.is_error() {
            warn!(notice = ?notice, "Notice");
        } else {
            info!(notice = ?notice, "Notice");
        }
        let _ = self.tx.send(notice);
    }
}
