//! Platform download progress tracking.
//!
//! The host platform reports progress of the (single) bundle download through
//! an [`EventStream`] it feeds. The tracker keeps a last-write-wins snapshot
//! and announces completion or interruption.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nodeorch_events::{DownloadProgressEvent, DownloadProgressState};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::install::download_percent;
use crate::notice::{Notice, Notifier};
use crate::stream::{EventStream, StreamRegistry, SubscriptionToken};

/// How the last download ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DownloadTerminal {
    Completed { file_path: Option<String> },
    Interrupted { reason: DownloadProgressState },
}

/// Snapshot of the platform download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadState {
    pub active: bool,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub percent: u8,
    pub url: String,
    pub terminal_state: Option<DownloadTerminal>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DownloadState {
    fn apply(&mut self, event: &DownloadProgressEvent) {
        self.received_bytes = event.received_bytes;
        self.total_bytes = event.total_bytes;
        self.url = event.url.clone();
        self.updated_at = Some(Utc::now());

        match event.state {
            DownloadProgressState::Progressing => {
                self.active = true;
                self.percent = download_percent(event.received_bytes, event.total_bytes);
                self.terminal_state = None;
            }
            DownloadProgressState::Completed => {
                self.active = false;
                self.percent = 100;
                self.terminal_state = Some(DownloadTerminal::Completed {
                    file_path: event.file_path.clone(),
                });
            }
            state => {
                self.active = false;
                self.terminal_state = Some(DownloadTerminal::Interrupted { reason: state });
            }
        }
    }
}

/// Last-write-wins cache of platform download progress.
pub struct DownloadTracker {
    streams: Arc<StreamRegistry>,
    notifier: Notifier,
    state: RwLock<DownloadState>,
}

impl DownloadTracker {
    pub fn new(streams: Arc<StreamRegistry>, notifier: Notifier) -> Self {
        Self {
            streams,
            notifier,
            state: RwLock::new(DownloadState::default()),
        }
    }

    /// Start consuming the platform progress stream.
    ///
    /// Only the first call subscribes; later calls return false and drop
    /// their stream.
    pub async fn start(self: &Arc<Self>, events: EventStream<DownloadProgressEvent>) -> bool {
        let tracker = Arc::clone(self);
        self.streams
            .open_download(move |token| tracker.consume(events, token))
            .await
            .is_some()
    }

    pub async fn state(&self) -> DownloadState {
        self.state.read().await.clone()
    }

    async fn consume(
        self: Arc<Self>,
        mut events: EventStream<DownloadProgressEvent>,
        mut token: SubscriptionToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;

                _ = token.closed() => break,

                event = events.next() => event,
            };

            match event {
                Some(event) => self.apply(event).await,
                None => {
                    debug!("Download progress source ended");
                    break;
                }
            }
        }
    }

    async fn apply(&self, event: DownloadProgressEvent) {
        self.state.write().await.apply(&event);

        match event.state {
            DownloadProgressState::Progressing => {}
            DownloadProgressState::Completed => self.notifier.emit(Notice::DownloadCompleted {
                url: event.url,
                file_path: event.file_path,
            }),
            state => self.notifier.emit(Notice::DownloadInterrupted {
                url: event.url,
                state,
            }),
        }
    }
}
