//! Bundle installation pipeline.
//!
//! One install job may be in flight at a time. A job walks the fixed step
//! order (authenticate, download, verify, unpack, persist, activate, ready)
//! purely from events on its job-scoped stream; the client never advances a
//! step on its own.
//!
//! ## Step rules
//!
//! - An event for step *k* forces every step before *k* to `Done`, so a late
//!   or dropped event can never leave an earlier step behind
//! - A `Done` step never goes back
//! - `done` on `ready` completes the job; `failed` on any step fails it
//! - Step keys outside the canonical order are logged and ignored

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nodeorch_events::{EventError, InstallEvent, InstallEventStatus, InstallId, InstallStep};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::client::{BundleDescriptor, InstallRequest};
use crate::error::{BackendError, OrchestratorError};
use crate::notice::{Notice, Notifier};
use crate::registry::NodeRegistry;
use crate::stream::{EventStream, StreamRegistry, SubscriptionToken};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

// =============================================================================
// Job
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepState {
    pub key: InstallStep,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    InFlight,
    Succeeded,
    Failed,
}

/// Where and why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallFailure {
    pub step: InstallStep,
    pub message: Option<String>,
}

/// Effect of applying one event to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTransition {
    Progress,
    Completed,
    Failed,
    /// The job had already finished; the event was dropped.
    Ignored,
}

/// State of one bundle install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallationJob {
    pub install_id: InstallId,
    pub bundle_ref: String,
    pub steps: Vec<StepState>,
    /// Download progress, 0..=100. Set to 100 on completion.
    pub progress_percent: u8,
    /// Human-readable byte progress, e.g. `"12.5 / 80.0 MB"`.
    pub progress_text: Option<String>,
    pub outcome: JobOutcome,
    pub failure: Option<InstallFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl InstallationJob {
    /// A fresh job: every step pending except the first, which is active.
    pub fn new(install_id: InstallId, bundle_ref: impl Into<String>) -> Self {
        let steps = InstallStep::ORDER
            .iter()
            .enumerate()
            .map(|(i, key)| StepState {
                key: *key,
                status: if i == 0 {
                    StepStatus::Active
                } else {
                    StepStatus::Pending
                },
            })
            .collect();

        Self {
            install_id,
            bundle_ref: bundle_ref.into(),
            steps,
            progress_percent: 0,
            progress_text: None,
            outcome: JobOutcome::InFlight,
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome != JobOutcome::InFlight
    }

    pub fn step_status(&self, step: InstallStep) -> StepStatus {
        self.steps[step.index()].status
    }

    /// The furthest step that is not pending.
    pub fn current_step(&self) -> InstallStep {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status != StepStatus::Pending)
            .map_or(InstallStep::ORDER[0], |s| s.key)
    }

    /// Apply one stream event.
    ///
    /// Returns [`EventError::UnknownStep`] for keys outside the canonical order;
    /// the job is left untouched in that case.
    pub fn apply(&mut self, event: &InstallEvent) -> Result<StepTransition, EventError> {
        let step = event.step()?;
        if self.is_finished() {
            return Ok(StepTransition::Ignored);
        }

        let ci = step.index();
        for earlier in &mut self.steps[..ci] {
            earlier.status = StepStatus::Done;
        }

        let current = &mut self.steps[ci].status;
        if *current != StepStatus::Done {
            *current = match event.status {
                InstallEventStatus::Active => StepStatus::Active,
                InstallEventStatus::Done => StepStatus::Done,
                InstallEventStatus::Failed => StepStatus::Failed,
            };
        }

        if step == InstallStep::Download {
            if let (Some(received), Some(total)) = (event.received_bytes, event.total_bytes) {
                if total > 0 {
                    self.progress_percent = download_percent(received, total);
                    self.progress_text = Some(format!(
                        "{:.1} / {:.1} MB",
                        received as f64 / BYTES_PER_MB,
                        total as f64 / BYTES_PER_MB
                    ));
                }
            }
        }

        match event.status {
            InstallEventStatus::Failed => {
                self.outcome = JobOutcome::Failed;
                self.failure = Some(InstallFailure {
                    step,
                    message: event.message.clone(),
                });
                self.finished_at = Some(Utc::now());
                Ok(StepTransition::Failed)
            }
            InstallEventStatus::Done if step.is_final() => {
                self.outcome = JobOutcome::Succeeded;
                self.progress_percent = 100;
                self.finished_at = Some(Utc::now());
                Ok(StepTransition::Completed)
            }
            _ => Ok(StepTransition::Progress),
        }
    }

    /// Fail the job at its current step without an event from the backend.
    pub fn fail(&mut self, message: impl Into<String>) {
        let step = self.current_step();
        let state = &mut self.steps[step.index()].status;
        if *state != StepStatus::Done {
            *state = StepStatus::Failed;
        }
        self.outcome = JobOutcome::Failed;
        self.failure = Some(InstallFailure {
            step,
            message: Some(message.into()),
        });
        self.finished_at = Some(Utc::now());
    }

    fn failure_notice(&self) -> Notice {
        let (step, message) = match &self.failure {
            Some(failure) => (
                Some(failure.step.to_string()),
                failure.message.clone().unwrap_or_else(|| "install failed".to_string()),
            ),
            None => (None, "install failed".to_string()),
        };
        Notice::InstallFailed {
            install_id: self.install_id,
            bundle_ref: self.bundle_ref.clone(),
            step,
            message,
        }
    }
}

/// `floor(received * 100 / total)`, capped at 100.
pub fn download_percent(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (u128::from(received) * 100) / u128::from(total);
    percent.min(100) as u8
}

// =============================================================================
// Pipeline
// =============================================================================

#[derive(Default)]
struct PipelineState {
    /// The single in-flight job.
    in_flight: Option<InstallationJob>,
    last_finished: Option<InstallationJob>,
}

/// Drives bundle installs, one at a time.
pub struct InstallationPipeline {
    backend: Arc<dyn Backend>,
    registry: Arc<NodeRegistry>,
    streams: Arc<StreamRegistry>,
    notifier: Notifier,
    state: Mutex<PipelineState>,
    bundles: RwLock<Vec<BundleDescriptor>>,
}

impl InstallationPipeline {
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<NodeRegistry>,
        streams: Arc<StreamRegistry>,
        notifier: Notifier,
    ) -> Self {
        Self {
            backend,
            registry,
            streams,
            notifier,
            state: Mutex::new(PipelineState::default()),
            bundles: RwLock::new(Vec::new()),
        }
    }

    /// Fetch the bundle catalog and cache it.
    pub async fn load_bundles(&self) -> Result<Vec<BundleDescriptor>, BackendError> {
        let bundles = self.backend.fetch_bundles().await?;
        debug!(count = bundles.len(), "Loaded bundle catalog");
        *self.bundles.write().await = bundles.clone();
        Ok(bundles)
    }

    /// Cached bundle catalog.
    pub async fn bundles(&self) -> Vec<BundleDescriptor> {
        self.bundles.read().await.clone()
    }

    async fn resolve_bundle(&self, bundle_ref: &str) -> Result<BundleDescriptor, OrchestratorError> {
        let cached = self
            .bundles
            .read()
            .await
            .iter()
            .find(|b| b.bundle_ref == bundle_ref)
            .cloned();
        if let Some(bundle) = cached {
            return Ok(bundle);
        }

        self.load_bundles()
            .await?
            .into_iter()
            .find(|b| b.bundle_ref == bundle_ref)
            .ok_or_else(|| OrchestratorError::UnknownBundle(bundle_ref.to_string()))
    }

    /// ID of the in-flight job, if any.
    pub async fn in_flight(&self) -> Option<InstallId> {
        self.state.lock().await.in_flight.as_ref().map(|job| job.install_id)
    }

    /// The in-flight job, or the most recently finished one.
    pub async fn current(&self) -> Option<InstallationJob> {
        let state = self.state.lock().await;
        state
            .in_flight
            .clone()
            .or_else(|| state.last_finished.clone())
    }

    /// Start installing a bundle.
    ///
    /// Fails with [`OrchestratorError::InstallInFlight`] without any side
    /// effect while another job is running.
    pub async fn start(self: &Arc<Self>, bundle_ref: &str) -> Result<InstallId, OrchestratorError> {
        if self.streams.is_shut_down() {
            return Err(OrchestratorError::ShuttingDown);
        }
        if let Some(id) = self.in_flight().await {
            return Err(OrchestratorError::InstallInFlight(id));
        }

        let bundle = self.resolve_bundle(bundle_ref).await?;

        let install_id = {
            let mut state = self.state.lock().await;
            if let Some(job) = &state.in_flight {
                return Err(OrchestratorError::InstallInFlight(job.install_id));
            }
            let job = InstallationJob::new(InstallId::new(), bundle_ref);
            let id = job.install_id;
            state.in_flight = Some(job);
            id
        };

        info!(install_id = %install_id, bundle_ref = %bundle_ref, "Starting bundle install");

        let request = InstallRequest { install_id, bundle };
        let install_id = match self.backend.install_bundle(&request).await {
            Ok(response) => response.install_id,
            Err(e) => return Err(self.abort_start(install_id, e).await),
        };

        if install_id != request.install_id {
            debug!(
                requested = %request.install_id,
                assigned = %install_id,
                "Backend assigned a different install id"
            );
            if let Some(job) = self.state.lock().await.in_flight.as_mut() {
                job.install_id = install_id;
            }
        }

        let events = match self.backend.subscribe_install(&install_id).await {
            Ok(events) => events,
            Err(e) => return Err(self.abort_start(install_id, e).await),
        };

        let pipeline = Arc::clone(self);
        let opened = self
            .streams
            .open_install(format!("install:{install_id}"), move |token| {
                pipeline.consume(install_id, events, token)
            })
            .await;
        if opened.is_none() {
            return Err(OrchestratorError::ShuttingDown);
        }

        Ok(install_id)
    }

    /// The install call or subscription failed: flag step 0 and clear the slot.
    async fn abort_start(&self, install_id: InstallId, error: BackendError) -> OrchestratorError {
        warn!(install_id = %install_id, error = %error, "Bundle install failed to start");

        let notice = {
            let mut state = self.state.lock().await;
            match state.in_flight.take() {
                Some(mut job) => {
                    job.steps[0].status = StepStatus::Failed;
                    job.outcome = JobOutcome::Failed;
                    job.failure = Some(InstallFailure {
                        step: InstallStep::ORDER[0],
                        message: Some(error.to_string()),
                    });
                    job.finished_at = Some(Utc::now());
                    let notice = job.failure_notice();
                    state.last_finished = Some(job);
                    Some(notice)
                }
                None => None,
            }
        };

        if let Some(notice) = notice {
            self.notifier.emit(notice);
        }
        OrchestratorError::Backend(error)
    }

    async fn consume(
        self: Arc<Self>,
        install_id: InstallId,
        mut events: EventStream<InstallEvent>,
        mut token: SubscriptionToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;

                _ = token.closed() => {
                    debug!(install_id = %install_id, "Install subscription closed");
                    return;
                }

                event = events.next() => event,
            };

            let finished = match event {
                Some(event) => self.handle_event(install_id, &event).await,
                None => {
                    warn!(install_id = %install_id, "Install stream ended before a terminal event");
                    self.finish(install_id, |job| {
                        job.fail("install event stream ended unexpectedly");
                        StepTransition::Failed
                    })
                    .await;
                    true
                }
            };

            if finished {
                break;
            }
        }

        self.streams.release_install(token.id()).await;
    }

    /// Returns true once the job reached a terminal state.
    async fn handle_event(&self, install_id: InstallId, event: &InstallEvent) -> bool {
        debug!(
            install_id = %install_id,
            step = %event.step,
            status = ?event.status,
            "Install event"
        );

        let mut error = None;
        let transition = self
            .finish(install_id, |job| match job.apply(event) {
                Ok(transition) => transition,
                Err(e) => {
                    error = Some(e);
                    StepTransition::Ignored
                }
            })
            .await;

        if let Some(e) = error {
            warn!(install_id = %install_id, error = %e, "Ignoring install event");
        }

        matches!(transition, Some(StepTransition::Completed | StepTransition::Failed))
    }

    /// Run `update` on the in-flight job. A terminal transition moves the job
    /// out of the slot, refreshes the registry and emits one notice.
    ///
    /// Returns `None` if `install_id` is no longer the in-flight job.
    async fn finish<F>(&self, install_id: InstallId, update: F) -> Option<StepTransition>
    where
        F: FnOnce(&mut InstallationJob) -> StepTransition,
    {
        let (transition, notice) = {
            let mut state = self.state.lock().await;
            let job = state
                .in_flight
                .as_mut()
                .filter(|job| job.install_id == install_id)?;

            let transition = update(job);
            if !matches!(transition, StepTransition::Completed | StepTransition::Failed) {
                return Some(transition);
            }

            let job = state.in_flight.take()?;
            let notice = match job.outcome {
                JobOutcome::Succeeded => Notice::InstallCompleted {
                    install_id: job.install_id,
                    bundle_ref: job.bundle_ref.clone(),
                },
                _ => job.failure_notice(),
            };
            state.last_finished = Some(job);
            (transition, notice)
        };

        info!(install_id = %install_id, outcome = ?transition, "Bundle install finished");
        self.registry.refresh().await;
        self.notifier.emit(notice);
        Some(transition)
    }
}
