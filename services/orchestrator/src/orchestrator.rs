//! Composition root.
//!
//! The [`Orchestrator`] owns every component and is the single entry point
//! for presentation-layer commands. Commands check the node lock before doing
//! anything; a command refused because of the lock (or because the node is
//! already running) has no side effects and comes back as
//! [`CommandOutcome::Rejected`] plus a [`Notice::Rejected`].

use std::sync::Arc;

use nodeorch_events::{DownloadProgressEvent, InstallId};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::activation::{
    request_from_config, ActivationController, ActivationStatus, FailureMeta,
    ManualActivationForm, RegisterOutcome, StopReport,
};
use crate::backend::Backend;
use crate::client::{BundleDescriptor, RegisterRequest, RunningInfo, RuntimeConfig};
use crate::config::Config;
use crate::download::{DownloadState, DownloadTracker};
use crate::error::OrchestratorError;
use crate::guard::{ConcurrencyGuard, LockIntent};
use crate::install::{InstallationJob, InstallationPipeline};
use crate::notice::{Notice, Notifier};
use crate::registry::{readiness, Category, NodeRegistry, Readiness, RefreshReport, TaskNode};
use crate::stream::{EventStream, StreamRegistry};

/// Result of a command that may be refused without side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome<T = ()> {
    Accepted(T),
    Rejected { reason: String },
}

impl<T> CommandOutcome<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandOutcome::Accepted(_))
    }

    pub fn accepted(self) -> Option<T> {
        match self {
            CommandOutcome::Accepted(value) => Some(value),
            CommandOutcome::Rejected { .. } => None,
        }
    }
}

/// How an activation request proceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationPath {
    /// Registration accepted; the node's event stream now drives its status.
    Started { log_path: Option<String> },
    /// The persisted config is incomplete; the user must fill in the form.
    NeedsManualInput(ManualActivationForm),
    /// The backend refused the registration. The node is now `Failed`.
    Refused { message: String },
}

/// Merged view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeView {
    pub name: String,
    pub category_id: Option<String>,
    pub runtime_config: RuntimeConfig,
    pub bundle_exists: bool,
    pub readiness: Readiness,
    pub status: ActivationStatus,
    pub running: Option<RunningInfo>,
    pub lock: Option<LockIntent>,
    pub failure: Option<FailureMeta>,
}

impl NodeView {
    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|info| info.running)
    }
}

/// Client-side node lifecycle orchestrator.
pub struct Orchestrator {
    config: Config,
    registry: Arc<NodeRegistry>,
    guard: Arc<ConcurrencyGuard>,
    streams: Arc<StreamRegistry>,
    notifier: Notifier,
    installs: Arc<InstallationPipeline>,
    activation: Arc<ActivationController>,
    downloads: Arc<DownloadTracker>,
    refresh_shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(config: Config, backend: Arc<dyn Backend>) -> Self {
        let registry = Arc::new(NodeRegistry::new(backend.clone()));
        let guard = Arc::new(ConcurrencyGuard::new());
        let streams = Arc::new(StreamRegistry::new());
        let notifier = Notifier::new();

        let installs = Arc::new(InstallationPipeline::new(
            backend.clone(),
            registry.clone(),
            streams.clone(),
            notifier.clone(),
        ));
        let activation = Arc::new(ActivationController::new(
            &config,
            backend,
            registry.clone(),
            guard.clone(),
            streams.clone(),
            notifier.clone(),
        ));
        let downloads = Arc::new(DownloadTracker::new(streams.clone(), notifier.clone()));
        let (refresh_shutdown, _) = watch::channel(false);

        Self {
            config,
            registry,
            guard,
            streams,
            notifier,
            installs,
            activation,
            downloads,
            refresh_shutdown,
        }
    }

    /// Load catalog, running status and the bundle catalog.
    ///
    /// Each fetch fails on its own; whatever succeeded is kept.
    pub async fn initialize(&self) -> RefreshReport {
        let (report, bundles) = tokio::join!(self.registry.refresh(), self.installs.load_bundles());
        if let Err(e) = bundles {
            warn!(error = %e, "Bundle catalog fetch failed");
        }
        info!(
            catalog = report.catalog_updated,
            running = report.running_updated,
            "Orchestrator initialized"
        );
        report
    }

    fn ensure_running(&self) -> Result<(), OrchestratorError> {
        if self.streams.is_shut_down() {
            return Err(OrchestratorError::ShuttingDown);
        }
        Ok(())
    }

    fn reject<T>(&self, subject: &str, reason: String) -> CommandOutcome<T> {
        debug!(subject = %subject, reason = %reason, "Command rejected");
        self.notifier.emit(Notice::Rejected {
            subject: subject.to_string(),
            reason: reason.clone(),
        });
        CommandOutcome::Rejected { reason }
    }

    /// Refusal reason if the node cannot start a new activation right now.
    async fn activation_blocker(&self, node: &str) -> Option<String> {
        if let Some(holder) = self.guard.holder(node).await {
            return Some(format!("{node} is already {holder}"));
        }
        let status = self.activation.status(node).await;
        if status == ActivationStatus::Ready || self.registry.is_running(node).await {
            return Some(format!("{node} is already running"));
        }
        if !status.can_activate() {
            return Some(format!("{node} is already starting"));
        }
        None
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// One-click activation from the persisted runtime config.
    ///
    /// Returns [`ActivationPath::NeedsManualInput`] when the config is not
    /// complete enough; nothing is sent to the backend in that case.
    pub async fn activate(
        &self,
        node: &str,
        factory: &str,
    ) -> Result<CommandOutcome<ActivationPath>, OrchestratorError> {
        self.ensure_running()?;
        let task = self.known_node(node).await?;

        if let Some(reason) = self.activation_blocker(node).await {
            return Ok(self.reject(node, reason));
        }

        if !readiness(&task.runtime_config).is_ready() {
            let form = ManualActivationForm::from_config(node, &task.runtime_config);
            debug!(node = %node, missing = ?form.missing_fields(), "Activation needs manual input");
            return Ok(CommandOutcome::Accepted(ActivationPath::NeedsManualInput(form)));
        }

        let request = request_from_config(node, factory, &task.runtime_config)?;
        self.launch(node, request).await
    }

    /// Form pre-filled from whatever config the node has persisted.
    pub async fn open_manual_activation(
        &self,
        node: &str,
    ) -> Result<ManualActivationForm, OrchestratorError> {
        let task = self.known_node(node).await?;
        Ok(ManualActivationForm::from_config(node, &task.runtime_config))
    }

    /// Activate with user-supplied fields.
    ///
    /// Fails with [`OrchestratorError::MissingField`] and no side effects if a
    /// required field is empty.
    pub async fn submit_manual_activation(
        &self,
        form: &ManualActivationForm,
        factory: &str,
    ) -> Result<CommandOutcome<ActivationPath>, OrchestratorError> {
        self.ensure_running()?;
        self.known_node(&form.node).await?;
        let request = form.to_request(factory)?;

        if let Some(reason) = self.activation_blocker(&form.node).await {
            return Ok(self.reject(&form.node, reason));
        }
        self.launch(&form.node, request).await
    }

    async fn launch(
        &self,
        node: &str,
        request: RegisterRequest,
    ) -> Result<CommandOutcome<ActivationPath>, OrchestratorError> {
        if let Err(holder) = self.guard.try_acquire(node, LockIntent::Activating).await {
            return Ok(self.reject(node, format!("{node} is already {holder}")));
        }

        let path = match self.activation.start(node, request).await? {
            RegisterOutcome::Accepted { log_path } => ActivationPath::Started { log_path },
            RegisterOutcome::Refused { message } => ActivationPath::Refused { message },
        };
        Ok(CommandOutcome::Accepted(path))
    }

    /// Stop a node and wait (bounded) for it to leave the running set.
    pub async fn deactivate(
        &self,
        node: &str,
    ) -> Result<CommandOutcome<StopReport>, OrchestratorError> {
        self.ensure_running()?;
        if !self.registry.contains(node).await && self.registry.running_info(node).await.is_none() {
            return Err(OrchestratorError::UnknownNode(node.to_string()));
        }

        if let Err(holder) = self.guard.try_acquire(node, LockIntent::Deactivating).await {
            return Ok(self.reject(node, format!("{node} is already {holder}")));
        }

        let report = self.activation.deactivate(node).await?;
        Ok(CommandOutcome::Accepted(report))
    }

    /// Delete a node that is neither running nor locked.
    pub async fn delete(&self, node: &str) -> Result<CommandOutcome, OrchestratorError> {
        self.ensure_running()?;
        self.known_node(node).await?;

        if let Some(holder) = self.guard.holder(node).await {
            return Ok(self.reject(node, format!("{node} is already {holder}")));
        }
        if self.registry.is_running(node).await {
            return Err(OrchestratorError::NodeRunning(node.to_string()));
        }

        if let Err(holder) = self.guard.try_acquire(node, LockIntent::Deactivating).await {
            return Ok(self.reject(node, format!("{node} is already {holder}")));
        }
        let result = self.activation.delete(node).await;
        self.guard.release(node).await;

        result.map(CommandOutcome::Accepted)
    }

    /// Start a bundle install; refused while another install is in flight.
    pub async fn install(
        &self,
        bundle_ref: &str,
    ) -> Result<CommandOutcome<InstallId>, OrchestratorError> {
        self.ensure_running()?;
        match self.installs.start(bundle_ref).await {
            Ok(install_id) => Ok(CommandOutcome::Accepted(install_id)),
            Err(OrchestratorError::InstallInFlight(in_flight)) => Ok(self.reject(
                bundle_ref,
                format!("install {in_flight} is already in flight"),
            )),
            Err(e) => Err(e),
        }
    }

    /// Begin consuming the host's download-progress stream. Only the first
    /// call subscribes.
    pub async fn track_downloads(&self, events: EventStream<DownloadProgressEvent>) -> bool {
        if self.streams.is_shut_down() {
            return false;
        }
        self.downloads.start(events).await
    }

    async fn known_node(&self, node: &str) -> Result<TaskNode, OrchestratorError> {
        self.registry
            .node(node)
            .await
            .ok_or_else(|| OrchestratorError::UnknownNode(node.to_string()))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Merged view of every catalog node, sorted by name.
    pub async fn nodes(&self) -> Vec<NodeView> {
        let mut views = Vec::new();
        for task in self.registry.nodes().await {
            views.push(self.view(task).await);
        }
        views
    }

    pub async fn node(&self, name: &str) -> Option<NodeView> {
        let task = self.registry.node(name).await?;
        Some(self.view(task).await)
    }

    async fn view(&self, task: TaskNode) -> NodeView {
        NodeView {
            readiness: readiness(&task.runtime_config),
            status: self.activation.status(&task.name).await,
            running: self.registry.running_info(&task.name).await,
            lock: self.guard.holder(&task.name).await,
            failure: self.activation.failure(&task.name).await,
            name: task.name,
            category_id: task.category_id,
            runtime_config: task.runtime_config,
            bundle_exists: task.bundle_exists,
        }
    }

    pub async fn categories(&self) -> Vec<Category> {
        self.registry.categories().await
    }

    /// The in-flight install job, or the last finished one.
    pub async fn install_job(&self) -> Option<InstallationJob> {
        self.installs.current().await
    }

    pub async fn download_state(&self) -> DownloadState {
        self.downloads.state().await
    }

    pub async fn bundles(&self) -> Vec<BundleDescriptor> {
        self.installs.bundles().await
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notifier.subscribe()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn guard(&self) -> &Arc<ConcurrencyGuard> {
        &self.guard
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    pub fn activation(&self) -> &Arc<ActivationController> {
        &self.activation
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Periodically refresh the registry until [`Orchestrator::shutdown`].
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut shutdown = self.refresh_shutdown.subscribe();
        let interval = self.config.refresh_interval();

        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Starting refresh loop");

            let mut consecutive_failures = 0u32;
            let mut interval_timer = tokio::time::interval(interval);

            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }

                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }

                    _ = interval_timer.tick() => {
                        let report = orchestrator.registry.refresh().await;
                        if report.is_complete() {
                            consecutive_failures = 0;
                        } else {
                            consecutive_failures += 1;
                            if consecutive_failures > 3 {
                                error!(consecutive_failures, "Registry refresh failing repeatedly");
                            }
                        }
                    }
                }
            }

            info!("Refresh loop shutting down");
        })
    }

    /// Close every live subscription exactly once and refuse further commands.
    ///
    /// Returns how many subscriptions were closed.
    pub async fn shutdown(&self) -> usize {
        self.refresh_shutdown.send_replace(true);
        let closed = self.streams.close_all().await;
        info!(closed, "Orchestrator shut down");
        closed
    }
}
