//! Per-node activation state machine.
//!
//! ## Status transitions
//!
//! ```text
//! Idle ──activate──▶ Starting ──ready──▶ Ready
//!   ▲                   │                  │
//!   │                   └──failed──▶ Failed│
//!   └──────────── deactivate ◀─────────────┘
//! ```
//!
//! `Ready` and `Failed` are terminal until a fresh activation restarts the
//! cycle. A fresh activation clears any stale [`FailureMeta`] when it is
//! issued. Deactivation returns `Ready`/`Starting` nodes to `Idle` and leaves
//! `Failed` alone.
//!
//! The caller owns the node lock (see [`crate::guard::ConcurrencyGuard`]);
//! this controller releases it when the command reaches a terminal outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nodeorch_events::{ActivationEvent, ActivationEventData, ActivationEventStatus};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::client::{RegisterRequest, RuntimeConfig};
use crate::config::Config;
use crate::error::{BackendError, OrchestratorError};
use crate::guard::ConcurrencyGuard;
use crate::notice::{Notice, Notifier};
use crate::registry::{is_script_service, NodeRegistry};
use crate::stream::{EventStream, StreamRegistry, SubscriptionToken};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    #[default]
    Idle,
    Starting,
    Ready,
    Failed,
}

impl ActivationStatus {
    /// Only idle or failed nodes may start a new activation cycle.
    pub fn can_activate(self) -> bool {
        matches!(self, ActivationStatus::Idle | ActivationStatus::Failed)
    }
}

/// Diagnostics kept for a node whose activation failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureMeta {
    pub log_path: Option<String>,
    pub env: Option<String>,
    pub port: Option<u16>,
    pub message: Option<String>,
}

/// Result of the registration call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Accepted { log_path: Option<String> },
    /// The backend answered `accepted = false`.
    Refused { message: String },
}

/// Result of a deactivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Process identifier the stop call used.
    pub env_name: String,
    /// The node left the running set before the poll window closed.
    pub confirmed: bool,
    /// Running-status polls issued after the stop call.
    pub polls: u32,
}

/// Manual activation input, pre-filled from whatever config is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManualActivationForm {
    pub node: String,
    pub service_path: String,
    pub env_name: String,
    pub dependency_path: String,
    pub python_version: String,
    pub port: Option<u16>,
    pub install_dependencies: bool,
}

impl ManualActivationForm {
    pub fn from_config(node: &str, config: &RuntimeConfig) -> Self {
        Self {
            node: node.to_string(),
            service_path: config.service_path.clone().unwrap_or_default(),
            env_name: config.env_name.clone().unwrap_or_default(),
            dependency_path: config.dependency_path.clone().unwrap_or_default(),
            python_version: config.python_version.clone().unwrap_or_default(),
            port: config.port,
            install_dependencies: false,
        }
    }

    /// Script services need an environment name.
    pub fn requires_env(&self) -> bool {
        is_script_service(&self.service_path)
    }

    /// Required fields that are still empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.service_path.trim().is_empty() {
            missing.push("servicePath");
        }
        if self.requires_env() && self.env_name.trim().is_empty() {
            missing.push("envName");
        }
        missing
    }

    /// Build the registration request, or name the first missing field.
    pub fn to_request(&self, factory: &str) -> Result<RegisterRequest, OrchestratorError> {
        if let Some(field) = self.missing_fields().first().copied() {
            return Err(OrchestratorError::MissingField {
                node: self.node.clone(),
                field,
            });
        }
        Ok(RegisterRequest {
            node_name: self.node.clone(),
            factory: factory.to_string(),
            service_path: self.service_path.trim().to_string(),
            env_name: non_empty(&self.env_name),
            dependency_path: non_empty(&self.dependency_path),
            python_version: non_empty(&self.python_version),
            port: self.port,
            install_dependencies: self.install_dependencies,
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Build the one-click registration request from a persisted config.
///
/// A script service persisted with only a dependency file asks the backend to
/// install dependencies before launch.
pub fn request_from_config(
    node: &str,
    factory: &str,
    config: &RuntimeConfig,
) -> Result<RegisterRequest, OrchestratorError> {
    let service_path = config
        .service_path
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| OrchestratorError::MissingField {
            node: node.to_string(),
            field: "servicePath",
        })?;
    let env_name = config.env_name.as_deref().and_then(non_empty);
    let dependency_path = config.dependency_path.as_deref().and_then(non_empty);

    Ok(RegisterRequest {
        node_name: node.to_string(),
        factory: factory.to_string(),
        service_path,
        install_dependencies: env_name.is_none() && dependency_path.is_some(),
        env_name,
        dependency_path,
        python_version: config.python_version.as_deref().and_then(non_empty),
        port: config.port,
    })
}

/// Process identifier used when neither running status nor persisted config
/// names one: the node name lowercased, non-alphanumerics replaced by `_`,
/// suffixed with `_env`.
pub fn fallback_env_name(node: &str) -> String {
    let sanitized: String = node
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{sanitized}_env")
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Default)]
struct ControllerState {
    statuses: HashMap<String, ActivationStatus>,
    failures: HashMap<String, FailureMeta>,
    /// Log path reported by the latest accepted registration.
    log_paths: HashMap<String, String>,
}

enum NextEvent {
    Event(ActivationEvent),
    Ended,
    TimedOut(Duration),
}

/// Drives activation, deactivation and deletion of nodes.
pub struct ActivationController {
    backend: Arc<dyn Backend>,
    registry: Arc<NodeRegistry>,
    guard: Arc<ConcurrencyGuard>,
    streams: Arc<StreamRegistry>,
    notifier: Notifier,
    activation_timeout: Option<Duration>,
    stop_poll_interval: Duration,
    stop_poll_timeout: Duration,
    state: Mutex<ControllerState>,
}

impl ActivationController {
    pub fn new(
        config: &Config,
        backend: Arc<dyn Backend>,
        registry: Arc<NodeRegistry>,
        guard: Arc<ConcurrencyGuard>,
        streams: Arc<StreamRegistry>,
        notifier: Notifier,
    ) -> Self {
        Self {
            backend,
            registry,
            guard,
            streams,
            notifier,
            activation_timeout: config.activation_timeout(),
            stop_poll_interval: config.stop_poll_interval(),
            stop_poll_timeout: config.stop_poll_timeout(),
            state: Mutex::new(ControllerState::default()),
        }
    }

    pub async fn status(&self, node: &str) -> ActivationStatus {
        self.state
            .lock()
            .await
            .statuses
            .get(node)
            .copied()
            .unwrap_or_default()
    }

    pub async fn failure(&self, node: &str) -> Option<FailureMeta> {
        self.state.lock().await.failures.get(node).cloned()
    }

    pub async fn log_path(&self, node: &str) -> Option<String> {
        self.state.lock().await.log_paths.get(node).cloned()
    }

    async fn set_status(&self, node: &str, status: ActivationStatus, failure: Option<FailureMeta>) {
        let mut state = self.state.lock().await;
        let previous = state
            .statuses
            .insert(node.to_string(), status)
            .unwrap_or_default();
        match failure {
            Some(meta) => {
                state.failures.insert(node.to_string(), meta);
            }
            None => {
                state.failures.remove(node);
            }
        }
        if previous != status {
            debug!(node = %node, from = ?previous, to = ?status, "Activation status changed");
        }
    }

    async fn fail(&self, node: &str, meta: FailureMeta) {
        warn!(
            node = %node,
            message = meta.message.as_deref().unwrap_or(""),
            log_path = meta.log_path.as_deref().unwrap_or(""),
            "Activation failed"
        );
        self.set_status(node, ActivationStatus::Failed, Some(meta.clone()))
            .await;
        self.guard.release(node).await;
        self.notifier.emit(Notice::ActivationFailed {
            node: node.to_string(),
            failure: meta,
        });
    }

    // -------------------------------------------------------------------------
    // Activation
    // -------------------------------------------------------------------------

    /// Issue the registration call and subscribe to the node's events.
    ///
    /// The caller must hold the node lock. It is released here on every
    /// outcome except acceptance, where the event stream releases it.
    pub async fn start(
        self: &Arc<Self>,
        node: &str,
        request: RegisterRequest,
    ) -> Result<RegisterOutcome, OrchestratorError> {
        self.set_status(node, ActivationStatus::Starting, None).await;
        info!(node = %node, factory = %request.factory, "Registering node");

        let result = self.backend.register(&request).await;

        if self.streams.is_shut_down() {
            debug!(node = %node, "Discarding registration response after shutdown");
            self.guard.release(node).await;
            return Err(OrchestratorError::ShuttingDown);
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.fail(
                    node,
                    FailureMeta {
                        env: request.env_name.clone(),
                        port: request.port,
                        message: Some(e.to_string()),
                        ..FailureMeta::default()
                    },
                )
                .await;
                return Err(e.into());
            }
        };

        if !response.accepted {
            let message = response
                .message
                .unwrap_or_else(|| "registration rejected".to_string());
            self.fail(
                node,
                FailureMeta {
                    log_path: response.log_path,
                    env: request.env_name.clone(),
                    port: request.port,
                    message: Some(message.clone()),
                },
            )
            .await;
            return Ok(RegisterOutcome::Refused { message });
        }

        if let Some(log_path) = &response.log_path {
            self.state
                .lock()
                .await
                .log_paths
                .insert(node.to_string(), log_path.clone());
            self.notifier.emit(Notice::LogAvailable {
                node: node.to_string(),
                log_path: log_path.clone(),
            });
        }

        self.subscribe(node).await?;
        Ok(RegisterOutcome::Accepted {
            log_path: response.log_path,
        })
    }

    /// Open the node's activation stream, replacing any previous one.
    async fn subscribe(self: &Arc<Self>, node: &str) -> Result<(), OrchestratorError> {
        let events = match self.backend.subscribe_activation(node).await {
            Ok(events) => events,
            Err(e) => {
                self.fail(
                    node,
                    FailureMeta {
                        log_path: self.log_path(node).await,
                        message: Some(e.to_string()),
                        ..FailureMeta::default()
                    },
                )
                .await;
                return Err(e.into());
            }
        };

        let controller = Arc::clone(self);
        let owned = node.to_string();
        let opened = self
            .streams
            .open_node(node, move |token| controller.consume(owned, events, token))
            .await;

        if opened.is_none() {
            self.guard.release(node).await;
            return Err(OrchestratorError::ShuttingDown);
        }
        Ok(())
    }

    async fn next_event(&self, events: &mut EventStream<ActivationEvent>) -> NextEvent {
        let next = match self.activation_timeout {
            Some(limit) => match tokio::time::timeout(limit, events.next()).await {
                Ok(next) => next,
                Err(_) => return NextEvent::TimedOut(limit),
            },
            None => events.next().await,
        };
        match next {
            Some(event) => NextEvent::Event(event),
            None => NextEvent::Ended,
        }
    }

    async fn consume(
        self: Arc<Self>,
        node: String,
        mut events: EventStream<ActivationEvent>,
        mut token: SubscriptionToken,
    ) {
        loop {
            let next = tokio::select! {
                biased;

                _ = token.closed() => {
                    debug!(node = %node, "Activation subscription closed");
                    return;
                }

                next = self.next_event(&mut events) => next,
            };

            let event = match next {
                NextEvent::Event(event) => event,
                NextEvent::Ended => ActivationEvent::failed(ActivationEventData {
                    message: Some("activation stream ended before the node was ready".to_string()),
                    ..ActivationEventData::default()
                }),
                NextEvent::TimedOut(limit) => ActivationEvent::failed(ActivationEventData {
                    message: Some(format!(
                        "no activation event within {}s",
                        limit.as_secs()
                    )),
                    ..ActivationEventData::default()
                }),
            };

            if self.handle_event(&node, event).await {
                break;
            }
        }

        self.streams.release_node(&node, token.id()).await;
    }

    /// Returns true once the activation cycle reached a terminal status.
    async fn handle_event(&self, node: &str, event: ActivationEvent) -> bool {
        debug!(node = %node, status = ?event.status, "Activation event");
        let terminal = event.status.is_terminal();

        match event.status {
            ActivationEventStatus::Starting => {
                self.set_status(node, ActivationStatus::Starting, None).await;
            }
            ActivationEventStatus::Ready => {
                self.registry.refresh().await;
                self.set_status(node, ActivationStatus::Ready, None).await;
                self.guard.release(node).await;
                info!(node = %node, "Node ready");
                self.notifier.emit(Notice::NodeReady {
                    node: node.to_string(),
                });
            }
            ActivationEventStatus::Failed => {
                let remembered = self.log_path(node).await;
                let data = event.data;
                self.fail(
                    node,
                    FailureMeta {
                        log_path: data.log_path.or(remembered),
                        env: data.env_name,
                        port: data.port,
                        message: data.message,
                    },
                )
                .await;
                self.registry.refresh_running().await;
            }
        }

        terminal
    }

    // -------------------------------------------------------------------------
    // Deactivation
    // -------------------------------------------------------------------------

    /// Resolve the process identifier for a stop call.
    pub async fn resolve_env_name(&self, node: &str) -> String {
        let running = self
            .registry
            .running_info(node)
            .await
            .and_then(|info| info.env_name)
            .filter(|env| !env.trim().is_empty());
        if let Some(env) = running {
            return env;
        }

        let persisted = self
            .registry
            .node(node)
            .await
            .and_then(|n| n.runtime_config.env_name)
            .filter(|env| !env.trim().is_empty());
        persisted.unwrap_or_else(|| fallback_env_name(node))
    }

    /// Stop a node and wait for it to leave the running set.
    ///
    /// The caller must hold the node lock; it is released on every path.
    pub async fn deactivate(&self, node: &str) -> Result<StopReport, OrchestratorError> {
        let result = self.stop_and_wait(node).await;
        self.guard.release(node).await;
        result
    }

    async fn stop_and_wait(&self, node: &str) -> Result<StopReport, OrchestratorError> {
        let env_name = self.resolve_env_name(node).await;
        self.streams.close_node(node).await;

        info!(node = %node, env_name = %env_name, "Stopping node");
        // The stop call and every poll share one deadline.
        let deadline = Instant::now() + self.stop_poll_timeout;
        match tokio::time::timeout_at(deadline, self.backend.stop(&env_name)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.command_failed(node, "stop", &e);
                return Err(e.into());
            }
            Err(_) => {
                warn!(node = %node, env_name = %env_name, "Stop request still pending at deadline");
            }
        }
        if self.streams.is_shut_down() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let mut polls = 0;
        let confirmed = tokio::time::timeout_at(
            deadline,
            self.poll_until_stopped(node, deadline, &mut polls),
        )
        .await
        .unwrap_or(false);

        {
            let mut state = self.state.lock().await;
            if let Some(status) = state.statuses.get_mut(node) {
                if matches!(status, ActivationStatus::Ready | ActivationStatus::Starting) {
                    *status = ActivationStatus::Idle;
                }
            }
        }

        if confirmed {
            info!(node = %node, polls, "Node stopped");
        } else {
            warn!(node = %node, polls, "Node still listed as running after stop");
        }
        self.notifier.emit(Notice::NodeStopped {
            node: node.to_string(),
            confirmed,
        });

        Ok(StopReport {
            env_name,
            confirmed,
            polls,
        })
    }

    /// Poll running status until the node leaves the running set or the
    /// deadline passes. `polls` counts the polls issued.
    async fn poll_until_stopped(&self, node: &str, deadline: Instant, polls: &mut u32) -> bool {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.stop_poll_interval.min(deadline - now)).await;
            *polls += 1;

            self.registry.refresh_running().await;
            if !self.registry.is_running(node).await {
                return true;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Deletion
    // -------------------------------------------------------------------------

    /// Delete a node on the backend and forget it locally.
    pub async fn delete(&self, node: &str) -> Result<(), OrchestratorError> {
        info!(node = %node, "Deleting node");
        if let Err(e) = self.backend.delete(node).await {
            self.command_failed(node, "delete", &e);
            return Err(e.into());
        }
        if self.streams.is_shut_down() {
            return Err(OrchestratorError::ShuttingDown);
        }

        self.streams.close_node(node).await;
        self.registry.remove(node).await;
        {
            let mut state = self.state.lock().await;
            state.statuses.remove(node);
            state.failures.remove(node);
            state.log_paths.remove(node);
        }
        self.registry.refresh().await;

        self.notifier.emit(Notice::NodeDeleted {
            node: node.to_string(),
        });
        Ok(())
    }

    fn command_failed(&self, node: &str, command: &str, error: &BackendError) {
        warn!(node = %node, command = %command, error = %error, "Node command failed");
        self.notifier.emit(Notice::CommandFailed {
            subject: node.to_string(),
            command: command.to_string(),
            message: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("yolo", "yolo_env")]
    #[case("Whisper Large", "whisper_large_env")]
    #[case("sd-xl/1.0", "sd_xl_1_0_env")]
    fn test_fallback_env_name(#[case] node: &str, #[case] expected: &str) {
        assert_eq!(fallback_env_name(node), expected);
    }

    #[test]
    fn test_form_prefills_and_flags_missing() {
        let config = RuntimeConfig {
            service_path: Some("/opt/whisper/main.py".to_string()),
            python_version: Some("3.11".to_string()),
            ..RuntimeConfig::default()
        };
        let form = ManualActivationForm::from_config("whisper", &config);
        assert!(form.requires_env());
        assert_eq!(form.python_version, "3.11");
        assert_eq!(form.missing_fields(), vec!["envName"]);

        let err = form.to_request("default").unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::MissingField { field: "envName", .. }
        ));
    }

    #[test]
    fn test_form_request_trims_and_drops_empty() {
        let form = ManualActivationForm {
            node: "yolo".to_string(),
            service_path: " /opt/yolo/serve ".to_string(),
            env_name: "  ".to_string(),
            ..ManualActivationForm::default()
        };
        assert!(!form.requires_env());
        let request = form.to_request("gpu").unwrap();
        assert_eq!(request.service_path, "/opt/yolo/serve");
        assert_eq!(request.env_name, None);
        assert_eq!(request.factory, "gpu");
    }

    #[test]
    fn test_empty_form_requires_service_path() {
        let form = ManualActivationForm::from_config("yolo", &RuntimeConfig::default());
        assert_eq!(form.missing_fields(), vec!["servicePath"]);
    }

    #[test]
    fn test_one_click_request_with_dependency_file() {
        let config = RuntimeConfig {
            service_path: Some("/opt/whisper/main.py".to_string()),
            dependency_path: Some("/opt/whisper/requirements.txt".to_string()),
            port: Some(9001),
            ..RuntimeConfig::default()
        };
        let request = request_from_config("whisper", "default", &config).unwrap();
        assert!(request.install_dependencies);
        assert_eq!(request.env_name, None);
        assert_eq!(request.port, Some(9001));

        let err = request_from_config("whisper", "default", &RuntimeConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::MissingField { field: "servicePath", .. }
        ));
    }

    #[test]
    fn test_can_activate() {
        assert!(ActivationStatus::Idle.can_activate());
        assert!(ActivationStatus::Failed.can_activate());
        assert!(!ActivationStatus::Starting.can_activate());
        assert!(!ActivationStatus::Ready.can_activate());
    }
}
