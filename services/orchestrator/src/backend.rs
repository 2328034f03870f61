//! Backend abstraction.
//!
//! The orchestrator never talks to a transport directly. [`crate::HttpBackend`]
//! is the production implementation; [`MockBackend`] is a scriptable
//! in-memory backend used by tests and offline demos.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use nodeorch_events::{ActivationEvent, InstallEvent, InstallId};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::activation::fallback_env_name;
use crate::client::{
    BundleDescriptor, CatalogResponse, InstallRequest, InstallResponse, PersistedNode,
    RegisterRequest, RegisterResponse, RunningInfo, RuntimeConfig,
};
use crate::error::BackendError;
use crate::stream::EventStream;

/// Backend task-management service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch category/node maps and persisted runtime configs.
    async fn fetch_catalog(&self) -> Result<CatalogResponse, BackendError>;

    /// Fetch the running-status map keyed by node name.
    async fn fetch_running(&self) -> Result<HashMap<String, RunningInfo>, BackendError>;

    /// Ask the backend to launch a node.
    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, BackendError>;

    /// Stop the process identified by its environment name.
    async fn stop(&self, env_name: &str) -> Result<(), BackendError>;

    /// Delete a node and its persisted configuration.
    async fn delete(&self, node: &str) -> Result<(), BackendError>;

    async fn fetch_bundles(&self) -> Result<Vec<BundleDescriptor>, BackendError>;

    /// Start a bundle install job.
    async fn install_bundle(&self, request: &InstallRequest) -> Result<InstallResponse, BackendError>;

    /// Open the event stream of one install job.
    async fn subscribe_install(
        &self,
        install_id: &InstallId,
    ) -> Result<EventStream<InstallEvent>, BackendError>;

    /// Open a node's activation event stream.
    async fn subscribe_activation(
        &self,
        node: &str,
    ) -> Result<EventStream<ActivationEvent>, BackendError>;
}

// =============================================================================
// Mock Backend
// =============================================================================

const MOCK_STREAM_BUFFER: usize = 32;

/// How the mock's running-status reacts to a stop call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBehavior {
    /// The node is still listed for `n` running-status polls, then disappears.
    ClearsAfterPolls(u32),
    /// The node never leaves the running set.
    Never,
}

/// A call recorded by [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    FetchCatalog,
    FetchRunning,
    Register(RegisterRequest),
    Stop(String),
    Delete(String),
    FetchBundles,
    InstallBundle(InstallRequest),
    SubscribeInstall(InstallId),
    SubscribeActivation(String),
}

#[derive(Default)]
struct MockState {
    catalog: CatalogResponse,
    catalog_error: Option<String>,
    running: HashMap<String, RunningInfo>,
    running_error: Option<String>,
    register_response: RegisterResponse,
    register_error: Option<String>,
    stop_behavior: Option<StopBehavior>,
    stop_error: Option<String>,
    pending_stops: HashMap<String, u32>,
    delete_error: Option<String>,
    bundles: Vec<BundleDescriptor>,
    install_error: Option<String>,
    install_streams: Vec<mpsc::Sender<InstallEvent>>,
    activation_streams: HashMap<String, Vec<mpsc::Sender<ActivationEvent>>>,
    calls: Vec<MockCall>,
}

/// Scriptable in-memory backend.
///
/// Event streams are channels; tests push events with
/// [`MockBackend::emit_install`] and [`MockBackend::emit_activation`].
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                register_response: RegisterResponse {
                    accepted: true,
                    ..RegisterResponse::default()
                },
                ..MockState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: MockCall) {
        self.lock().calls.push(call);
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// Add (or replace) a catalog node.
    pub fn add_node(
        &self,
        name: &str,
        category: &str,
        runtime_config: RuntimeConfig,
        bundle_exists: bool,
    ) {
        self.list_node(name, category);
        self.lock().catalog.nodes.insert(
            name.to_string(),
            PersistedNode {
                runtime_config,
                bundle_exists,
            },
        );
    }

    /// List a node under a category without any persisted config.
    pub fn list_node(&self, name: &str, category: &str) {
        let mut state = self.lock();
        let names = state.catalog.categories.entry(category.to_string()).or_default();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        state
            .catalog
            .category_names
            .entry(category.to_string())
            .or_insert_with(|| category.to_string());
    }

    pub fn set_running(&self, name: &str, info: RunningInfo) {
        self.lock().running.insert(name.to_string(), info);
    }

    pub fn clear_running(&self, name: &str) {
        let mut state = self.lock();
        state.running.remove(name);
        state.pending_stops.remove(name);
    }

    pub fn fail_catalog(&self, message: Option<&str>) {
        self.lock().catalog_error = message.map(str::to_string);
    }

    pub fn fail_running(&self, message: Option<&str>) {
        self.lock().running_error = message.map(str::to_string);
    }

    pub fn set_register_response(&self, response: RegisterResponse) {
        self.lock().register_response = response;
    }

    pub fn fail_register(&self, message: Option<&str>) {
        self.lock().register_error = message.map(str::to_string);
    }

    pub fn set_stop_behavior(&self, behavior: StopBehavior) {
        self.lock().stop_behavior = Some(behavior);
    }

    pub fn fail_stop(&self, message: Option<&str>) {
        self.lock().stop_error = message.map(str::to_string);
    }

    pub fn fail_delete(&self, message: Option<&str>) {
        self.lock().delete_error = message.map(str::to_string);
    }

    pub fn add_bundle(&self, bundle: BundleDescriptor) {
        self.lock().bundles.push(bundle);
    }

    pub fn fail_install(&self, message: Option<&str>) {
        self.lock().install_error = message.map(str::to_string);
    }

    // -------------------------------------------------------------------------
    // Streams
    // -------------------------------------------------------------------------

    /// Push an event onto the most recent install stream.
    ///
    /// Returns false if no install stream is open.
    pub async fn emit_install(&self, event: InstallEvent) -> bool {
        let sender = self.lock().install_streams.last().cloned();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// End the most recent install stream without a terminal event.
    pub fn close_install(&self) {
        self.lock().install_streams.pop();
    }

    /// Push an event onto the node's most recent activation stream.
    ///
    /// Returns false if the node has no open stream.
    pub async fn emit_activation(&self, node: &str, event: ActivationEvent) -> bool {
        let sender = self
            .lock()
            .activation_streams
            .get(node)
            .and_then(|senders| senders.last().cloned());
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// End every activation stream of the node from the backend side.
    pub fn close_activation(&self, node: &str) {
        self.lock().activation_streams.remove(node);
    }

    /// Activation streams for the node whose receiver is still held.
    pub fn live_activation_streams(&self, node: &str) -> usize {
        self.lock()
            .activation_streams
            .get(node)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Install streams whose receiver is still held.
    pub fn live_install_streams(&self) -> usize {
        self.lock()
            .install_streams
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn register_calls(&self) -> Vec<RegisterRequest> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Register(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn stop_calls(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Stop(env) => Some(env.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&MockCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| matches(call)).count()
    }
}

fn scripted_error(message: &Option<String>) -> Result<(), BackendError> {
    match message {
        Some(message) => Err(BackendError::Unavailable(message.clone())),
        None => Ok(()),
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn fetch_catalog(&self) -> Result<CatalogResponse, BackendError> {
        self.record(MockCall::FetchCatalog);
        let state = self.lock();
        scripted_error(&state.catalog_error)?;
        Ok(state.catalog.clone())
    }

    async fn fetch_running(&self) -> Result<HashMap<String, RunningInfo>, BackendError> {
        self.record(MockCall::FetchRunning);
        let mut state = self.lock();
        scripted_error(&state.running_error)?;

        let mut cleared = Vec::new();
        for (node, remaining) in state.pending_stops.iter_mut() {
            if *remaining == 0 {
                cleared.push(node.clone());
            } else {
                *remaining -= 1;
            }
        }
        for node in cleared {
            state.pending_stops.remove(&node);
            state.running.remove(&node);
            debug!(node = %node, "[MOCK] Node left running set");
        }

        Ok(state.running.clone())
    }

    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, BackendError> {
        self.record(MockCall::Register(request.clone()));
        info!(node = %request.node_name, "[MOCK] Registering node");
        let state = self.lock();
        scripted_error(&state.register_error)?;
        Ok(state.register_response.clone())
    }

    async fn stop(&self, env_name: &str) -> Result<(), BackendError> {
        self.record(MockCall::Stop(env_name.to_string()));
        info!(env_name = %env_name, "[MOCK] Stopping node");
        let mut state = self.lock();
        scripted_error(&state.stop_error)?;

        let polls = match state.stop_behavior.unwrap_or(StopBehavior::ClearsAfterPolls(0)) {
            StopBehavior::ClearsAfterPolls(n) => n,
            StopBehavior::Never => return Ok(()),
        };

        let targets: Vec<String> = state
            .running
            .iter()
            .filter(|(node, info)| {
                info.env_name.as_deref() == Some(env_name)
                    || state.catalog.nodes.get(node.as_str()).is_some_and(|persisted| {
                        persisted.runtime_config.env_name.as_deref() == Some(env_name)
                    })
                    || fallback_env_name(node) == env_name
            })
            .map(|(node, _)| node.clone())
            .collect();
        for node in targets {
            state.pending_stops.insert(node, polls);
        }
        Ok(())
    }

    async fn delete(&self, node: &str) -> Result<(), BackendError> {
        self.record(MockCall::Delete(node.to_string()));
        let mut state = self.lock();
        scripted_error(&state.delete_error)?;
        state.catalog.nodes.remove(node);
        for names in state.catalog.categories.values_mut() {
            names.retain(|n| n != node);
        }
        Ok(())
    }

    async fn fetch_bundles(&self) -> Result<Vec<BundleDescriptor>, BackendError> {
        self.record(MockCall::FetchBundles);
        Ok(self.lock().bundles.clone())
    }

    async fn install_bundle(&self, request: &InstallRequest) -> Result<InstallResponse, BackendError> {
        self.record(MockCall::InstallBundle(request.clone()));
        let state = self.lock();
        scripted_error(&state.install_error)?;
        Ok(InstallResponse {
            install_id: request.install_id,
        })
    }

    async fn subscribe_install(
        &self,
        install_id: &InstallId,
    ) -> Result<EventStream<InstallEvent>, BackendError> {
        self.record(MockCall::SubscribeInstall(*install_id));
        let (tx, stream) = EventStream::channel(MOCK_STREAM_BUFFER);
        self.lock().install_streams.push(tx);
        Ok(stream)
    }

    async fn subscribe_activation(
        &self,
        node: &str,
    ) -> Result<EventStream<ActivationEvent>, BackendError> {
        self.record(MockCall::SubscribeActivation(node.to_string()));
        let (tx, stream) = EventStream::channel(MOCK_STREAM_BUFFER);
        self.lock()
            .activation_streams
            .entry(node.to_string())
            .or_default()
            .push(tx);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(env: &str) -> RunningInfo {
        RunningInfo {
            running: true,
            env_name: Some(env.to_string()),
            ..RunningInfo::default()
        }
    }

    #[tokio::test]
    async fn test_mock_stop_clears_after_polls() {
        let backend = MockBackend::new();
        backend.set_running("yolo", running("yolo_env"));
        backend.set_stop_behavior(StopBehavior::ClearsAfterPolls(1));

        backend.stop("yolo_env").await.unwrap();
        assert!(backend.fetch_running().await.unwrap().contains_key("yolo"));
        assert!(!backend.fetch_running().await.unwrap().contains_key("yolo"));
    }

    #[tokio::test]
    async fn test_mock_stop_never() {
        let backend = MockBackend::new();
        backend.set_running("yolo", running("yolo_env"));
        backend.set_stop_behavior(StopBehavior::Never);

        backend.stop("yolo_env").await.unwrap();
        for _ in 0..3 {
            assert!(backend.fetch_running().await.unwrap().contains_key("yolo"));
        }
    }

    #[tokio::test]
    async fn test_mock_scripted_failures() {
        let backend = MockBackend::new();
        backend.fail_catalog(Some("catalog down"));
        assert!(backend.fetch_catalog().await.is_err());
        backend.fail_catalog(None);
        assert!(backend.fetch_catalog().await.is_ok());
        assert_eq!(backend.count(|c| matches!(c, MockCall::FetchCatalog)), 2);
    }

    #[tokio::test]
    async fn test_mock_activation_stream_liveness() {
        let backend = MockBackend::new();
        let mut stream = backend.subscribe_activation("yolo").await.unwrap();
        assert_eq!(backend.live_activation_streams("yolo"), 1);

        assert!(backend.emit_activation("yolo", ActivationEvent::starting()).await);
        assert_eq!(stream.next().await, Some(ActivationEvent::starting()));

        drop(stream);
        assert_eq!(backend.live_activation_streams("yolo"), 0);
    }
}
