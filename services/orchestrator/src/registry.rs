//! Node registry.
//!
//! Merges the backend catalog (categories, persisted runtime configs, bundle
//! presence) with polled running status into one local view of every node.
//! Each of the two fetches owns its own slice of the cache, so a failure in
//! one never discards what the other knows.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::client::{CatalogResponse, RunningInfo, RuntimeConfig};
use crate::error::BackendError;

/// A node as listed by the backend catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    pub name: String,
    /// Category ID, if any category lists the node.
    pub category_id: Option<String>,
    pub runtime_config: RuntimeConfig,
    pub bundle_exists: bool,
}

/// Display information for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Category {
    pub id: String,
    pub display_name: String,
    pub nodes: Vec<String>,
}

/// Which slices a refresh updated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub catalog_updated: bool,
    pub running_updated: bool,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        self.catalog_updated && self.running_updated
    }
}

/// Whether a node can be launched without asking the user for anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    /// No service path is persisted.
    MissingServicePath,
    /// A script service without an environment name or dependency file.
    MissingEnvironment,
}

impl Readiness {
    pub fn is_ready(self) -> bool {
        self == Readiness::Ready
    }
}

/// True when the service path points at a Python script.
pub fn is_script_service(service_path: &str) -> bool {
    service_path.trim().to_ascii_lowercase().ends_with(".py")
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Decide whether a persisted runtime config is enough for one-click activation.
pub fn readiness(config: &RuntimeConfig) -> Readiness {
    if !present(&config.service_path) {
        return Readiness::MissingServicePath;
    }
    let script = config.service_path.as_deref().is_some_and(is_script_service);
    if script && !present(&config.env_name) && !present(&config.dependency_path) {
        return Readiness::MissingEnvironment;
    }
    Readiness::Ready
}

#[derive(Default)]
struct RegistryState {
    nodes: BTreeMap<String, TaskNode>,
    categories: Vec<Category>,
    running: HashMap<String, RunningInfo>,
}

/// Local view of every catalog node and its running status.
pub struct NodeRegistry {
    backend: Arc<dyn Backend>,
    state: RwLock<RegistryState>,
}

impl NodeRegistry {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Fetch catalog and running status concurrently and merge what succeeded.
    pub async fn refresh(&self) -> RefreshReport {
        let (catalog, running) =
            tokio::join!(self.backend.fetch_catalog(), self.backend.fetch_running());

        let report = RefreshReport {
            catalog_updated: self.apply_catalog(catalog).await,
            running_updated: self.apply_running(running).await,
        };

        debug!(
            catalog_updated = report.catalog_updated,
            running_updated = report.running_updated,
            "Refreshed node registry"
        );
        report
    }

    pub async fn refresh_catalog(&self) -> bool {
        let catalog = self.backend.fetch_catalog().await;
        self.apply_catalog(catalog).await
    }

    /// Fetch only the running-status slice.
    pub async fn refresh_running(&self) -> bool {
        let running = self.backend.fetch_running().await;
        self.apply_running(running).await
    }

    async fn apply_catalog(&self, result: Result<CatalogResponse, BackendError>) -> bool {
        let catalog = match result {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(error = %e, "Catalog fetch failed, keeping cached nodes");
                return false;
            }
        };

        let mut category_of: HashMap<&str, &str> = HashMap::new();
        let mut categories = Vec::with_capacity(catalog.categories.len());
        for (id, names) in &catalog.categories {
            for name in names {
                category_of.entry(name.as_str()).or_insert(id.as_str());
            }
            categories.push(Category {
                id: id.clone(),
                display_name: catalog
                    .category_names
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| id.clone()),
                nodes: names.clone(),
            });
        }

        // A node listed only under a category has no persisted config yet.
        let mut nodes: BTreeMap<String, TaskNode> = category_of
            .iter()
            .map(|(name, id)| {
                let node = TaskNode {
                    name: name.to_string(),
                    category_id: Some(id.to_string()),
                    runtime_config: RuntimeConfig::default(),
                    bundle_exists: false,
                };
                (name.to_string(), node)
            })
            .collect();
        for (name, persisted) in &catalog.nodes {
            nodes.insert(
                name.clone(),
                TaskNode {
                    name: name.clone(),
                    category_id: category_of.get(name.as_str()).map(|id| id.to_string()),
                    runtime_config: persisted.runtime_config.clone(),
                    bundle_exists: persisted.bundle_exists,
                },
            );
        }

        let mut state = self.state.write().await;
        let dropped = state
            .nodes
            .keys()
            .filter(|name| !nodes.contains_key(*name))
            .count();
        if dropped > 0 {
            debug!(dropped, "Dropped nodes absent from catalog");
        }
        state.nodes = nodes;
        state.categories = categories;
        true
    }

    async fn apply_running(
        &self,
        result: Result<HashMap<String, RunningInfo>, BackendError>,
    ) -> bool {
        match result {
            Ok(running) => {
                self.state.write().await.running = running;
                true
            }
            Err(e) => {
                warn!(error = %e, "Running-status fetch failed, keeping cached status");
                false
            }
        }
    }

    pub async fn node(&self, name: &str) -> Option<TaskNode> {
        self.state.read().await.nodes.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.state.read().await.nodes.contains_key(name)
    }

    /// Every known node, sorted by name.
    pub async fn nodes(&self) -> Vec<TaskNode> {
        self.state.read().await.nodes.values().cloned().collect()
    }

    pub async fn categories(&self) -> Vec<Category> {
        self.state.read().await.categories.clone()
    }

    pub async fn running_info(&self, name: &str) -> Option<RunningInfo> {
        self.state.read().await.running.get(name).cloned()
    }

    pub async fn running(&self) -> HashMap<String, RunningInfo> {
        self.state.read().await.running.clone()
    }

    /// A node counts as running only while it is listed with `running == true`.
    pub async fn is_running(&self, name: &str) -> bool {
        self.state
            .read()
            .await
            .running
            .get(name)
            .is_some_and(|info| info.running)
    }

    /// Drop a node locally after it was deleted on the backend.
    pub async fn remove(&self, name: &str) -> Option<TaskNode> {
        let mut state = self.state.write().await;
        state.running.remove(name);
        for category in &mut state.categories {
            category.nodes.retain(|n| n != name);
        }
        state.nodes.remove(name)
    }

    /// Readiness of a known node, `None` if the node is unknown.
    pub async fn readiness_for(&self, name: &str) -> Option<Readiness> {
        self.state
            .read()
            .await
            .nodes
            .get(name)
            .map(|node| readiness(&node.runtime_config))
    }
}
