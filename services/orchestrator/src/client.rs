//! HTTP backend client.
//!
//! Speaks JSON over HTTP for one-shot calls and Server-Sent Events for the
//! install and activation streams:
//! - Catalog and running-status fetches
//! - Node register / stop / delete
//! - Bundle catalog and bundle install
//! - Install job and per-node activation event streams

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use nodeorch_events::{decode_event, ActivationEvent, InstallEvent, InstallId};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::backend::Backend;
use crate::config::Config;
use crate::error::BackendError;
use crate::sse::SseDecoder;
use crate::stream::EventStream;

/// Buffered events per stream before the SSE reader waits on the consumer.
const STREAM_BUFFER: usize = 64;

// =============================================================================
// Client
// =============================================================================

/// Backend implementation over HTTP + SSE.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    request_timeout: Duration,
}

impl HttpBackend {
    /// Create a new client. One-shot requests use the configured timeout;
    /// event streams only bound the connect phase.
    pub fn new(config: &Config) -> Result<Self, BackendError> {
        let base_url = Url::parse(&config.backend_url)
            .map_err(|e| BackendError::InvalidUrl(format!("{}: {e}", config.backend_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl(config.backend_url.clone()));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|source| BackendError::Transport {
                endpoint: config.backend_url.clone(),
                source,
            })?;

        Ok(Self {
            client,
            base_url,
            request_timeout: config.request_timeout(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> Result<reqwest::Response, BackendError> {
        let response = request
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                endpoint: endpoint.to_string(),
                source,
            })?;
        check_status(response, endpoint).await
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, BackendError> {
        let url = self.url(segments)?;
        let endpoint = url.path().to_string();
        debug!(url = %url, "GET");

        let response = self.send(self.client.get(url), &endpoint).await?;
        decode_body(response, &endpoint).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<T, BackendError> {
        let url = self.url(segments)?;
        let endpoint = url.path().to_string();
        debug!(url = %url, "POST");

        let response = self.send(self.client.post(url).json(body), &endpoint).await?;
        decode_body(response, &endpoint).await
    }

    /// Open an SSE endpoint and pump decoded events into an [`EventStream`].
    async fn open_event_stream<T>(&self, segments: &[&str]) -> Result<EventStream<T>, BackendError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let url = self.url(segments)?;
        let endpoint = url.path().to_string();
        debug!(url = %url, "Opening event stream");

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                endpoint: endpoint.clone(),
                source,
            })?;
        let response = check_status(response, &endpoint).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let pump = tokio::spawn(pump_events(response, endpoint, tx));
        Ok(EventStream::with_pump(rx, pump))
    }
}

async fn check_status(
    response: reqwest::Response,
    endpoint: &str,
) -> Result<reqwest::Response, BackendError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!(endpoint = %endpoint, status = %status, body = %body, "Backend request failed");
    Err(BackendError::Status {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body,
    })
}

async fn decode_body<T: DeserializeOwned>(
    response: reqwest::Response,
    endpoint: &str,
) -> Result<T, BackendError> {
    let bytes = response.bytes().await.map_err(|source| BackendError::Transport {
        endpoint: endpoint.to_string(),
        source,
    })?;
    // Some endpoints answer 204 / empty bodies; treat them as JSON null.
    let bytes: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        &bytes
    };
    serde_json::from_slice(bytes).map_err(|e| BackendError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

/// Read the SSE body chunk by chunk until it ends or the consumer goes away.
async fn pump_events<T: DeserializeOwned>(
    mut response: reqwest::Response,
    endpoint: String,
    tx: mpsc::Sender<T>,
) {
    let mut decoder = SseDecoder::new();

    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Event stream read failed");
                break;
            }
        };

        for payload in decoder.push(&chunk) {
            if !forward(&endpoint, &payload, &tx).await {
                return;
            }
        }
    }

    if let Some(payload) = decoder.finish() {
        forward(&endpoint, &payload, &tx).await;
    }
    debug!(endpoint = %endpoint, "Event stream ended");
}

/// Returns false once the receiving side is gone.
async fn forward<T: DeserializeOwned>(endpoint: &str, payload: &str, tx: &mpsc::Sender<T>) -> bool {
    match decode_event::<T>(payload) {
        Ok(event) => tx.send(event).await.is_ok(),
        Err(e) => {
            warn!(endpoint = %endpoint, error = %e, "Skipping malformed event");
            true
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_catalog(&self) -> Result<CatalogResponse, BackendError> {
        let catalog: CatalogResponse = self.get_json(&["v1", "catalog"]).await?;
        debug!(
            node_count = catalog.nodes.len(),
            category_count = catalog.categories.len(),
            "Fetched catalog"
        );
        Ok(catalog)
    }

    async fn fetch_running(&self) -> Result<HashMap<String, RunningInfo>, BackendError> {
        self.get_json(&["v1", "nodes", "running"]).await
    }

    async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, BackendError> {
        self.post_json(&["v1", "nodes", "register"], request).await
    }

    async fn stop(&self, env_name: &str) -> Result<(), BackendError> {
        let request = StopRequest {
            env_name: env_name.to_string(),
        };
        let url = self.url(&["v1", "nodes", "stop"])?;
        let endpoint = url.path().to_string();
        debug!(url = %url, "POST");
        self.send(self.client.post(url).json(&request), &endpoint).await?;
        Ok(())
    }

    async fn delete(&self, node: &str) -> Result<(), BackendError> {
        let url = self.url(&["v1", "nodes", node])?;
        let endpoint = url.path().to_string();
        debug!(url = %url, "DELETE");
        self.send(self.client.delete(url), &endpoint).await?;
        Ok(())
    }

    async fn fetch_bundles(&self) -> Result<Vec<BundleDescriptor>, BackendError> {
        self.get_json(&["v1", "bundles"]).await
    }

    async fn install_bundle(&self, request: &InstallRequest) -> Result<InstallResponse, BackendError> {
        self.post_json(&["v1", "bundles", "install"], request).await
    }

    async fn subscribe_install(
        &self,
        install_id: &InstallId,
    ) -> Result<EventStream<InstallEvent>, BackendError> {
        let id = install_id.to_string();
        self.open_event_stream(&["v1", "installs", &id, "events"]).await
    }

    async fn subscribe_activation(
        &self,
        node: &str,
    ) -> Result<EventStream<ActivationEvent>, BackendError> {
        self.open_event_stream(&["v1", "nodes", node, "events"]).await
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Persisted launch configuration for a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
}

/// Per-node entry of the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNode {
    #[serde(default)]
    pub runtime_config: RuntimeConfig,
    #[serde(default)]
    pub bundle_exists: bool,
}

/// `GET /v1/catalog` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogResponse {
    /// Category ID to node names.
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<String>>,
    /// Category ID to display name.
    #[serde(default)]
    pub category_names: BTreeMap<String, String>,
    #[serde(default)]
    pub nodes: HashMap<String, PersistedNode>,
}

/// Running status of one node, as polled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningInfo {
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

/// `POST /v1/nodes/register` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub node_name: String,
    pub factory: String,
    pub service_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Ask the backend to install dependencies before launching.
    #[serde(default)]
    pub install_dependencies: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub env_name: String,
}

/// One installable bundle from `GET /v1/bundles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDescriptor {
    /// Node the bundle provides.
    pub model_name: String,
    /// Opaque reference the backend resolves to a download.
    pub bundle_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub install_id: InstallId,
    pub bundle: BundleDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResponse {
    pub install_id: InstallId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(url: &str) -> HttpBackend {
        HttpBackend::new(&Config {
            backend_url: url.to_string(),
            ..Config::default()
        })
        .unwrap()
    }

    #[test]
    fn test_url_escapes_node_names() {
        let backend = backend("http://127.0.0.1:8765/api/");
        let url = backend.url(&["v1", "nodes", "my node/x", "events"]).unwrap();
        assert_eq!(url.path(), "/api/v1/nodes/my%20node%2Fx/events");
    }

    #[test]
    fn test_rejects_unparseable_base_url() {
        let result = HttpBackend::new(&Config {
            backend_url: "not a url".to_string(),
            ..Config::default()
        });
        assert!(matches!(result, Err(BackendError::InvalidUrl(_))));
    }

    #[test]
    fn test_register_request_serialization() {
        let request = RegisterRequest {
            node_name: "whisper".to_string(),
            factory: "default".to_string(),
            service_path: "/srv/whisper/main.py".to_string(),
            env_name: Some("whisper_env".to_string()),
            dependency_path: None,
            python_version: Some("3.11".to_string()),
            port: None,
            install_dependencies: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["nodeName"], "whisper");
        assert_eq!(json["servicePath"], "/srv/whisper/main.py");
        assert_eq!(json["envName"], "whisper_env");
        assert!(json.get("port").is_none());
    }

    #[test]
    fn test_catalog_tolerates_missing_sections() {
        let catalog: CatalogResponse =
            serde_json::from_str(r#"{"nodes":{"yolo":{"bundleExists":true}}}"#).unwrap();
        assert!(catalog.categories.is_empty());
        assert!(catalog.nodes["yolo"].bundle_exists);
        assert_eq!(catalog.nodes["yolo"].runtime_config, RuntimeConfig::default());
    }
}
