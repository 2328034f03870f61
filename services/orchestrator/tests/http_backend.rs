//! HTTP backend tests against a wiremock server.
//!
//! Covers JSON request/response shapes, error mapping, SSE decoding and one
//! activation driven end to end over HTTP.

use std::sync::Arc;
use std::time::Duration;

use nodeorch_events::{ActivationEvent, ActivationEventStatus, InstallEventStatus, InstallId};
use nodeorch_orchestrator::client::InstallRequest;
use nodeorch_orchestrator::{
    ActivationPath, ActivationStatus, Backend, BackendError, BundleDescriptor, CommandOutcome,
    Config, HttpBackend, Orchestrator,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(server: &MockServer) -> Config {
    Config {
        backend_url: server.uri(),
        request_timeout_secs: 5,
        ..Config::default()
    }
}

fn sse(frames: &[&str]) -> ResponseTemplate {
    let body: String = frames.iter().map(|f| format!("{f}\n\n")).collect();
    ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/event-stream")
}

fn catalog_body() -> serde_json::Value {
    json!({
        "categories": { "vision": ["yolo"] },
        "categoryNames": { "vision": "Computer Vision" },
        "nodes": {
            "yolo": {
                "runtimeConfig": { "servicePath": "/opt/yolo/serve", "port": 9000 },
                "bundleExists": true
            }
        }
    })
}

#[tokio::test]
async fn test_fetch_catalog_and_running() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(catalog_body()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/nodes/running"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "yolo": { "running": true, "envName": "yolo_env", "port": 9000 }
        })))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(&test_config(&server)).unwrap();

    let catalog = backend.fetch_catalog().await.unwrap();
    assert_eq!(catalog.categories["vision"], vec!["yolo".to_string()]);
    assert_eq!(catalog.category_names["vision"], "Computer Vision");
    let yolo = &catalog.nodes["yolo"];
    assert!(yolo.bundle_exists);
    assert_eq!(yolo.runtime_config.port, Some(9000));

    let running = backend.fetch_running().await.unwrap();
    assert!(running["yolo"].running);
    assert_eq!(running["yolo"].env_name.as_deref(), Some("yolo_env"));
}

#[tokio::test]
async fn test_register_and_stop_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/nodes/register"))
        .and(body_json(json!({
            "nodeName": "whisper",
            "factory": "default",
            "servicePath": "/opt/whisper/main.py",
            "envName": "whisper_env",
            "installDependencies": false
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accepted": true,
            "logPath": "/logs/whisper.log"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/nodes/stop"))
        .and(body_json(json!({ "envName": "whisper_env" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpBackend::new(&test_config(&server)).unwrap();
    let request = nodeorch_orchestrator::activation::request_from_config(
        "whisper",
        "default",
        &nodeorch_orchestrator::RuntimeConfig {
            service_path: Some("/opt/whisper/main.py".to_string()),
            env_name: Some("whisper_env".to_string()),
            ..Default::default()
        },
    )
    .unwrap();

    let response = backend.register(&request).await.unwrap();
    assert!(response.accepted);
    assert_eq!(response.log_path.as_deref(), Some("/logs/whisper.log"));

    // Empty 200 body is accepted.
    backend.stop("whisper_env").await.unwrap();
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/nodes/yolo"))
        .respond_with(ResponseTemplate::new(409).set_body_string("node is running"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/bundles"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(&test_config(&server)).unwrap();

    let err = backend.delete("yolo").await.unwrap_err();
    match err {
        BackendError::Status { status, body, .. } => {
            assert_eq!(status, 409);
            assert_eq!(body, "node is running");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let err = backend.fetch_bundles().await.unwrap_err();
    assert!(matches!(err, BackendError::Decode { .. }));
}

#[tokio::test]
async fn test_stop_ignores_response_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/nodes/stop"))
        .respond_with(ResponseTemplate::new(200).set_body_string("stopped yolo_env"))
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpBackend::new(&test_config(&server)).unwrap();
    backend.stop("yolo_env").await.unwrap();
}

#[tokio::test]
async fn test_node_names_are_escaped() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/nodes/my%20node"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpBackend::new(&test_config(&server)).unwrap();
    backend.delete("my node").await.unwrap();
}

#[tokio::test]
async fn test_activation_stream_skips_malformed_frames() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/nodes/yolo/events"))
        .and(header("accept", "text/event-stream"))
        .respond_with(sse(&[
            r#"data: {"status":"starting"}"#,
            ": keep-alive",
            "data: not json",
            r#"data: {"status":"failed","data":{"logPath":"/logs/yolo.log","port":9000}}"#,
        ]))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(&test_config(&server)).unwrap();
    let mut stream = backend.subscribe_activation("yolo").await.unwrap();

    assert_eq!(stream.next().await, Some(ActivationEvent::starting()));
    let failed = stream.next().await.unwrap();
    assert_eq!(failed.status, ActivationEventStatus::Failed);
    assert_eq!(failed.data.log_path.as_deref(), Some("/logs/yolo.log"));
    assert_eq!(failed.data.port, Some(9000));
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn test_install_round_trip() {
    let server = MockServer::start().await;
    let install_id = InstallId::new();
    let events_path = format!("/v1/installs/{install_id}/events");

    Mock::given(method("POST"))
        .and(path("/v1/bundles/install"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "installId": install_id.to_string() })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(events_path.as_str()))
        .respond_with(sse(&[
            r#"data: {"step":"download","status":"active","receivedBytes":10,"totalBytes":40}"#,
            r#"data: {"step":"ready","status":"done"}"#,
        ]))
        .mount(&server)
        .await;

    let backend = HttpBackend::new(&test_config(&server)).unwrap();
    let response = backend
        .install_bundle(&InstallRequest {
            install_id,
            bundle: BundleDescriptor {
                model_name: "yolo".to_string(),
                bundle_ref: "yolo-cpu".to_string(),
                filename: None,
                entry_path: None,
                size_bytes: None,
                checksum: None,
            },
        })
        .await
        .unwrap();
    assert_eq!(response.install_id, install_id);

    let mut stream = backend.subscribe_install(&install_id).await.unwrap();
    let download = stream.next().await.unwrap();
    assert_eq!(download.step, "download");
    assert_eq!(download.received_bytes, Some(10));
    let ready = stream.next().await.unwrap();
    assert_eq!(ready.status, InstallEventStatus::Done);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_activation_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(catalog_body()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/nodes/running"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/bundles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/nodes/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accepted": true,
            "logPath": "/logs/yolo.log"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/nodes/yolo/events"))
        .respond_with(sse(&[
            r#"data: {"status":"starting"}"#,
            r#"data: {"status":"ready"}"#,
        ]))
        .mount(&server)
        .await;

    let backend = Arc::new(HttpBackend::new(&test_config(&server)).unwrap());
    let orchestrator = Orchestrator::new(test_config(&server), backend);
    let report = orchestrator.initialize().await;
    assert!(report.is_complete());

    let outcome = orchestrator.activate("yolo", "default").await.unwrap();
    assert_eq!(
        outcome,
        CommandOutcome::Accepted(ActivationPath::Started {
            log_path: Some("/logs/yolo.log".to_string())
        })
    );

    let ready = tokio::time::timeout(Duration::from_secs(5), async {
        while orchestrator.activation().status("yolo").await != ActivationStatus::Ready {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(ready.is_ok());
    assert_eq!(
        orchestrator.activation().log_path("yolo").await.as_deref(),
        Some("/logs/yolo.log")
    );
}
