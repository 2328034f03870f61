//! Integration tests for bundle installs and platform download tracking.
//!
//! Flows covered:
//! 1. Full install with catalog refresh and a single completion notice
//! 2. Single-flight refusal
//! 3. Out-of-order, unknown and failing events
//! 4. Start failures
//! 5. Download progress stream

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nodeorch_events::{
    DownloadProgressEvent, DownloadProgressState, InstallEvent, InstallEventStatus, InstallStep,
};
use nodeorch_orchestrator::download::DownloadTerminal;
use nodeorch_orchestrator::install::StepStatus;
use nodeorch_orchestrator::{
    BundleDescriptor, CommandOutcome, Config, EventStream, JobOutcome, MockBackend, MockCall,
    Notice, Orchestrator, OrchestratorError, RuntimeConfig,
};
use tokio::sync::broadcast;

const MB: u64 = 1024 * 1024;

fn bundle(model: &str) -> BundleDescriptor {
    BundleDescriptor {
        model_name: model.to_string(),
        bundle_ref: format!("{model}-cpu"),
        filename: Some(format!("{model}-cpu.tar.zst")),
        entry_path: Some("bin/serve".to_string()),
        size_bytes: Some(80 * MB),
        checksum: None,
    }
}

async fn setup(backend: Arc<MockBackend>) -> Orchestrator {
    backend.add_bundle(bundle("yolo"));
    backend.add_bundle(bundle("sam"));
    let orchestrator = Orchestrator::new(Config::default(), backend);
    orchestrator.initialize().await;
    orchestrator
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

fn drain(rx: &mut broadcast::Receiver<Notice>) -> Vec<Notice> {
    let mut notices = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        notices.push(notice);
    }
    notices
}

fn event(step: InstallStep, status: InstallEventStatus) -> InstallEvent {
    InstallEvent::new(step, status)
}

async fn job_finished(orchestrator: &Orchestrator) -> bool {
    orchestrator
        .install_job()
        .await
        .is_some_and(|job| job.is_finished())
}

#[tokio::test]
async fn test_install_completes_and_refreshes_catalog() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = setup(backend.clone()).await;
    let mut notices = orchestrator.subscribe_notices();

    let install_id = orchestrator
        .install("yolo-cpu")
        .await
        .unwrap()
        .accepted()
        .unwrap();

    backend
        .emit_install(event(InstallStep::Authenticate, InstallEventStatus::Done))
        .await;
    backend
        .emit_install(
            event(InstallStep::Download, InstallEventStatus::Active).with_bytes(20 * MB, 80 * MB),
        )
        .await;

    eventually(|| async {
        orchestrator
            .install_job()
            .await
            .is_some_and(|job| job.progress_percent == 25)
    })
    .await;
    let job = orchestrator.install_job().await.unwrap();
    assert_eq!(job.progress_text.as_deref(), Some("20.0 / 80.0 MB"));
    assert_eq!(job.current_step(), InstallStep::Download);

    for step in &InstallStep::ORDER[1..6] {
        backend
            .emit_install(event(*step, InstallEventStatus::Done))
            .await;
    }
    // The backend has persisted the node by the time it reports ready.
    backend.add_node(
        "yolo",
        "vision",
        RuntimeConfig {
            service_path: Some("/bundles/yolo/bin/serve".to_string()),
            ..RuntimeConfig::default()
        },
        true,
    );
    backend
        .emit_install(event(InstallStep::Ready, InstallEventStatus::Done))
        .await;

    eventually(|| job_finished(&orchestrator)).await;
    let job = orchestrator.install_job().await.unwrap();
    assert_eq!(job.install_id, install_id);
    assert_eq!(job.outcome, JobOutcome::Succeeded);
    assert_eq!(job.progress_percent, 100);
    assert!(job.steps.iter().all(|s| s.status == StepStatus::Done));

    eventually(|| async { orchestrator.node("yolo").await.is_some_and(|n| n.bundle_exists) })
        .await;
    eventually(|| async { backend.live_install_streams() == 0 }).await;
    assert!(!orchestrator.streams().has_install().await);

    let completed = drain(&mut notices)
        .into_iter()
        .filter(|n| matches!(n, Notice::InstallCompleted { .. }))
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn test_second_install_rejected_while_in_flight() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = setup(backend.clone()).await;
    let mut notices = orchestrator.subscribe_notices();

    let first = orchestrator.install("yolo-cpu").await.unwrap();
    assert!(first.is_accepted());

    let second = orchestrator.install("sam-cpu").await.unwrap();
    assert!(matches!(second, CommandOutcome::Rejected { .. }));
    assert_eq!(backend.count(|c| matches!(c, MockCall::InstallBundle(_))), 1);
    assert!(drain(&mut notices)
        .iter()
        .any(|n| matches!(n, Notice::Rejected { subject, .. } if subject == "sam-cpu")));

    backend
        .emit_install(event(InstallStep::Ready, InstallEventStatus::Done))
        .await;
    eventually(|| job_finished(&orchestrator)).await;

    let third = orchestrator.install("sam-cpu").await.unwrap();
    assert!(third.is_accepted());
    assert_eq!(backend.count(|c| matches!(c, MockCall::InstallBundle(_))), 2);
}

#[tokio::test]
async fn test_out_of_order_events_never_regress() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = setup(backend.clone()).await;
    orchestrator.install("yolo-cpu").await.unwrap();

    backend
        .emit_install(event(InstallStep::Verify, InstallEventStatus::Active))
        .await;
    backend
        .emit_install(
            event(InstallStep::Download, InstallEventStatus::Active).with_bytes(40 * MB, 80 * MB),
        )
        .await;
    backend
        .emit_install(InstallEvent {
            step: "warmup".to_string(),
            status: InstallEventStatus::Active,
            received_bytes: None,
            total_bytes: None,
            message: None,
        })
        .await;

    eventually(|| async {
        orchestrator
            .install_job()
            .await
            .is_some_and(|job| job.progress_percent == 50)
    })
    .await;

    let job = orchestrator.install_job().await.unwrap();
    assert_eq!(job.step_status(InstallStep::Authenticate), StepStatus::Done);
    assert_eq!(job.step_status(InstallStep::Download), StepStatus::Done);
    assert_eq!(job.step_status(InstallStep::Verify), StepStatus::Active);
    assert_eq!(job.step_status(InstallStep::Unpack), StepStatus::Pending);
    assert_eq!(job.outcome, JobOutcome::InFlight);
    assert!(orchestrator.streams().has_install().await);
}

#[tokio::test]
async fn test_failed_step_is_flagged() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = setup(backend.clone()).await;
    let mut notices = orchestrator.subscribe_notices();
    let install_id = orchestrator
        .install("yolo-cpu")
        .await
        .unwrap()
        .accepted()
        .unwrap();

    backend
        .emit_install(
            event(InstallStep::Unpack, InstallEventStatus::Failed).with_message("disk full"),
        )
        .await;

    eventually(|| job_finished(&orchestrator)).await;
    let job = orchestrator.install_job().await.unwrap();
    assert_eq!(job.outcome, JobOutcome::Failed);
    assert_eq!(job.step_status(InstallStep::Verify), StepStatus::Done);
    assert_eq!(job.step_status(InstallStep::Unpack), StepStatus::Failed);
    let failure = job.failure.unwrap();
    assert_eq!(failure.step, InstallStep::Unpack);
    assert_eq!(failure.message.as_deref(), Some("disk full"));

    eventually(|| async { !orchestrator.streams().has_install().await }).await;
    let notices = drain(&mut notices);
    assert!(notices.contains(&Notice::InstallFailed {
        install_id,
        bundle_ref: "yolo-cpu".to_string(),
        step: Some("unpack".to_string()),
        message: "disk full".to_string(),
    }));

    // The slot is free again.
    assert!(orchestrator.install("sam-cpu").await.unwrap().is_accepted());
}

#[tokio::test]
async fn test_stream_end_fails_job() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = setup(backend.clone()).await;
    orchestrator.install("yolo-cpu").await.unwrap();

    backend
        .emit_install(event(InstallStep::Download, InstallEventStatus::Active))
        .await;
    eventually(|| async {
        orchestrator
            .install_job()
            .await
            .is_some_and(|job| job.current_step() == InstallStep::Download)
    })
    .await;
    backend.close_install();

    eventually(|| job_finished(&orchestrator)).await;
    let job = orchestrator.install_job().await.unwrap();
    assert_eq!(job.outcome, JobOutcome::Failed);
    assert_eq!(job.step_status(InstallStep::Download), StepStatus::Failed);
}

#[tokio::test]
async fn test_install_call_failure_marks_first_step() {
    let backend = Arc::new(MockBackend::new());
    backend.fail_install(Some("quota exceeded"));
    let orchestrator = setup(backend.clone()).await;
    let mut notices = orchestrator.subscribe_notices();

    let err = orchestrator.install("yolo-cpu").await.unwrap_err();
    assert!(err.is_backend());

    let job = orchestrator.install_job().await.unwrap();
    assert_eq!(job.outcome, JobOutcome::Failed);
    assert_eq!(job.step_status(InstallStep::Authenticate), StepStatus::Failed);
    assert_eq!(backend.count(|c| matches!(c, MockCall::SubscribeInstall(_))), 0);
    assert!(drain(&mut notices).iter().any(|n| matches!(
        n,
        Notice::InstallFailed { step: Some(step), .. } if step == "authenticate"
    )));

    backend.fail_install(None);
    assert!(orchestrator.install("yolo-cpu").await.unwrap().is_accepted());
}

#[tokio::test]
async fn test_unknown_bundle() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = setup(backend.clone()).await;

    let err = orchestrator.install("missing-bundle").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownBundle(_)));
    assert!(orchestrator.install_job().await.is_none());
}

#[tokio::test]
async fn test_download_progress_tracking() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = setup(backend).await;
    let mut notices = orchestrator.subscribe_notices();

    let (tx, events) = EventStream::channel(8);
    assert!(orchestrator.track_downloads(events).await);
    let (_unused_tx, duplicate) = EventStream::channel(8);
    assert!(!orchestrator.track_downloads(duplicate).await);

    let url = "https://cdn.example.com/yolo-cpu.tar.zst".to_string();
    tx.send(DownloadProgressEvent {
        state: DownloadProgressState::Progressing,
        received_bytes: 30 * MB,
        total_bytes: 120 * MB,
        url: url.clone(),
        file_path: None,
    })
    .await
    .unwrap();

    eventually(|| async { orchestrator.download_state().await.percent == 25 }).await;
    let state = orchestrator.download_state().await;
    assert!(state.active);
    assert_eq!(state.url, url);

    tx.send(DownloadProgressEvent {
        state: DownloadProgressState::Completed,
        received_bytes: 120 * MB,
        total_bytes: 120 * MB,
        url: url.clone(),
        file_path: Some("/downloads/yolo-cpu.tar.zst".to_string()),
    })
    .await
    .unwrap();

    eventually(|| async { !orchestrator.download_state().await.active }).await;
    let state = orchestrator.download_state().await;
    assert_eq!(
        state.terminal_state,
        Some(DownloadTerminal::Completed {
            file_path: Some("/downloads/yolo-cpu.tar.zst".to_string())
        })
    );
    assert!(drain(&mut notices).contains(&Notice::DownloadCompleted {
        url,
        file_path: Some("/downloads/yolo-cpu.tar.zst".to_string()),
    }));
}
