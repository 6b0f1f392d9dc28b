use super::*;
use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use remote_exec::{
    CommandOutput, Credentials, ExitStatusCode, RemoteError, TransferDirection, TransferReport,
};
use shared::{
    domain::{HealthProbeResult, JobStatus, ServiceStatus, SessionId},
    protocol::JobSummary,
};
use tokio::sync::Notify;

#[derive(Default)]
struct FakeExecutor {
    calls: Mutex<Vec<String>>,
    failing: bool,
    misconfigured: bool,
    transfer_gate: Option<Arc<Notify>>,
}

impl FakeExecutor {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls").push(call);
    }

    fn outcome(&self, what: &str) -> Result<(), RemoteError> {
        if self.misconfigured {
            return Err(RemoteError::Configuration("username is required".into()));
        }
        if self.failing {
            return Err(RemoteError::Failed {
                what: what.to_string(),
                status: ExitStatusCode(Some(255)),
                stderr: "Connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run_command(
        &self,
        host: &str,
        _credentials: &Credentials,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        self.record(format!("{host}: {command}"));
        self.outcome("ssh")?;
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::from_millis(5),
        })
    }

    async fn transfer_file(
        &self,
        direction: TransferDirection,
        host: &str,
        _credentials: &Credentials,
        remote_path: &str,
        local_path: &Path,
        _timeout: Duration,
    ) -> Result<TransferReport, RemoteError> {
        self.record(format!("{host}:{remote_path} -> {}", local_path.display()));
        if let Some(gate) = &self.transfer_gate {
            gate.notified().await;
        }
        self.outcome("scp")?;
        Ok(TransferReport {
            direction,
            remote_path: remote_path.to_string(),
            local_path: local_path.to_path_buf(),
            elapsed: Duration::from_millis(20),
        })
    }
}

fn pi() -> Device {
    Device {
        name: "pi".into(),
        hostname: "ryanzotti.local".into(),
        credentials: Credentials::new("pi").with_password("raspberry"),
    }
}

fn fleet() -> Vec<ServiceDescriptor> {
    let mut video = ServiceDescriptor::new("video", "ryanzotti.local", 8091);
    video.start_command = Some("systemctl start video".into());
    video.stop_command = Some("systemctl stop video".into());

    let mut orphan = ServiceDescriptor::new("lidar", "10.0.0.9", 8093);
    orphan.start_command = Some("lidar --serve".into());

    vec![
        ServiceDescriptor::new("memory", "localhost", 8095),
        video,
        orphan,
        ServiceDescriptor::new("angle-model-pi", "ryanzotti.local", 8885)
            .with_kind(shared::domain::ServiceKind::Model),
    ]
}

async fn context(
    executor: Arc<FakeExecutor>,
    services: Vec<ServiceDescriptor>,
) -> (ApiContext, ProbePublisher) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let ledger = JobLedger::open(storage.clone(), SessionId::from("session-under-test"))
        .await
        .expect("ledger");
    let (publisher, probes) = probe_board();
    let ctx = ApiContext {
        storage,
        ledger,
        services: Arc::new(ServiceRegistry::new(services).expect("registry")),
        devices: Arc::new(DeviceRegistry::new([pi()])),
        probes,
        executor,
        policy: Policy::default(),
    };
    (ctx, publisher)
}

fn probe(service: &str, is_healthy: bool) -> HealthProbeResult {
    HealthProbeResult {
        service: service.into(),
        is_healthy,
        timestamp: Utc::now(),
        latency: Duration::from_millis(7),
    }
}

#[tokio::test]
async fn unknown_service_is_not_found() {
    let (ctx, _publisher) = context(Arc::default(), fleet()).await;
    let err = query_status(&ctx, "toaster").await.expect_err("unknown");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn status_follows_intent_and_latest_probe() {
    let (ctx, publisher) = context(Arc::default(), fleet()).await;

    let status = query_status(&ctx, "memory").await.expect("status");
    assert_eq!(status.status, ServiceStatus::Off);
    assert!(status.last_probe_at.is_none());

    let action = start_service(&ctx, "memory").await.expect("start");
    assert_eq!(action.event, EventKind::Start);
    assert!(action.command.is_none());

    assert_eq!(
        query_status(&ctx, "memory").await.expect("status").status,
        ServiceStatus::StartingUp
    );

    publisher.publish(probe("memory", true));
    let status = query_status(&ctx, "memory").await.expect("status");
    assert_eq!(status.status, ServiceStatus::Healthy);
    assert_eq!(status.probe_latency_ms, Some(7));

    stop_service(&ctx, "memory").await.expect("stop");
    assert_eq!(
        query_status(&ctx, "memory").await.expect("status").status,
        ServiceStatus::ShuttingDown
    );

    publisher.publish(probe("memory", false));
    assert_eq!(
        query_status(&ctx, "memory").await.expect("status").status,
        ServiceStatus::Off
    );
}

#[tokio::test]
async fn list_statuses_covers_every_registered_service() {
    let (ctx, _publisher) = context(Arc::default(), fleet()).await;
    let statuses = list_statuses(&ctx).await.expect("statuses");
    let names: Vec<_> = statuses.iter().map(|s| s.service.as_str()).collect();
    assert_eq!(names, ["memory", "video", "lidar", "angle-model-pi"]);
    assert!(statuses.iter().all(|s| s.status == ServiceStatus::Off));
}

#[tokio::test]
async fn start_command_runs_on_the_service_device() {
    let executor = Arc::new(FakeExecutor::default());
    let (ctx, _publisher) = context(executor.clone(), fleet()).await;

    let action = start_service(&ctx, "video").await.expect("start");
    let report = action.command.expect("command report");
    assert!(report.succeeded);
    assert_eq!(executor.calls(), ["ryanzotti.local: systemctl start video"]);
}

#[tokio::test]
async fn failed_command_keeps_the_recorded_intent() {
    let executor = Arc::new(FakeExecutor {
        failing: true,
        ..FakeExecutor::default()
    });
    let (ctx, _publisher) = context(executor, fleet()).await;

    let action = stop_service(&ctx, "video").await.expect("stop");
    let report = action.command.expect("command report");
    assert!(!report.succeeded);
    assert!(report
        .message
        .as_deref()
        .is_some_and(|m| m.contains("Connection refused")));

    let latest = ctx
        .storage
        .latest_service_event("video", "ryanzotti.local")
        .await
        .expect("latest")
        .expect("event");
    assert_eq!(latest.kind, EventKind::Stop);
}

#[tokio::test]
async fn command_without_device_is_rejected_before_recording() {
    let executor = Arc::new(FakeExecutor::default());
    let (ctx, _publisher) = context(executor.clone(), fleet()).await;

    let err = start_service(&ctx, "lidar").await.expect_err("no device");
    assert_eq!(err.code, ErrorCode::Configuration);
    assert!(executor.calls().is_empty());
    let latest = ctx
        .storage
        .latest_service_event("lidar", "10.0.0.9")
        .await
        .expect("latest");
    assert!(latest.is_none());
}

fn use_temp_datasets_dir(ctx: &mut ApiContext) -> tempfile::TempDir {
    let datasets = tempfile::tempdir().expect("tempdir");
    ctx.policy.datasets.local_dir = datasets.path().to_path_buf();
    datasets
}

#[tokio::test]
async fn dataset_import_is_tracked_until_the_copy_finishes() {
    let gate = Arc::new(Notify::new());
    let executor = Arc::new(FakeExecutor {
        transfer_gate: Some(gate.clone()),
        ..FakeExecutor::default()
    });
    let (mut ctx, _publisher) = context(executor.clone(), fleet()).await;
    let datasets = use_temp_datasets_dir(&mut ctx);

    let import = import_dataset(&ctx, "2024-01-05").await.expect("import");
    assert_eq!(import.job.status, JobStatus::Pending);
    assert!(
        is_job_active(&ctx, DATASET_IMPORT_JOB, "2024-01-05")
            .await
            .expect("active")
            .is_active
    );

    let duplicate = import_dataset(&ctx, "2024-01-05")
        .await
        .expect_err("in flight");
    assert_eq!(duplicate.code, ErrorCode::Conflict);

    gate.notify_one();
    assert!(import.transfer.await.expect("join"));
    assert!(
        !is_job_active(&ctx, DATASET_IMPORT_JOB, "2024-01-05")
            .await
            .expect("active")
            .is_active
    );
    // scp -r creates <datasets>/2024-01-05 itself when given the parent.
    assert_eq!(
        executor.calls(),
        [format!(
            "ryanzotti.local:/home/pi/datasets/2024-01-05 -> {}",
            datasets.path().display()
        )]
    );
}

#[tokio::test]
async fn concurrent_imports_of_one_dataset_admit_one() {
    let gate = Arc::new(Notify::new());
    let executor = Arc::new(FakeExecutor {
        transfer_gate: Some(gate.clone()),
        ..FakeExecutor::default()
    });
    let (mut ctx, _publisher) = context(executor.clone(), fleet()).await;
    let _datasets = use_temp_datasets_dir(&mut ctx);

    let (first, second) = tokio::join!(
        import_dataset(&ctx, "2024-01-08"),
        import_dataset(&ctx, "2024-01-08")
    );
    let (accepted, rejected) = match (first, second) {
        (Ok(import), Err(err)) | (Err(err), Ok(import)) => (import, err),
        (first, second) => panic!("expected one winner, got {first:?} and {second:?}"),
    };
    assert_eq!(rejected.code, ErrorCode::Conflict);

    gate.notify_one();
    assert!(accepted.transfer.await.expect("join"));
    assert_eq!(executor.calls().len(), 1);
}

#[tokio::test]
async fn import_replaces_a_leftover_partial_copy() {
    let executor = Arc::new(FakeExecutor::default());
    let (mut ctx, _publisher) = context(executor.clone(), fleet()).await;
    let datasets = use_temp_datasets_dir(&mut ctx);
    let leftover = datasets.path().join("2024-01-07");
    std::fs::create_dir_all(&leftover).expect("leftover dir");
    std::fs::write(leftover.join("stale.txt"), b"half copied").expect("stale file");

    let import = import_dataset(&ctx, "2024-01-07").await.expect("import");
    assert!(import.transfer.await.expect("join"));

    assert!(!leftover.exists(), "leftover copy should be removed first");
    assert!(executor.calls()[0].ends_with(&format!("-> {}", datasets.path().display())));
}

#[tokio::test]
async fn import_creates_a_missing_datasets_dir() {
    let executor = Arc::new(FakeExecutor::default());
    let (mut ctx, _publisher) = context(executor, fleet()).await;
    let root = use_temp_datasets_dir(&mut ctx);
    let local_dir = root.path().join("not-yet").join("datasets");
    ctx.policy.datasets.local_dir = local_dir.clone();

    let import = import_dataset(&ctx, "2024-01-09").await.expect("import");
    assert!(import.transfer.await.expect("join"));
    assert!(local_dir.is_dir());
}

#[tokio::test]
async fn failed_import_stays_in_the_ledger() {
    let executor = Arc::new(FakeExecutor {
        failing: true,
        ..FakeExecutor::default()
    });
    let (mut ctx, _publisher) = context(executor, fleet()).await;
    let _datasets = use_temp_datasets_dir(&mut ctx);

    let import = import_dataset(&ctx, "2024-01-06").await.expect("import");
    assert!(!import.transfer.await.expect("join"));

    let active = list_active_jobs(&ctx).await.expect("jobs");
    let statuses: Vec<_> = active
        .iter()
        .map(|job: &JobSummary| (job.detail.as_str(), job.status))
        .collect();
    assert_eq!(statuses, [("2024-01-06", JobStatus::Started)]);
}

#[tokio::test]
async fn import_rejects_path_like_names() {
    let (ctx, _publisher) = context(Arc::default(), fleet()).await;
    let err = import_dataset(&ctx, "../etc").await.expect_err("invalid");
    assert_eq!(err.code, ErrorCode::Validation);
    assert!(list_active_jobs(&ctx).await.expect("jobs").is_empty());
}

#[tokio::test]
async fn training_job_and_service_move_together() {
    let mut services = fleet();
    services.push(ServiceDescriptor::new(TRAINING_SERVICE, "localhost", 8890));
    let (ctx, _publisher) = context(Arc::default(), services).await;

    assert!(!training_state(&ctx).await.expect("state").is_alive);
    assert!(start_training(&ctx).await.expect("start").is_alive);
    assert!(training_state(&ctx).await.expect("state").is_alive);
    assert_eq!(
        query_status(&ctx, TRAINING_SERVICE)
            .await
            .expect("status")
            .status,
        ServiceStatus::StartingUp
    );

    assert!(!stop_training(&ctx).await.expect("stop").is_alive);
    assert!(!training_state(&ctx).await.expect("state").is_alive);
    let latest = ctx
        .storage
        .latest_service_event(TRAINING_SERVICE, "localhost")
        .await
        .expect("latest")
        .expect("event");
    assert_eq!(latest.kind, EventKind::Stop);
}

#[tokio::test]
async fn reachability_maps_failures_to_false() {
    let executor = Arc::new(FakeExecutor::default());
    let (ctx, _publisher) = context(executor.clone(), fleet()).await;
    let reachable = check_device_reachable(&ctx, "PI").await.expect("check");
    assert_eq!(reachable.device, "pi");
    assert!(reachable.is_able_to_connect);
    assert_eq!(executor.calls(), ["ryanzotti.local: ls -ltr"]);

    let (ctx, _publisher) = context(
        Arc::new(FakeExecutor {
            failing: true,
            ..FakeExecutor::default()
        }),
        fleet(),
    )
    .await;
    assert!(
        !check_device_reachable(&ctx, "pi")
            .await
            .expect("check")
            .is_able_to_connect
    );

    let err = check_device_reachable(&ctx, "laptop")
        .await
        .expect_err("unknown device");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn reachability_surfaces_configuration_errors() {
    let executor = Arc::new(FakeExecutor {
        misconfigured: true,
        ..FakeExecutor::default()
    });
    let (ctx, _publisher) = context(executor, fleet()).await;
    let err = check_device_reachable(&ctx, "pi")
        .await
        .expect_err("misconfigured");
    assert_eq!(err.code, ErrorCode::Configuration);
}
