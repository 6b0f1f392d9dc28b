use shared::domain::{EventKind, JobStatus, SessionId};
use storage::{JobLedger, Storage};

fn database_url(dir: &tempfile::TempDir) -> String {
    let path = dir.path().join("coordinator.db");
    format!("sqlite://{}", path.to_string_lossy().replace('\\', "/"))
}

#[tokio::test]
async fn interrupted_import_is_purged_when_coordinator_restarts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = database_url(&dir);
    let first_run = SessionId::from("sess-1");

    {
        let storage = Storage::new(&url).await.expect("first run db");
        let ledger = JobLedger::open(storage.clone(), first_run.clone())
            .await
            .expect("first ledger");
        ledger
            .register(
                &first_run,
                "dataset import",
                "dataset_3_24-01-01",
                JobStatus::Pending,
            )
            .await
            .expect("register import");
        storage
            .record_service_event("angle-model-pi", "pi.local", EventKind::Start)
            .await
            .expect("start intent");
        storage.pool().close().await;
    }

    let storage = Storage::new(&url).await.expect("second run db");
    let second_run = SessionId::from("sess-2");
    let ledger = JobLedger::open(storage.clone(), second_run)
        .await
        .expect("second ledger");

    assert_eq!(ledger.purged_on_open(), 1);
    let still_active = ledger
        .is_active(&first_run, "dataset import", "dataset_3_24-01-01")
        .await
        .expect("is_active");
    assert!(!still_active);

    let intent = storage
        .latest_service_event("angle-model-pi", "pi.local")
        .await
        .expect("latest")
        .expect("intent survives restart");
    assert_eq!(intent.kind, EventKind::Start);
}
