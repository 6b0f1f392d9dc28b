//! Long-running operations tracked in the job ledger.

use std::path::{Path, PathBuf};

use remote_exec::TransferDirection;
use shared::{
    domain::{duration_millis, JobStatus},
    error::{ApiError, ErrorCode},
    protocol::{JobSummary, TrainingStateResponse},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{internal, registry::Device, start_service, stop_service, ApiContext};

pub const DATASET_IMPORT_JOB: &str = "dataset import";
pub const TRAINING_JOB: &str = "machine learning";
pub const TRAINING_DETAIL: &str = "training";
/// Registered service whose lifecycle mirrors the training job, if configured.
pub const TRAINING_SERVICE: &str = "model-training";

/// An accepted import. `transfer` resolves to whether the copy completed and
/// the job was cleared from the ledger.
#[derive(Debug)]
pub struct DatasetImport {
    pub job: JobSummary,
    pub transfer: JoinHandle<bool>,
}

/// Registers a pending import and copies the dataset from the configured
/// device in the background.
pub async fn import_dataset(ctx: &ApiContext, dataset: &str) -> Result<DatasetImport, ApiError> {
    let dataset = validate_dataset_name(dataset)?;
    let locations = &ctx.policy.datasets;
    let device = ctx.devices.get(&locations.device).cloned().ok_or_else(|| {
        ApiError::new(
            ErrorCode::Configuration,
            format!("no credentials configured for device '{}'", locations.device),
        )
    })?;

    let session = ctx.ledger.session().clone();
    let job = ctx
        .ledger
        .claim(&session, DATASET_IMPORT_JOB, &dataset, JobStatus::Pending)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::Conflict,
                format!("import of dataset '{dataset}' is already in flight"),
            )
        })?;
    info!(%dataset, device = %device.name, "jobs: dataset import accepted");

    let remote_path = format!("{}/{dataset}", locations.remote_dir.trim_end_matches('/'));
    let transfer = tokio::spawn(run_import(
        ctx.clone(),
        device,
        dataset,
        remote_path,
        locations.local_dir.clone(),
    ));

    Ok(DatasetImport {
        job: job.into(),
        transfer,
    })
}

/// Copies `remote_path` into `local_dir`; the recursive copy names the new
/// directory after the dataset.
async fn run_import(
    ctx: ApiContext,
    device: Device,
    dataset: String,
    remote_path: String,
    local_dir: PathBuf,
) -> bool {
    let session = ctx.ledger.session().clone();
    if let Err(err) = ctx
        .ledger
        .register(&session, DATASET_IMPORT_JOB, &dataset, JobStatus::Started)
        .await
    {
        warn!(%dataset, "jobs: could not mark import started: {err:#}");
    }

    if let Err(err) = prepare_destination(&local_dir, &dataset).await {
        warn!(%dataset, local_dir = %local_dir.display(), "jobs: dataset import failed: {err}");
        return false;
    }

    let report = match ctx
        .executor
        .transfer_file(
            TransferDirection::Get,
            &device.hostname,
            &device.credentials,
            &remote_path,
            &local_dir,
            ctx.policy.transfer_timeout,
        )
        .await
    {
        Ok(report) => report,
        Err(err) => {
            // The row stays so the failure is visible until the next restart.
            warn!(%dataset, %remote_path, "jobs: dataset import failed: {err}");
            return false;
        }
    };

    match ctx
        .ledger
        .complete(&session, DATASET_IMPORT_JOB, &dataset)
        .await
    {
        Ok(_) => {
            info!(
                %dataset,
                local_path = %report.local_path.join(&dataset).display(),
                elapsed_ms = duration_millis(report.elapsed),
                "jobs: dataset import completed"
            );
            true
        }
        Err(err) => {
            warn!(%dataset, "jobs: could not clear finished import: {err:#}");
            false
        }
    }
}

/// Ensures `local_dir` exists and holds nothing under the dataset's name, so a
/// copy left half-done by an earlier attempt is not merged into the new one.
async fn prepare_destination(local_dir: &Path, dataset: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(local_dir).await?;
    let target = local_dir.join(dataset);
    match tokio::fs::symlink_metadata(&target).await {
        Ok(meta) if meta.is_dir() => {
            debug!(path = %target.display(), "jobs: removing leftover dataset copy");
            tokio::fs::remove_dir_all(&target).await
        }
        Ok(_) => tokio::fs::remove_file(&target).await,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn validate_dataset_name(dataset: &str) -> Result<String, ApiError> {
    let dataset = dataset.trim();
    let invalid = dataset.is_empty()
        || dataset == "."
        || dataset == ".."
        || dataset.contains(['/', '\\']);
    if invalid {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("invalid dataset name '{dataset}'"),
        ));
    }
    Ok(dataset.to_string())
}

/// Starts the training service when one is registered, then marks training
/// as submitted.
pub async fn start_training(ctx: &ApiContext) -> Result<TrainingStateResponse, ApiError> {
    if ctx.services.get(TRAINING_SERVICE).is_some() {
        start_service(ctx, TRAINING_SERVICE).await?;
    }
    ctx.ledger
        .register(
            ctx.ledger.session(),
            TRAINING_JOB,
            TRAINING_DETAIL,
            JobStatus::Started,
        )
        .await
        .map_err(internal)?;
    info!("jobs: training submitted");
    Ok(TrainingStateResponse { is_alive: true })
}

pub async fn stop_training(ctx: &ApiContext) -> Result<TrainingStateResponse, ApiError> {
    let was_active = ctx
        .ledger
        .complete(ctx.ledger.session(), TRAINING_JOB, TRAINING_DETAIL)
        .await
        .map_err(internal)?;
    if ctx.services.get(TRAINING_SERVICE).is_some() {
        stop_service(ctx, TRAINING_SERVICE).await?;
    }
    info!(was_active, "jobs: training stopped");
    Ok(TrainingStateResponse { is_alive: false })
}

pub async fn training_state(ctx: &ApiContext) -> Result<TrainingStateResponse, ApiError> {
    let is_alive = ctx
        .ledger
        .is_active(ctx.ledger.session(), TRAINING_JOB, TRAINING_DETAIL)
        .await
        .map_err(internal)?;
    Ok(TrainingStateResponse { is_alive })
}

#[cfg(test)]
mod tests {
    use super::validate_dataset_name;

    #[test]
    fn dataset_names_cannot_escape_the_datasets_dir() {
        for name in ["", "  ", ".", "..", "a/b", "..\\up"] {
            assert!(validate_dataset_name(name).is_err(), "{name:?}");
        }
        assert_eq!(
            validate_dataset_name(" 2024-01-05 ").expect("valid"),
            "2024-01-05"
        );
    }
}
