use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use remote_exec::RemoteExecutor;
use shared::{
    domain::{duration_millis, EventKind, ServiceDescriptor},
    error::{ApiError, ErrorCode},
    protocol::{
        CommandReport, DeviceReachabilityResponse, JobActiveResponse, JobSummary,
        ServiceActionResponse, ServiceStatusResponse,
    },
};
use storage::{JobLedger, Storage};
use tracing::{debug, info, warn};

pub mod jobs;
pub mod probe;
pub mod registry;
pub mod status;

pub use jobs::{
    import_dataset, start_training, stop_training, training_state, DatasetImport,
    DATASET_IMPORT_JOB, TRAINING_DETAIL, TRAINING_JOB, TRAINING_SERVICE,
};
pub use probe::{probe_board, HealthProber, ProbeBoard, ProbePublisher, ProbeTimeouts};
pub use registry::{Device, DeviceRegistry, ServiceRegistry};
pub use status::{resolve_status, GracePeriods};

const REACHABILITY_COMMAND: &str = "ls -ltr";

/// Where dataset imports copy from and to.
#[derive(Debug, Clone)]
pub struct DatasetLocations {
    pub device: String,
    pub remote_dir: String,
    pub local_dir: PathBuf,
}

impl Default for DatasetLocations {
    fn default() -> Self {
        Self {
            device: "pi".into(),
            remote_dir: "/home/pi/datasets".into(),
            local_dir: PathBuf::from("./data/datasets"),
        }
    }
}

/// Timeouts and grace periods applied by the coordinator operations.
#[derive(Debug, Clone)]
pub struct Policy {
    pub grace: GracePeriods,
    pub command_timeout: Duration,
    pub reachability_timeout: Duration,
    pub transfer_timeout: Duration,
    pub datasets: DatasetLocations,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            grace: GracePeriods::default(),
            command_timeout: Duration::from_secs(20),
            reachability_timeout: Duration::from_secs(3),
            transfer_timeout: Duration::from_secs(30 * 60),
            datasets: DatasetLocations::default(),
        }
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub ledger: JobLedger,
    pub services: Arc<ServiceRegistry>,
    pub devices: Arc<DeviceRegistry>,
    pub probes: ProbeBoard,
    pub executor: Arc<dyn RemoteExecutor>,
    pub policy: Policy,
}

pub async fn query_status(
    ctx: &ApiContext,
    service: &str,
) -> Result<ServiceStatusResponse, ApiError> {
    let descriptor = find_service(ctx, service)?;
    status_at(ctx, descriptor, Utc::now()).await
}

pub async fn list_statuses(ctx: &ApiContext) -> Result<Vec<ServiceStatusResponse>, ApiError> {
    let now = Utc::now();
    let mut statuses = Vec::with_capacity(ctx.services.len());
    for descriptor in ctx.services.iter() {
        statuses.push(status_at(ctx, descriptor, now).await?);
    }
    Ok(statuses)
}

async fn status_at(
    ctx: &ApiContext,
    descriptor: &ServiceDescriptor,
    now: DateTime<Utc>,
) -> Result<ServiceStatusResponse, ApiError> {
    let tail = ctx
        .storage
        .service_event_tail(&descriptor.name, &descriptor.host)
        .await
        .map_err(internal)?;
    let probe = ctx.probes.latest(&descriptor.name);
    let status = resolve_status(&tail, probe.as_ref(), now, ctx.policy.grace);

    Ok(ServiceStatusResponse {
        service: descriptor.name.clone(),
        host: descriptor.host.clone(),
        status,
        last_probe_at: probe.as_ref().map(|probe| probe.timestamp),
        probe_latency_ms: probe.as_ref().map(|probe| duration_millis(probe.latency)),
    })
}

pub async fn start_service(
    ctx: &ApiContext,
    service: &str,
) -> Result<ServiceActionResponse, ApiError> {
    change_intent(ctx, service, EventKind::Start).await
}

pub async fn stop_service(
    ctx: &ApiContext,
    service: &str,
) -> Result<ServiceActionResponse, ApiError> {
    change_intent(ctx, service, EventKind::Stop).await
}

/// Records the intent, then runs the service's start/stop command if it has
/// one. The recorded intent stands even when the command fails; the status
/// resolver reports the consequences once the grace period runs out.
async fn change_intent(
    ctx: &ApiContext,
    service: &str,
    kind: EventKind,
) -> Result<ServiceActionResponse, ApiError> {
    let descriptor = find_service(ctx, service)?;
    let command = match kind {
        EventKind::Start => descriptor.start_command.as_deref(),
        EventKind::Stop => descriptor.stop_command.as_deref(),
    };
    // Credentials are resolved first so a configuration error records nothing.
    let target = match command {
        Some(command) => Some((command, device_for_service(ctx, descriptor)?)),
        None => None,
    };

    let event = ctx
        .storage
        .record_service_event(&descriptor.name, &descriptor.host, kind)
        .await
        .map_err(internal)?;
    info!(
        service = %descriptor.name,
        host = %descriptor.host,
        event = kind.as_str(),
        "lifecycle: intent recorded"
    );

    let command = match target {
        Some((command, device)) => {
            let outcome = ctx
                .executor
                .run_command(
                    &device.hostname,
                    &device.credentials,
                    command,
                    ctx.policy.command_timeout,
                )
                .await;
            Some(match outcome {
                Ok(_) => CommandReport {
                    succeeded: true,
                    message: None,
                },
                Err(err) => {
                    warn!(
                        service = %descriptor.name,
                        device = %device.name,
                        event = kind.as_str(),
                        "lifecycle: command failed: {err}"
                    );
                    CommandReport {
                        succeeded: false,
                        message: Some(err.to_string()),
                    }
                }
            })
        }
        None => None,
    };

    Ok(ServiceActionResponse {
        service: event.service,
        host: event.host,
        event: event.kind,
        recorded_at: event.timestamp,
        command,
    })
}

pub async fn is_job_active(
    ctx: &ApiContext,
    name: &str,
    detail: &str,
) -> Result<JobActiveResponse, ApiError> {
    let is_active = ctx
        .ledger
        .is_active(ctx.ledger.session(), name, detail)
        .await
        .map_err(internal)?;
    Ok(JobActiveResponse {
        name: name.to_string(),
        detail: detail.to_string(),
        is_active,
    })
}

pub async fn list_active_jobs(ctx: &ApiContext) -> Result<Vec<JobSummary>, ApiError> {
    let jobs = ctx.ledger.active_jobs().await.map_err(internal)?;
    Ok(jobs.into_iter().map(JobSummary::from).collect())
}

/// Whether the coordinator can open a shell on `device`. Connection failures
/// and timeouts answer `false`; missing credentials are an error.
pub async fn check_device_reachable(
    ctx: &ApiContext,
    device: &str,
) -> Result<DeviceReachabilityResponse, ApiError> {
    let entry = ctx
        .devices
        .get(device)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, format!("unknown device '{device}'")))?;

    let outcome = ctx
        .executor
        .run_command(
            &entry.hostname,
            &entry.credentials,
            REACHABILITY_COMMAND,
            ctx.policy.reachability_timeout,
        )
        .await;
    let is_able_to_connect = match outcome {
        Ok(_) => true,
        Err(err) if err.is_configuration() => {
            return Err(ApiError::new(ErrorCode::Configuration, err.to_string()));
        }
        Err(err) => {
            debug!(device = %entry.name, "remote: reachability check failed: {err}");
            false
        }
    };

    Ok(DeviceReachabilityResponse {
        device: entry.name.clone(),
        is_able_to_connect,
    })
}

fn find_service<'a>(ctx: &'a ApiContext, service: &str) -> Result<&'a ServiceDescriptor, ApiError> {
    ctx.services
        .get(service)
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, format!("unknown service '{service}'")))
}

fn device_for_service<'a>(
    ctx: &'a ApiContext,
    descriptor: &ServiceDescriptor,
) -> Result<&'a Device, ApiError> {
    ctx.devices.for_service(descriptor).ok_or_else(|| {
        ApiError::new(
            ErrorCode::Configuration,
            format!(
                "no device credentials configured for service '{}'",
                descriptor.name
            ),
        )
    })
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
