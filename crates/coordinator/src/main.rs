use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use coordinator_api::{
    check_device_reachable, import_dataset, is_job_active, list_active_jobs, list_statuses,
    probe_board, query_status, start_service, start_training, stop_service, stop_training,
    training_state, ApiContext, DeviceRegistry, HealthProber, ServiceRegistry,
};
use futures::StreamExt;
use remote_exec::SshExecutor;
use shared::{
    domain::SessionId,
    error::{ApiError, ErrorCode},
    protocol::{
        DatasetImportRequest, DeviceReachabilityResponse, JobActiveResponse, JobQuery, JobSummary,
        ServiceActionResponse, ServiceStatusResponse, TrainingStateResponse,
    },
};
use storage::{JobLedger, Storage};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod frames;
mod scheduler;

use config::{load_settings, Settings};
use frames::{frame_stream, FrameSlot, FRAME_CONTENT_TYPE};
use scheduler::run_probe_scheduler;

const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    frames: FrameSlot,
    frame_interval: Duration,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(settings.max_blocking_threads.max(1))
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(settings))
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let database_url = settings.sqlite_url();
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    // Nothing may touch the ledger before stale rows are gone.
    let session = SessionId::generate();
    let ledger = JobLedger::open(storage.clone(), session.clone())
        .await
        .context("failed to purge jobs left by earlier sessions")?;
    info!(%session, purged = ledger.purged_on_open(), "jobs: ledger opened");

    let services = Arc::new(ServiceRegistry::new(settings.services.clone())?);
    let devices = Arc::new(DeviceRegistry::new(settings.devices()));
    let prober = HealthProber::new(settings.probe_timeouts())?;
    let (publisher, probes) = probe_board();
    tokio::spawn(run_probe_scheduler(
        prober,
        services.clone(),
        publisher,
        settings.probe_interval(),
    ));

    let api = ApiContext {
        storage,
        ledger,
        services,
        devices,
        probes,
        executor: Arc::new(SshExecutor::default()),
        policy: settings.policy(),
    };
    let state = AppState {
        api,
        frames: FrameSlot::new(),
        frame_interval: settings.frame_interval(),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.bind_addr))?;
    info!(%addr, "coordinator listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("coordinator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/services", get(http_list_services))
        .route("/services/:service/status", get(http_service_status))
        .route("/services/:service/start", post(http_start_service))
        .route("/services/:service/stop", post(http_stop_service))
        .route("/jobs", get(http_job_active))
        .route("/jobs/active", get(http_active_jobs))
        .route("/datasets/import", post(http_import_dataset))
        .route("/training", get(http_training_state))
        .route("/training/start", post(http_start_training))
        .route("/training/stop", post(http_stop_training))
        .route("/devices/:device/reachable", get(http_device_reachable))
        .route("/video", get(stream_video))
        .route(
            "/frames",
            post(publish_frame).layer(DefaultBodyLimit::max(MAX_FRAME_BYTES)),
        )
        .with_state(state)
}

fn http_error(err: ApiError) -> HttpError {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Configuration => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        http_error(ApiError::new(ErrorCode::Unavailable, e.to_string()))
    })?;
    Ok("ok")
}

async fn http_list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ServiceStatusResponse>>, HttpError> {
    let statuses = list_statuses(&state.api).await.map_err(http_error)?;
    Ok(Json(statuses))
}

async fn http_service_status(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
) -> Result<Json<ServiceStatusResponse>, HttpError> {
    let status = query_status(&state.api, &service)
        .await
        .map_err(http_error)?;
    Ok(Json(status))
}

async fn http_start_service(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
) -> Result<Json<ServiceActionResponse>, HttpError> {
    let action = start_service(&state.api, &service)
        .await
        .map_err(http_error)?;
    Ok(Json(action))
}

async fn http_stop_service(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
) -> Result<Json<ServiceActionResponse>, HttpError> {
    let action = stop_service(&state.api, &service)
        .await
        .map_err(http_error)?;
    Ok(Json(action))
}

async fn http_job_active(
    State(state): State<Arc<AppState>>,
    Query(q): Query<JobQuery>,
) -> Result<Json<JobActiveResponse>, HttpError> {
    let active = is_job_active(&state.api, &q.name, &q.detail)
        .await
        .map_err(http_error)?;
    Ok(Json(active))
}

async fn http_active_jobs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<JobSummary>>, HttpError> {
    let jobs = list_active_jobs(&state.api).await.map_err(http_error)?;
    Ok(Json(jobs))
}

async fn http_import_dataset(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DatasetImportRequest>,
) -> Result<(StatusCode, Json<JobSummary>), HttpError> {
    // The transfer keeps running after the response; its outcome lands in the ledger.
    let import = import_dataset(&state.api, &req.dataset)
        .await
        .map_err(http_error)?;
    Ok((StatusCode::ACCEPTED, Json(import.job)))
}

async fn http_training_state(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TrainingStateResponse>, HttpError> {
    let training = training_state(&state.api).await.map_err(http_error)?;
    Ok(Json(training))
}

async fn http_start_training(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TrainingStateResponse>, HttpError> {
    let training = start_training(&state.api).await.map_err(http_error)?;
    Ok(Json(training))
}

async fn http_stop_training(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TrainingStateResponse>, HttpError> {
    let training = stop_training(&state.api).await.map_err(http_error)?;
    Ok(Json(training))
}

async fn http_device_reachable(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
) -> Result<Json<DeviceReachabilityResponse>, HttpError> {
    let reachable = check_device_reachable(&state.api, &device)
        .await
        .map_err(http_error)?;
    Ok(Json(reachable))
}

async fn stream_video(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let parts = frame_stream(state.frames.clone(), state.frame_interval).map(Ok::<_, Infallible>);
    (
        [
            (header::CONTENT_TYPE, FRAME_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(parts),
    )
}

async fn publish_frame(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusCode, HttpError> {
    if !state.frames.publish(body) {
        return Err(http_error(ApiError::new(
            ErrorCode::Validation,
            "frame body cannot be empty",
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
