//! HTTP control plane: health, metrics and job lifecycle endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use converter_core::error::{Error, JobError, SchedulerError};
use converter_core::health::{ComponentStatus, HealthStatus};
use converter_core::{ExecutionSummary, JobConfigFragment, JobScheduler};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use ulid::Ulid;

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub scheduler: Arc<JobScheduler>,
}

/// Health response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub components: HashMap<String, ComponentStatus>,
}

/// Body of `POST /jobs`.
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub job_config: JobConfigFragment,
    #[serde(default)]
    pub converter_config: Option<BTreeMap<String, Value>>,
}

/// Result of a broadcast command.
#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub operation: &'static str,
    pub jobs: usize,
}

/// Error returned by job endpoints.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            warn!(error = %self.0, "Request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// HTTP status for a core error.
fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Scheduler(SchedulerError::JobNotFound(_)) => StatusCode::NOT_FOUND,
        Error::Scheduler(SchedulerError::CapacityExceeded { .. }) => StatusCode::TOO_MANY_REQUESTS,
        Error::Scheduler(SchedulerError::JobExists(_)) => StatusCode::CONFLICT,
        Error::Job(JobError::IllegalStateTransition { .. }) => StatusCode::CONFLICT,
        e if e.is_config_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Unparseable ids are reported like unknown ones.
fn parse_job_id(id: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(id)
        .map_err(|_| Error::from(SchedulerError::JobNotFound(id.to_string())).into())
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the router.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/jobs", post(schedule_handler))
        .route("/jobs/execution-summary", get(summaries_handler))
        .route("/jobs/pause", post(pause_all_handler))
        .route("/jobs/resume", post(resume_all_handler))
        .route("/jobs/stop", post(stop_all_handler))
        .route("/jobs/:id/execution-summary", get(summary_handler))
        .route("/jobs/:id/config", get(config_handler))
        .route("/jobs/:id/start", post(start_handler))
        .route("/jobs/:id/pause", post(pause_handler))
        .route("/jobs/:id/resume", post(resume_handler))
        .route("/jobs/:id/resume-from-last", post(resume_from_last_handler))
        .route("/jobs/:id/stop", post(stop_handler))
        .route("/jobs/:id/dataset-meta", post(dataset_meta_handler))
        .with_state(state)
}

/// Serve the control plane until shutdown is signalled.
pub async fn start_server(
    state: Arc<ServerState>,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port, "Failed to bind HTTP server");
            return;
        }
    };

    info!(port, "HTTP server started");

    let shutdown = async move {
        let _ = shutdown_rx.recv().await;
        info!("HTTP server shutting down");
    };
    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "HTTP server error");
    }
}

/// Health endpoint handler.
async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let health = state.scheduler.health();
    let overall = health.overall_status();
    let status_code = match overall {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    let response = HealthResponse {
        status: overall,
        components: health.get_all_statuses(),
    };
    (status_code, Json(response))
}

/// Liveness probe handler.
async fn healthz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.scheduler.health().overall_status() != HealthStatus::Unhealthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Readiness probe handler.
async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.scheduler.health().is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> Result<Response, ApiError> {
    let output = state.scheduler.context().metrics.export_prometheus_text()?;
    Ok((
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
        .into_response())
}

async fn schedule_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<ExecutionSummary>), ApiError> {
    let job = state
        .scheduler
        .schedule(request.job_config, request.converter_config)
        .await?;
    Ok((StatusCode::CREATED, Json(job.summary())))
}

async fn summaries_handler(State(state): State<Arc<ServerState>>) -> Json<Vec<ExecutionSummary>> {
    Json(state.scheduler.summaries())
}

async fn pause_all_handler(State(state): State<Arc<ServerState>>) -> Json<BroadcastResponse> {
    Json(BroadcastResponse {
        operation: "pause",
        jobs: state.scheduler.pause_all(),
    })
}

async fn resume_all_handler(State(state): State<Arc<ServerState>>) -> Json<BroadcastResponse> {
    Json(BroadcastResponse {
        operation: "resume",
        jobs: state.scheduler.resume_all(),
    })
}

async fn stop_all_handler(State(state): State<Arc<ServerState>>) -> Json<BroadcastResponse> {
    Json(BroadcastResponse {
        operation: "stop",
        jobs: state.scheduler.stop_all(),
    })
}

async fn summary_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<ExecutionSummary> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.scheduler.summary(&id)?))
}

async fn config_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<converter_core::EffectiveJobConfig> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.scheduler.config(&id)?))
}

async fn start_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<ExecutionSummary> {
    let id = parse_job_id(&id)?;
    state.scheduler.start(&id)?;
    Ok(Json(state.scheduler.summary(&id)?))
}

async fn pause_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<ExecutionSummary> {
    let id = parse_job_id(&id)?;
    state.scheduler.pause(&id)?;
    Ok(Json(state.scheduler.summary(&id)?))
}

async fn resume_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<ExecutionSummary> {
    let id = parse_job_id(&id)?;
    state.scheduler.resume(&id)?;
    Ok(Json(state.scheduler.summary(&id)?))
}

async fn resume_from_last_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<ExecutionSummary> {
    let id = parse_job_id(&id)?;
    state.scheduler.resume_from_last(&id).await?;
    Ok(Json(state.scheduler.summary(&id)?))
}

async fn stop_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<ExecutionSummary> {
    let id = parse_job_id(&id)?;
    state.scheduler.stop(&id)?;
    Ok(Json(state.scheduler.summary(&id)?))
}

async fn dataset_meta_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_job_id(&id)?;
    state.scheduler.publish_dataset_meta(&id).await?;
    Ok(StatusCode::ACCEPTED)
}
