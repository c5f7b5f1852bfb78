use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::coordinator::Coordinator;
use crate::error::RelayError;
use crate::scheduler::Job;

#[derive(Clone)]
pub struct DashboardState {
    pub coordinator: Arc<Coordinator>,
}

#[derive(Serialize)]
struct JobResponse {
    id: String,
    task: String,
    state: String,
    assigned_worker: Option<String>,
    retry_count: u32,
    error: Option<String>,
    submitted_at: String,
    scheduled_at: Option<String>,
    completed_at: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            state: job.state.to_string(),
            submitted_at: job.submitted_at.to_rfc3339(),
            scheduled_at: job.scheduled_at.map(|t| t.to_rfc3339()),
            completed_at: job.completed_at.map(|t| t.to_rfc3339()),
            id: job.id,
            task: job.task,
            assigned_worker: job.assigned_worker,
            retry_count: job.retry_count,
            error: job.error,
        }
    }
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    #[serde(default)]
    job_id: Option<String>,
    task: String,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    success: bool,
    job_id: Option<String>,
    error: Option<String>,
}

impl SubmitJobResponse {
    fn failed(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                success: false,
                job_id: None,
                error: Some(error.into()),
            }),
        )
    }
}

/// JSON status API over a running coordinator.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/workers", get(list_workers_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/:id", get(job_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(listener: TcpListener, state: DashboardState, shutdown: CancellationToken) {
    let addr = listener.local_addr().ok();
    tracing::info!(addr = ?addr, "Starting dashboard server");

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.coordinator.workers().await)
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .coordinator
        .jobs()
        .await
        .into_iter()
        .map(JobResponse::from)
        .collect();
    Json(jobs)
}

async fn job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.job(&id).await {
        Some(job) => (StatusCode::OK, Json(JobResponse::from(job))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Job not found: {}", id) })),
        )
            .into_response(),
    }
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    if payload.task.trim().is_empty() {
        return SubmitJobResponse::failed(StatusCode::BAD_REQUEST, "Task cannot be empty");
    }

    let job = match payload.job_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => Job::with_id(id, payload.task),
        _ => Job::new(payload.task),
    };

    match state.coordinator.submit(job).await {
        Ok(job_id) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                success: true,
                job_id: Some(job_id),
                error: None,
            }),
        ),
        Err(e @ RelayError::QueueFull) | Err(e @ RelayError::Stopped) => {
            SubmitJobResponse::failed(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e @ RelayError::DuplicateJob(_)) => {
            SubmitJobResponse::failed(StatusCode::CONFLICT, e.to_string())
        }
        Err(e) => SubmitJobResponse::failed(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
