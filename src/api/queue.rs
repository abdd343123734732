/// Queue operations endpoints
///
/// Health, job status and cancellation. Job views never include the
/// payload, and a job is only visible to the user it was submitted for.

use crate::api::{ApiError, AppState, CallerId};
use crate::queue::service::{HealthLevel, HealthStatus};
use crate::queue::types::{JobPayload, JobState, QueueJob};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

/// Job status without its payload
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub queue_name: String,
    pub job_name: String,
    pub state: JobState,
    pub execution_id: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub state_history: Vec<JobState>,
}

impl From<QueueJob> for JobView {
    fn from(job: QueueJob) -> Self {
        let JobPayload::WorkflowExecution(payload) = job.payload;
        Self {
            id: job.id,
            queue_name: job.queue_name,
            job_name: job.job_name,
            state: job.state,
            execution_id: payload.execution_id,
            retry_count: job.retry_count,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            last_error: job.last_error,
            state_history: job.state_history,
        }
    }
}

pub fn create_queue_routes() -> Router<AppState> {
    Router::new()
        .route("/api/queue/health", get(queue_health))
        .route("/api/queue/failed", delete(clear_failed_jobs))
        .route("/api/queue/{queue}/jobs/{id}", get(get_job).delete(cancel_job))
}

/// GET /api/queue/health
/// Answers 503 while the subsystem reports `error`
async fn queue_health(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let health = state.queue.get_health_status().await;
    let status = match health.status {
        HealthLevel::Error => StatusCode::SERVICE_UNAVAILABLE,
        HealthLevel::Healthy | HealthLevel::Warning => StatusCode::OK,
    };
    (status, Json(health))
}

async fn owned_job(state: &AppState, user_id: &str, queue: &str, id: &str) -> Result<QueueJob, ApiError> {
    let job = state.queue.get_job_status(queue, id).await?;
    match job {
        Some(job) if job_owner(&job) == user_id => Ok(job),
        _ => Err(ApiError::not_found(format!("job {}", id))),
    }
}

fn job_owner(job: &QueueJob) -> &str {
    match &job.payload {
        JobPayload::WorkflowExecution(payload) => &payload.user_id,
    }
}

/// GET /api/queue/{queue}/jobs/{id}
async fn get_job(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path((queue, id)): Path<(String, String)>,
) -> Result<Json<JobView>, ApiError> {
    let job = owned_job(&state, &user_id, &queue, &id).await?;
    Ok(Json(job.into()))
}

/// DELETE /api/queue/{queue}/jobs/{id}
/// Returns: { "state": "cancelled" } (or the terminal state the job already had)
async fn cancel_job(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path((queue, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    owned_job(&state, &user_id, &queue, &id).await?;
    match state.queue.cancel_job(&queue, &id).await? {
        Some(job_state) => Ok(Json(json!({ "id": id, "state": job_state }))),
        None => Err(ApiError::not_found(format!("job {}", id))),
    }
}

/// DELETE /api/queue/failed
async fn clear_failed_jobs(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let deleted = state.queue.clear_failed_jobs().await?;
    Ok(Json(json!({ "deleted": deleted })))
}
