/// Execution trigger and query endpoints
///
/// POST /api/workflows/{id}/execute forwards to the execution entry point:
/// inline mode answers 200 with the run summary, queued mode answers 202
/// with a pollable execution id.

use crate::api::{ApiError, AppState, CallerId};
use crate::execution::types::{ExecutionLog, WorkflowExecution};
use crate::queue::types::JobOptions;
use crate::runtime::ExecutionResponse;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Request body for execution
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExecuteRequest {
    pub parameters: Value,
    /// Queue options, e.g. `jobKey` for dedup
    pub options: JobOptions,
}

pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}/execute", post(execute_workflow))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/logs", get(list_logs))
}

/// POST /api/workflows/{id}/execute
/// Body: { "parameters": {...}, "options": { "jobKey": "..." } } (both optional)
async fn execute_workflow(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(workflow_id): Path<String>,
    body: Option<Json<ExecuteRequest>>,
) -> Result<(StatusCode, Json<ExecutionResponse>), ApiError> {
    let Json(request) = body.unwrap_or_default();
    tracing::info!("📥 Execute request for workflow {} from {}", workflow_id, user_id);

    let response = state
        .executions
        .execute(&workflow_id, &user_id, request.parameters, request.options)
        .await?;

    let status = match response {
        ExecutionResponse::Completed(_) => StatusCode::OK,
        ExecutionResponse::Queued { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(response)))
}

async fn owned_execution(state: &AppState, user_id: &str, id: &str) -> Result<WorkflowExecution, ApiError> {
    match state.executions.state().get_execution(id).await? {
        Some(execution) if execution.user_id == user_id => Ok(execution),
        _ => Err(ApiError::not_found(format!("execution {}", id))),
    }
}

/// GET /api/executions/{id}
async fn get_execution(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(id): Path<String>,
) -> Result<Json<WorkflowExecution>, ApiError> {
    owned_execution(&state, &user_id, &id).await.map(Json)
}

/// GET /api/executions/{id}/logs
/// Returns: { "logs": [...] } oldest first
async fn list_logs(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    owned_execution(&state, &user_id, &id).await?;
    let logs: Vec<ExecutionLog> = state.executions.state().list_logs(&id).await?;
    Ok(Json(json!({ "logs": logs })))
}
