/// Workflow and API connection management endpoints
///
/// Definitions are written through the registry, which persists them and
/// hot-swaps its in-memory snapshot. Every lookup is scoped to the caller:
/// another user's workflow or connection is reported as not found.

use crate::api::{ApiError, AppState, CallerId};
use crate::workflow::catalog::ConnectionSource;
use crate::workflow::types::{ApiConnection, Workflow};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, put},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};

/// Response for workflow and connection writes
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
}

/// Create workflow management routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", get(list_workflows))
        .route(
            "/api/workflows/{id}",
            put(put_workflow).get(get_workflow).delete(delete_workflow),
        )
        .route("/api/connections/{id}", put(put_connection))
}

/// Create or replace a workflow
///
/// PUT /api/workflows/{id}
/// Body: { "name": "...", "status": "ACTIVE", "steps": [...] }
async fn put_workflow(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(id): Path<String>,
    Json(mut workflow): Json<Workflow>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    if let Some(existing) = state.registry.get(&id) {
        if existing.owner_id != user_id {
            return Err(ApiError::not_found(format!("workflow {}", id)));
        }
    }

    // Path and caller are authoritative
    workflow.id = id.clone();
    workflow.owner_id = user_id;
    for step in &mut workflow.steps {
        step.workflow_id = id.clone();
    }

    state
        .registry
        .upsert_workflow(workflow)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    tracing::info!("🔥 Saved workflow: {}", id);
    Ok(Json(WorkflowResponse {
        message: format!("Workflow '{}' saved", id),
        id,
    }))
}

/// GET /api/workflows
/// Returns: { "workflows": [{ "id", "ownerId", "name", "status", "createdAt", "updatedAt" }] }
async fn list_workflows(State(state): State<AppState>, CallerId(user_id): CallerId) -> Result<Json<Value>, ApiError> {
    let workflows = state.registry.list_workflows(&user_id).await.map_err(ApiError::internal)?;
    Ok(Json(json!({ "workflows": workflows })))
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    match state.registry.get(&id) {
        Some(workflow) if workflow.owner_id == user_id => Ok(Json((*workflow).clone())),
        _ => Err(ApiError::not_found(format!("workflow {}", id))),
    }
}

/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.registry.get(&id) {
        Some(workflow) if workflow.owner_id == user_id => {}
        _ => return Err(ApiError::not_found(format!("workflow {}", id))),
    }

    if !state.registry.remove_workflow(&id).await.map_err(ApiError::internal)? {
        return Err(ApiError::not_found(format!("workflow {}", id)));
    }
    tracing::info!("🗑️ Deleted workflow: {}", id);
    Ok(Json(json!({ "message": "Workflow deleted successfully" })))
}

/// Register or update an API connection
///
/// PUT /api/connections/{id}
/// Body: { "name", "baseUrl", "authType", "authConfig", "secretRef" }
async fn put_connection(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(id): Path<String>,
    Json(mut connection): Json<ApiConnection>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let existing = state.registry.get_connection(&id).await.map_err(ApiError::internal)?;
    if existing.is_some_and(|c| c.user_id != user_id) {
        return Err(ApiError::not_found(format!("API connection {}", id)));
    }

    connection.id = id.clone();
    connection.user_id = user_id;
    state
        .registry
        .upsert_connection(connection)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    Ok(Json(WorkflowResponse {
        message: format!("Connection '{}' saved", id),
        id,
    }))
}
