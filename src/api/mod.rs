/// HTTP API Layer
///
/// Thin REST boundary over the engine. It handles:
/// - Workflow and API connection registration
/// - Execution triggering and execution/log queries
/// - Queue health, job status, cancellation and failed-job cleanup
///
/// Authentication happens upstream; the caller's identity arrives in the
/// `x-user-id` header and scopes every workflow, connection and execution
/// lookup.

use crate::execution::types::StateError;
use crate::queue::error::QueueError;
use crate::queue::service::QueueService;
use crate::runtime::{ExecutionError, ExecutionService};
use crate::workflow::registry::WorkflowRegistry;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;

// Workflow and connection management endpoints
pub mod workflows;

// Execution trigger and query endpoints
pub mod executions;

// Queue operations endpoints
pub mod queue;

// Re-export router builders
pub use executions::create_execution_routes;
pub use queue::create_queue_routes;
pub use workflows::create_workflow_routes;

/// Header carrying the authenticated caller
pub const USER_ID_HEADER: &str = "x-user-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Hot-reload registry backed by workflow storage
    pub registry: Arc<WorkflowRegistry>,
    /// Execution entry point
    pub executions: Arc<ExecutionService>,
    pub queue: Arc<QueueService>,
}

/// Caller identity taken from `x-user-id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for CallerId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| CallerId(value.to_string()))
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing x-user-id header"))
    }
}

/// Error response rendered as `{ "error": message }`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{} not found", what))
    }

    /// Log the cause, hide it from the caller
    pub fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!("❌ Request failed: {}", err);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Validation(_) => ApiError::new(StatusCode::BAD_REQUEST, err.to_string()),
            QueueError::DuplicateSubmission { .. } => ApiError::new(StatusCode::CONFLICT, err.to_string()),
            QueueError::NotInitialized => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
            QueueError::Backend(_) => ApiError::internal(err),
        }
    }
}

impl From<StateError> for ApiError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(id) => ApiError::not_found(format!("execution {}", id)),
            other => ApiError::internal(other),
        }
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::WorkflowNotFound(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            ExecutionError::InvalidParameters(_) => ApiError::new(StatusCode::BAD_REQUEST, err.to_string()),
            ExecutionError::WorkflowNotActive { .. }
            | ExecutionError::NoActiveSteps(_)
            | ExecutionError::DuplicateStepOrder { .. } => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            ExecutionError::Queue(e) => e.into(),
            ExecutionError::State(e) => e.into(),
            ExecutionError::Storage(e) => ApiError::internal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let err: ApiError = ExecutionError::WorkflowNotFound("wf".to_string()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err: ApiError = ExecutionError::NoActiveSteps("wf".to_string()).into();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);

        let err: ApiError = ExecutionError::Queue(QueueError::DuplicateSubmission {
            queue: "q".to_string(),
            key: "k".to_string(),
        })
        .into();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err: ApiError = ExecutionError::Queue(QueueError::NotInitialized).into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);

        let err: ApiError = ExecutionError::State(StateError::Storage("disk".to_string())).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal error");
    }
}
