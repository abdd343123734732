/// Error types for workflow execution
///
/// `ExecutionError` covers everything that stops an execution from being
/// started or recorded. `StepError` is the outcome of a single failed step,
/// classified so the queue only retries what can succeed on a second try.

use crate::execution::types::StateError;
use crate::queue::error::QueueError;
use crate::workflow::catalog::ConnectionError;
use crate::workflow::types::WorkflowStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(String),

    #[error("workflow {id} is not active (status {status})")]
    WorkflowNotActive { id: String, status: WorkflowStatus },

    #[error("workflow {0} has no steps")]
    NoActiveSteps(String),

    /// Two active steps share an order value; execution sequence would be ambiguous
    #[error("workflow {workflow_id} has more than one active step with stepOrder {step_order}")]
    DuplicateStepOrder { workflow_id: String, step_order: i32 },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl ExecutionError {
    /// Rejected before anything ran; retrying cannot help
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ExecutionError::WorkflowNotFound(_)
                | ExecutionError::WorkflowNotActive { .. }
                | ExecutionError::NoActiveSteps(_)
                | ExecutionError::DuplicateStepOrder { .. }
                | ExecutionError::InvalidParameters(_)
        )
    }
}

/// Failure of one step
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Network trouble, 5xx, 408, 429: eligible for job-level retry
    #[error("{0}")]
    Transient(String),

    /// Bad configuration, 4xx, missing credentials: retrying cannot help
    #[error("{0}")]
    Terminal(String),
}

impl StepError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }
}

impl From<ConnectionError> for StepError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Source(_) => StepError::Transient(err.to_string()),
            ConnectionError::NotOwned { ref id, .. } => StepError::Terminal(format!("API connection {} not found", id)),
            other => StepError::Terminal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_classification() {
        assert!(ExecutionError::NoActiveSteps("wf".to_string()).is_precondition());
        assert!(ExecutionError::DuplicateStepOrder { workflow_id: "wf".to_string(), step_order: 2 }.is_precondition());
        assert!(!ExecutionError::Queue(QueueError::NotInitialized).is_precondition());
    }

    #[test]
    fn test_connection_errors_map_to_step_errors() {
        let err: StepError = ConnectionError::Source(anyhow::anyhow!("db locked")).into();
        assert!(err.is_transient());

        let err: StepError = ConnectionError::NotOwned { id: "c1".to_string(), user_id: "u2".to_string() }.into();
        assert_eq!(err, StepError::Terminal("API connection c1 not found".to_string()));

        let err: StepError = ConnectionError::MissingSecret("crm".to_string()).into();
        assert!(!err.is_transient());
    }
}
