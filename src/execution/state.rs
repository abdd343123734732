/// Execution state manager
///
/// The only component that mutates `WorkflowExecution` and `ExecutionLog`
/// records. Enforces `PENDING → RUNNING → {COMPLETED | FAILED | CANCELLED}`:
/// nothing skips RUNNING and nothing leaves a terminal status.

use crate::execution::store::ExecutionStore;
use crate::execution::types::{
    ExecutionLog, ExecutionStatus, LogLevel, StateError, StateResult, WorkflowExecution,
};
use crate::queue::redact::redact_value;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct ExecutionStateManager {
    store: Arc<dyn ExecutionStore>,
    log_failures: AtomicU64,
}

impl ExecutionStateManager {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            log_failures: AtomicU64::new(0),
        }
    }

    /// New PENDING execution; parameters are stored redacted as metadata
    pub async fn create_execution(
        &self,
        workflow_id: &str,
        user_id: &str,
        parameters: &Value,
    ) -> StateResult<WorkflowExecution> {
        let execution = WorkflowExecution {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            user_id: user_id.to_string(),
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            metadata: json!({ "parameters": redact_value(parameters) }),
        };
        self.store.insert(&execution).await?;

        tracing::info!("🆕 Created execution {} for workflow {}", execution.id, workflow_id);
        Ok(execution)
    }

    async fn current(&self, id: &str) -> StateResult<WorkflowExecution> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    /// PENDING → RUNNING; any other starting status is rejected
    pub async fn mark_running(&self, id: &str) -> StateResult<WorkflowExecution> {
        let moved = self
            .store
            .transition(id, ExecutionStatus::Pending, ExecutionStatus::Running, None, Utc::now())
            .await?;
        let execution = self.current(id).await?;

        if !moved {
            return Err(StateError::InvalidTransition {
                id: id.to_string(),
                from: execution.status,
                to: ExecutionStatus::Running,
            });
        }

        tracing::info!("🏃 Execution {} is running", id);
        Ok(execution)
    }

    /// RUNNING → terminal
    ///
    /// Repeating the recorded terminal status is a no-op; a different
    /// terminal status is a `TerminalConflict`.
    pub async fn mark_terminal(
        &self,
        id: &str,
        status: ExecutionStatus,
        result: Option<Value>,
    ) -> StateResult<WorkflowExecution> {
        if !status.is_terminal() {
            let current = self.current(id).await?;
            return Err(StateError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: status,
            });
        }

        let moved = self
            .store
            .transition(id, ExecutionStatus::Running, status, result, Utc::now())
            .await?;
        let execution = self.current(id).await?;

        if moved {
            tracing::info!("🏁 Execution {} finished as {}", id, status);
            return Ok(execution);
        }

        match execution.status {
            current if current == status => {
                tracing::debug!("⏭️ Execution {} already {}", id, status);
                Ok(execution)
            }
            current if current.is_terminal() => Err(StateError::TerminalConflict {
                id: id.to_string(),
                current,
                requested: status,
            }),
            current => Err(StateError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: status,
            }),
        }
    }

    /// Checkpoint step outputs of a RUNNING execution
    pub async fn save_progress(&self, id: &str, progress: Value) -> StateResult<()> {
        if self.store.save_progress(id, progress).await? {
            return Ok(());
        }
        let current = self.current(id).await?;
        Err(StateError::InvalidTransition {
            id: id.to_string(),
            from: current.status,
            to: ExecutionStatus::Running,
        })
    }

    /// Append a log entry
    ///
    /// Never fails: a storage error is reported through tracing and counted
    /// so the calling step carries on.
    pub async fn append_log(&self, execution_id: &str, level: LogLevel, message: &str, data: Option<Value>) {
        let entry = ExecutionLog {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            level,
            message: message.to_string(),
            data: data.as_ref().map(redact_value),
            timestamp: Utc::now(),
        };

        match level {
            LogLevel::Info => tracing::debug!("📝 [{}] {}", execution_id, message),
            LogLevel::Warn => tracing::warn!("📝 [{}] {}", execution_id, message),
            LogLevel::Error => tracing::error!("📝 [{}] {}", execution_id, message),
        }

        if let Err(e) = self.store.append_log(&entry).await {
            self.log_failures.fetch_add(1, Ordering::SeqCst);
            tracing::error!("❌ Failed to persist log for execution {}: {}", execution_id, e);
        }
    }

    pub async fn get_execution(&self, id: &str) -> StateResult<Option<WorkflowExecution>> {
        self.store.get(id).await
    }

    pub async fn list_logs(&self, execution_id: &str) -> StateResult<Vec<ExecutionLog>> {
        self.store.list_logs(execution_id).await
    }

    /// Log entries that could not be persisted since startup
    pub fn log_failures(&self) -> u64 {
        self.log_failures.load(Ordering::SeqCst)
    }
}
