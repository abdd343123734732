/// Execution persistence
///
/// Status changes are compare-and-set on the stored status: a transition only
/// applies when the row still holds the status the caller observed, so two
/// workers racing on one execution cannot overwrite each other.

use crate::database::{from_millis, to_millis, Database};
use crate::execution::types::{ExecutionLog, ExecutionStatus, StateError, StateResult, WorkflowExecution};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert(&self, execution: &WorkflowExecution) -> StateResult<()>;

    async fn get(&self, id: &str) -> StateResult<Option<WorkflowExecution>>;

    /// Move `id` from `from` to `to`; returns false when the stored status is not `from`
    async fn transition(
        &self,
        id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> StateResult<bool>;

    /// Overwrite the result column of a RUNNING execution
    async fn save_progress(&self, id: &str, progress: Value) -> StateResult<bool>;

    async fn append_log(&self, log: &ExecutionLog) -> StateResult<()>;

    /// Logs of one execution in insertion order
    async fn list_logs(&self, execution_id: &str) -> StateResult<Vec<ExecutionLog>>;
}

fn apply_transition(execution: &mut WorkflowExecution, to: ExecutionStatus, result: Option<Value>, now: DateTime<Utc>) {
    execution.status = to;
    if to == ExecutionStatus::Running {
        execution.started_at = Some(now);
    }
    if to.is_terminal() {
        execution.completed_at = Some(now);
    }
    if result.is_some() {
        execution.result = result;
    }
}

/// In-memory execution store; `set_available(false)` simulates an outage
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    executions: Mutex<HashMap<String, WorkflowExecution>>,
    logs: Mutex<Vec<ExecutionLog>>,
    offline: AtomicBool,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    fn check_online(&self) -> StateResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StateError::Storage("memory store is offline".to_string()));
        }
        Ok(())
    }

    pub async fn execution_count(&self) -> usize {
        self.executions.lock().await.len()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, execution: &WorkflowExecution) -> StateResult<()> {
        self.check_online()?;
        self.executions
            .lock()
            .await
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StateResult<Option<WorkflowExecution>> {
        self.check_online()?;
        Ok(self.executions.lock().await.get(id).cloned())
    }

    async fn transition(
        &self,
        id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        self.check_online()?;
        let mut executions = self.executions.lock().await;
        match executions.get_mut(id) {
            Some(execution) if execution.status == from => {
                apply_transition(execution, to, result, now);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StateError::NotFound(id.to_string())),
        }
    }

    async fn save_progress(&self, id: &str, progress: Value) -> StateResult<bool> {
        self.check_online()?;
        let mut executions = self.executions.lock().await;
        match executions.get_mut(id) {
            Some(execution) if execution.status == ExecutionStatus::Running => {
                execution.result = Some(progress);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StateError::NotFound(id.to_string())),
        }
    }

    async fn append_log(&self, log: &ExecutionLog) -> StateResult<()> {
        self.check_online()?;
        self.logs.lock().await.push(log.clone());
        Ok(())
    }

    async fn list_logs(&self, execution_id: &str) -> StateResult<Vec<ExecutionLog>> {
        self.check_online()?;
        Ok(self
            .logs
            .lock()
            .await
            .iter()
            .filter(|log| log.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

/// SQLite execution store on the shared pool
#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool().clone(),
        }
    }
}

fn row_to_execution(row: &SqliteRow) -> StateResult<WorkflowExecution> {
    let status: String = row.try_get("status")?;
    let result: Option<String> = row.try_get("result")?;
    let metadata: String = row.try_get("metadata")?;

    Ok(WorkflowExecution {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        user_id: row.try_get("user_id")?,
        status: status.parse()?,
        created_at: from_millis(row.try_get("created_at")?),
        started_at: row.try_get::<Option<i64>, _>("started_at")?.map(from_millis),
        completed_at: row.try_get::<Option<i64>, _>("completed_at")?.map(from_millis),
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn row_to_log(row: &SqliteRow) -> StateResult<ExecutionLog> {
    let level: String = row.try_get("level")?;
    let data: Option<String> = row.try_get("data")?;

    Ok(ExecutionLog {
        id: row.try_get("id")?,
        execution_id: row.try_get("execution_id")?,
        level: level.parse()?,
        message: row.try_get("message")?,
        data: data.map(|d| serde_json::from_str(&d)).transpose()?,
        timestamp: from_millis(row.try_get("timestamp")?),
    })
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn insert(&self, execution: &WorkflowExecution) -> StateResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (id, workflow_id, user_id, status, created_at, started_at, completed_at, result, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.workflow_id)
        .bind(&execution.user_id)
        .bind(execution.status.as_str())
        .bind(to_millis(execution.created_at))
        .bind(execution.started_at.map(to_millis))
        .bind(execution.completed_at.map(to_millis))
        .bind(execution.result.as_ref().map(|r| r.to_string()))
        .bind(execution.metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> StateResult<Option<WorkflowExecution>> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn transition(
        &self,
        id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        let now_ms = to_millis(now);
        let started_at = (to == ExecutionStatus::Running).then_some(now_ms);
        let completed_at = to.is_terminal().then_some(now_ms);

        let updated = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = ?,
                started_at = COALESCE(?, started_at),
                completed_at = COALESCE(?, completed_at),
                result = COALESCE(?, result)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(started_at)
        .bind(completed_at)
        .bind(result.map(|r| r.to_string()))
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(StateError::NotFound(id.to_string())),
        }
    }

    async fn save_progress(&self, id: &str, progress: Value) -> StateResult<bool> {
        let updated = sqlx::query("UPDATE workflow_executions SET result = ? WHERE id = ? AND status = 'RUNNING'")
            .bind(progress.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(StateError::NotFound(id.to_string())),
        }
    }

    async fn append_log(&self, log: &ExecutionLog) -> StateResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs (id, execution_id, level, message, data, timestamp, seq)
            VALUES (?, ?, ?, ?, ?, ?,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM execution_logs WHERE execution_id = ?))
            "#,
        )
        .bind(&log.id)
        .bind(&log.execution_id)
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(log.data.as_ref().map(|d| d.to_string()))
        .bind(to_millis(log.timestamp))
        .bind(&log.execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_logs(&self, execution_id: &str) -> StateResult<Vec<ExecutionLog>> {
        let rows = sqlx::query("SELECT * FROM execution_logs WHERE execution_id = ? ORDER BY seq")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_log).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::types::LogLevel;
    use serde_json::json;

    fn execution(id: &str) -> WorkflowExecution {
        WorkflowExecution {
            id: id.to_string(),
            workflow_id: "wf-1".to_string(),
            user_id: "user-1".to_string(),
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            metadata: json!({ "limit": 10 }),
        }
    }

    fn log(execution_id: &str, message: &str) -> ExecutionLog {
        ExecutionLog {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            level: LogLevel::Info,
            message: message.to_string(),
            data: Some(json!({ "step": message })),
            timestamp: Utc::now(),
        }
    }

    async fn exercise_store(store: &dyn ExecutionStore) {
        store.insert(&execution("e-1")).await.unwrap();
        let now = Utc::now();

        assert!(!store
            .transition("e-1", ExecutionStatus::Running, ExecutionStatus::Completed, None, now)
            .await
            .unwrap());
        assert!(store
            .transition("e-1", ExecutionStatus::Pending, ExecutionStatus::Running, None, now)
            .await
            .unwrap());
        assert!(store.save_progress("e-1", json!({ "completed": ["s1"] })).await.unwrap());
        assert!(store
            .transition(
                "e-1",
                ExecutionStatus::Running,
                ExecutionStatus::Completed,
                Some(json!({ "success": true })),
                now
            )
            .await
            .unwrap());
        assert!(!store.save_progress("e-1", json!({})).await.unwrap());

        let stored = store.get("e-1").await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.result, Some(json!({ "success": true })));
        assert_eq!(stored.metadata, json!({ "limit": 10 }));

        assert!(matches!(
            store
                .transition("missing", ExecutionStatus::Pending, ExecutionStatus::Running, None, now)
                .await,
            Err(StateError::NotFound(_))
        ));

        for message in ["first", "second", "third"] {
            store.append_log(&log("e-1", message)).await.unwrap();
        }
        store.append_log(&log("e-2", "other")).await.unwrap();

        let logs = store.list_logs("e-1").await.unwrap();
        let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert_eq!(logs[0].data, Some(json!({ "step": "first" })));
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise_store(&MemoryExecutionStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let db = Database::in_memory().await.unwrap();
        exercise_store(&SqliteExecutionStore::new(&db)).await;
    }
}
