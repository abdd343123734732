/// Execution entry point
///
/// `ExecutionService` validates a request, creates the execution record and
/// then either runs it inline or hands it to the workflow-execution queue.
/// `WorkflowExecutionHandler` is the queue-side half: it picks the execution
/// back up on a worker and drives it through the same executor.

use crate::config::ExecutionMode;
use crate::execution::state::ExecutionStateManager;
use crate::execution::types::{ExecutionStatus, LogLevel, WorkflowExecution};
use crate::queue::error::QueueError;
use crate::queue::service::QueueService;
use crate::queue::types::{
    JobContext, JobHandle, JobOptions, JobPayload, JobState, JobSubmission, QueueJob, WorkflowExecutionJob,
    WORKFLOW_EXECUTION_JOB, WORKFLOW_EXECUTION_QUEUE,
};
use crate::queue::worker::{JobHandler, WorkerOptions};
use crate::runtime::context::Checkpoint;
use crate::runtime::engine::{plan, ExecutionResult, RunOptions, WorkflowExecutor};
use crate::runtime::error::ExecutionError;
use crate::workflow::catalog::WorkflowSource;
use crate::workflow::types::Workflow;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// What the caller gets back from `execute`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionResponse {
    /// Ran inline on the caller's task (whatever the final status)
    Completed(ExecutionResult),
    /// Enqueued; poll the execution for progress
    Queued {
        #[serde(rename = "executionId")]
        execution_id: String,
        job: JobHandle,
    },
}

impl ExecutionResponse {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionResponse::Completed(result) => &result.execution_id,
            ExecutionResponse::Queued { execution_id, .. } => execution_id,
        }
    }
}

pub struct ExecutionService {
    workflows: Arc<dyn WorkflowSource>,
    executor: Arc<WorkflowExecutor>,
    queue: Option<Arc<QueueService>>,
    mode: ExecutionMode,
}

impl ExecutionService {
    pub fn new(workflows: Arc<dyn WorkflowSource>, executor: Arc<WorkflowExecutor>, mode: ExecutionMode) -> Self {
        Self {
            workflows,
            executor,
            queue: None,
            mode,
        }
    }

    pub fn with_queue(mut self, queue: Arc<QueueService>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn state(&self) -> &Arc<ExecutionStateManager> {
        self.executor.state()
    }

    /// Attach the queue-side handler to the workflow-execution queue
    pub async fn register_worker(self: &Arc<Self>, options: WorkerOptions) -> Result<(), ExecutionError> {
        let queue = self.queue.as_ref().ok_or(QueueError::NotInitialized)?;
        let handler = Arc::new(WorkflowExecutionHandler::new(Arc::clone(self)));
        queue.register_worker(WORKFLOW_EXECUTION_QUEUE, handler, options).await?;

        tracing::info!("👷 Workflow execution worker registered on {}", WORKFLOW_EXECUTION_QUEUE);
        Ok(())
    }

    /// Start an execution of `workflow_id` for `user_id`
    ///
    /// Workflow preconditions are checked before any execution record is
    /// created. `options` only applies in queued mode (`jobKey` dedup,
    /// priority, delay and retry overrides).
    pub async fn execute(
        &self,
        workflow_id: &str,
        user_id: &str,
        parameters: Value,
        options: JobOptions,
    ) -> Result<ExecutionResponse, ExecutionError> {
        let parameters = match parameters {
            Value::Null => json!({}),
            Value::Object(_) => parameters,
            _ => {
                return Err(ExecutionError::InvalidParameters(
                    "parameters must be a JSON object".to_string(),
                ))
            }
        };

        let queue = match self.mode {
            ExecutionMode::Queued => {
                let queue = self.queue.as_ref().ok_or(QueueError::NotInitialized)?;
                if !queue.is_started() {
                    return Err(QueueError::NotInitialized.into());
                }
                options.validate()?;
                Some(queue)
            }
            ExecutionMode::Inline => None,
        };

        let workflow = self.load_workflow(workflow_id, user_id).await?;
        plan(&workflow)?;

        let state = self.state();
        let execution = state.create_execution(workflow_id, user_id, &parameters).await?;

        match queue {
            None => {
                tracing::info!("🚀 Running execution {} inline", execution.id);
                let result = self
                    .executor
                    .run(&workflow, &execution, &parameters, RunOptions::inline())
                    .await?;
                Ok(ExecutionResponse::Completed(result))
            }
            Some(queue) => self.enqueue(queue, &execution, parameters, options).await,
        }
    }

    async fn enqueue(
        &self,
        queue: &QueueService,
        execution: &WorkflowExecution,
        parameters: Value,
        options: JobOptions,
    ) -> Result<ExecutionResponse, ExecutionError> {
        let payload = JobPayload::WorkflowExecution(WorkflowExecutionJob {
            execution_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            user_id: execution.user_id.clone(),
            parameters,
        });
        let submission = JobSubmission::new(WORKFLOW_EXECUTION_QUEUE, WORKFLOW_EXECUTION_JOB, payload).with_options(options);

        match queue.submit_job(submission).await {
            Ok(job) => {
                self.state()
                    .append_log(
                        &execution.id,
                        LogLevel::Info,
                        "Execution queued",
                        Some(json!({ "queueName": job.queue_name, "jobId": job.job_id })),
                    )
                    .await;
                Ok(ExecutionResponse::Queued {
                    execution_id: execution.id.clone(),
                    job,
                })
            }
            Err(e) => {
                self.abandon(&execution.id, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Close out an execution whose job never made it onto the queue
    ///
    /// Only backend and duplicate-key failures get here; bad options are
    /// rejected before the execution exists.
    async fn abandon(&self, execution_id: &str, reason: &str) {
        let state = self.state();
        state
            .append_log(
                execution_id,
                LogLevel::Error,
                &format!("Execution could not be queued: {}", reason),
                None,
            )
            .await;

        let closed = match state.mark_running(execution_id).await {
            Ok(_) => state
                .mark_terminal(execution_id, ExecutionStatus::Failed, Some(json!({ "error": reason })))
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = closed {
            tracing::error!("❌ Failed to close abandoned execution {}: {}", execution_id, e);
        }
    }

    /// Workflow owned by `user_id`; someone else's workflow is reported as not found
    async fn load_workflow(&self, workflow_id: &str, user_id: &str) -> Result<Workflow, ExecutionError> {
        let workflow = self
            .workflows
            .get_workflow(workflow_id)
            .await
            .map_err(ExecutionError::Storage)?
            .ok_or_else(|| ExecutionError::WorkflowNotFound(workflow_id.to_string()))?;

        if workflow.owner_id != user_id {
            tracing::debug!("🔒 Workflow {} is not owned by {}", workflow_id, user_id);
            return Err(ExecutionError::WorkflowNotFound(workflow_id.to_string()));
        }
        Ok(workflow)
    }

    /// Queue-side run of a previously created execution
    ///
    /// Transient step failures with attempts left come back as `Err` so the
    /// queue schedules a retry; everything else completes the job with the
    /// execution summary as output.
    pub async fn run_queued(&self, job: &WorkflowExecutionJob, ctx: JobContext) -> anyhow::Result<Option<Value>> {
        let Some(execution) = self.state().get_execution(&job.execution_id).await? else {
            tracing::error!("❌ Execution {} no longer exists, dropping job", job.execution_id);
            return Ok(Some(json!({ "error": format!("execution {} not found", job.execution_id) })));
        };

        if execution.status.is_terminal() {
            return Ok(Some(serde_json::to_value(ExecutionResult::from_record(&execution))?));
        }

        let workflow = match self.load_workflow(&job.workflow_id, &job.user_id).await {
            Ok(workflow) => workflow,
            Err(ExecutionError::Storage(e)) => return Err(e),
            Err(e) => return self.reject_dispatch(&execution, e).await,
        };

        let options = RunOptions {
            cancellation: Some(ctx.cancellation.clone()),
            final_attempt: ctx.is_final_attempt(),
        };
        match self.executor.run(&workflow, &execution, &job.parameters, options).await {
            Ok(result) if result.retryable => Err(anyhow::anyhow!(result
                .error
                .unwrap_or_else(|| "transient step failure".to_string()))),
            Ok(result) => Ok(Some(serde_json::to_value(&result)?)),
            Err(e) if e.is_precondition() => self.reject_dispatch(&execution, e).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Close an execution whose job ended without the executor finishing it
    ///
    /// A cancelled job closes the execution CANCELLED, a failed or expired one
    /// FAILED. PENDING executions pass through RUNNING first. Executions that
    /// are already terminal are left alone.
    pub async fn close_abandoned(&self, job: &WorkflowExecutionJob, job_state: JobState, reason: &str) {
        let state = self.state();
        let execution = match state.get_execution(&job.execution_id).await {
            Ok(Some(execution)) if !execution.status.is_terminal() => execution,
            Ok(_) => return,
            Err(e) => {
                tracing::error!("❌ Failed to load abandoned execution {}: {}", job.execution_id, e);
                return;
            }
        };

        let status = match job_state {
            JobState::Cancelled => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Failed,
        };
        let was_running = execution.status == ExecutionStatus::Running;
        let checkpoint = Checkpoint::from_progress(execution.result.as_ref()).unwrap_or_default();
        let total_steps = match self.workflows.get_workflow(&job.workflow_id).await {
            Ok(Some(workflow)) => plan(&workflow).map(|steps| steps.len()).unwrap_or(0),
            _ => 0,
        };
        let result = ExecutionResult {
            execution_id: execution.id.clone(),
            status,
            success: false,
            total_steps,
            completed_steps: checkpoint.completed_steps.len(),
            failed_steps: usize::from(was_running && status == ExecutionStatus::Failed),
            skipped_steps: checkpoint.skipped_steps.len(),
            total_duration_ms: 0,
            error: Some(reason.to_string()),
            retryable: false,
        };

        state
            .append_log(
                &execution.id,
                LogLevel::Error,
                &format!("Execution closed after its job ended {}: {}", job_state, reason),
                Some(json!({ "jobState": job_state })),
            )
            .await;

        if !was_running {
            if let Err(e) = state.mark_running(&execution.id).await {
                tracing::error!("❌ Failed to close abandoned execution {}: {}", execution.id, e);
                return;
            }
        }
        let record = match serde_json::to_value(&result) {
            Ok(record) => record,
            Err(e) => json!({ "success": false, "error": format!("{} ({})", reason, e) }),
        };
        match state.mark_terminal(&execution.id, status, Some(record)).await {
            Ok(_) => tracing::warn!("⚠️ Execution {} closed {} after job {}", execution.id, status, job_state),
            Err(e) => tracing::error!("❌ Failed to close abandoned execution {}: {}", execution.id, e),
        }
    }

    /// Preconditions failed on the worker
    ///
    /// A PENDING execution stays PENDING with the reason logged; one already
    /// RUNNING from an earlier attempt is failed. The job itself completes.
    async fn reject_dispatch(&self, execution: &WorkflowExecution, error: ExecutionError) -> anyhow::Result<Option<Value>> {
        let message = error.to_string();
        let state = self.state();
        state
            .append_log(
                &execution.id,
                LogLevel::Error,
                &format!("Execution rejected at dispatch: {}", message),
                None,
            )
            .await;

        if execution.status == ExecutionStatus::Running {
            state
                .mark_terminal(&execution.id, ExecutionStatus::Failed, Some(json!({ "error": message })))
                .await?;
        }

        tracing::warn!("⚠️ Execution {} rejected at dispatch: {}", execution.id, message);
        Ok(Some(json!({ "executionId": execution.id, "error": message })))
    }
}

/// Job handler for the workflow-execution queue
pub struct WorkflowExecutionHandler {
    service: Arc<ExecutionService>,
}

impl WorkflowExecutionHandler {
    pub fn new(service: Arc<ExecutionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl JobHandler for WorkflowExecutionHandler {
    async fn handle(&self, job: &QueueJob, ctx: JobContext) -> anyhow::Result<Option<Value>> {
        let JobPayload::WorkflowExecution(payload) = &job.payload;
        tracing::info!(
            "📥 Dispatching execution {} (attempt {}/{})",
            payload.execution_id,
            ctx.attempt,
            ctx.max_attempts
        );
        self.service.run_queued(payload, ctx).await
    }

    async fn on_abandoned(&self, job: &QueueJob, state: JobState, reason: &str) {
        let JobPayload::WorkflowExecution(payload) = &job.payload;
        self.service.close_abandoned(payload, state, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::execution::store::MemoryExecutionStore;
    use crate::queue::store::MemoryJobStore;
    use crate::runtime::executor::StepExecutor;
    use crate::workflow::catalog::{ConnectionResolver, ConnectionSource, StaticSecretsVault};
    use crate::workflow::types::{ApiConnection, HttpMethod, StepType, WorkflowStatus, WorkflowStep};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct Catalog {
        workflows: RwLock<HashMap<String, Workflow>>,
    }

    #[async_trait]
    impl WorkflowSource for Catalog {
        async fn get_workflow(&self, id: &str) -> anyhow::Result<Option<Workflow>> {
            Ok(self.workflows.read().await.get(id).cloned())
        }
    }

    #[async_trait]
    impl ConnectionSource for Catalog {
        async fn get_connection(&self, _id: &str) -> anyhow::Result<Option<ApiConnection>> {
            Ok(None)
        }
    }

    fn transform(id: &str, order: i32) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            workflow_id: "wf-1".to_string(),
            step_order: order,
            is_active: true,
            step_type: StepType::DataTransform,
            connection_id: None,
            endpoint: None,
            method: HttpMethod::Get,
            parameters: json!({}),
            data_mapping: Some(json!({ "greeting": "$.params.name" })),
            conditions: None,
        }
    }

    fn workflow(status: WorkflowStatus, steps: Vec<WorkflowStep>) -> Workflow {
        Workflow {
            id: "wf-1".to_string(),
            owner_id: "user-1".to_string(),
            name: "Greeting".to_string(),
            status,
            steps,
        }
    }

    fn queue_config() -> QueueConfig {
        QueueConfig {
            team_size: 1,
            retry_limit: 0,
            retry_delay_secs: 1,
            timeout_secs: 30,
            expire_in_secs: 3600,
            poll_interval_ms: 20,
            maintenance_schedule: "0 * * * * *".to_string(),
            failed_warning_threshold: 5,
            queued_warning_threshold: 100,
        }
    }

    async fn service(mode: ExecutionMode, wf: Workflow) -> (Arc<ExecutionService>, Arc<MemoryExecutionStore>) {
        let catalog = Arc::new(Catalog::default());
        catalog.workflows.write().await.insert(wf.id.clone(), wf);

        let resolver = ConnectionResolver::new(catalog.clone(), Arc::new(StaticSecretsVault::new()));
        let steps = StepExecutor::new(resolver, Duration::from_secs(5), Duration::from_secs(5)).unwrap();
        let store = Arc::new(MemoryExecutionStore::new());
        let state = Arc::new(ExecutionStateManager::new(store.clone()));
        let executor = Arc::new(WorkflowExecutor::new(steps, state));

        let mut service = ExecutionService::new(catalog, executor, mode);
        if mode == ExecutionMode::Queued {
            let queue = Arc::new(QueueService::new(Arc::new(MemoryJobStore::new()), queue_config()));
            queue.start().await.unwrap();
            service = service.with_queue(queue);
        }
        (Arc::new(service), store)
    }

    async fn wait_for_terminal(service: &ExecutionService, id: &str) -> WorkflowExecution {
        for _ in 0..250 {
            let execution = service.state().get_execution(id).await.unwrap().unwrap();
            if execution.status.is_terminal() {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("execution {} did not finish", id);
    }

    #[tokio::test]
    async fn test_inline_execution_returns_summary() {
        let wf = workflow(WorkflowStatus::Active, vec![transform("a", 1), transform("b", 2)]);
        let (service, _) = service(ExecutionMode::Inline, wf).await;

        let response = service
            .execute("wf-1", "user-1", json!({ "name": "Ada" }), JobOptions::default())
            .await
            .unwrap();
        let ExecutionResponse::Completed(result) = &response else {
            panic!("expected an inline response");
        };
        assert!(result.success);
        assert_eq!(result.completed_steps, 2);

        let rendered = serde_json::to_value(&response).unwrap();
        assert_eq!(rendered["mode"], "completed");
        assert_eq!(rendered["totalSteps"], 2);
    }

    #[tokio::test]
    async fn test_preconditions_create_no_execution() {
        let (service, store) = service(ExecutionMode::Inline, workflow(WorkflowStatus::Inactive, vec![transform("a", 1)])).await;

        let err = service.execute("wf-1", "user-1", json!({}), JobOptions::default()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::WorkflowNotActive { .. }));

        let err = service.execute("wf-1", "user-2", json!({}), JobOptions::default()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::WorkflowNotFound(_)));

        let err = service.execute("wf-1", "user-1", json!([1]), JobOptions::default()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidParameters(_)));

        assert_eq!(store.execution_count().await, 0);
    }

    #[tokio::test]
    async fn test_queued_execution_runs_on_worker() {
        let wf = workflow(WorkflowStatus::Active, vec![transform("a", 1)]);
        let (service, _) = service(ExecutionMode::Queued, wf).await;
        service.register_worker(WorkerOptions::default()).await.unwrap();

        let response = service
            .execute("wf-1", "user-1", json!({ "name": "Ada", "apiKey": "k-1" }), JobOptions::default())
            .await
            .unwrap();
        let ExecutionResponse::Queued { execution_id, job } = response else {
            panic!("expected a queued response");
        };
        assert_eq!(job.queue_name, WORKFLOW_EXECUTION_QUEUE);

        let finished = wait_for_terminal(&service, &execution_id).await;
        assert_eq!(finished.status, ExecutionStatus::Completed);
        assert_eq!(finished.metadata["parameters"]["apiKey"], crate::queue::redact::REDACTED);
        assert_eq!(finished.result.unwrap()["outputs"]["a"], json!({ "greeting": "Ada" }));
    }

    #[tokio::test]
    async fn test_duplicate_job_key_closes_second_execution() {
        let wf = workflow(WorkflowStatus::Active, vec![transform("a", 1)]);
        let (service, _) = service(ExecutionMode::Queued, wf).await;
        let options = JobOptions {
            job_key: Some("order-7".to_string()),
            ..Default::default()
        };

        // No worker registered, so the first job stays queued
        service.execute("wf-1", "user-1", json!({}), options.clone()).await.unwrap();
        let err = service.execute("wf-1", "user-1", json!({}), options).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Queue(QueueError::DuplicateSubmission { .. })));
    }

    #[tokio::test]
    async fn test_dispatch_rejection_keeps_execution_pending() {
        let wf = workflow(WorkflowStatus::Active, vec![transform("a", 1)]);
        let (service, _) = service(ExecutionMode::Inline, wf).await;
        let execution = service.state().create_execution("wf-1", "user-1", &json!({})).await.unwrap();

        let job = WorkflowExecutionJob {
            execution_id: execution.id.clone(),
            workflow_id: "wf-missing".to_string(),
            user_id: "user-1".to_string(),
            parameters: json!({}),
        };
        let ctx = JobContext {
            attempt: 1,
            max_attempts: 1,
            cancellation: Default::default(),
        };
        let output = service.run_queued(&job, ctx).await.unwrap().unwrap();
        assert!(output["error"].as_str().unwrap().contains("wf-missing"));

        let stored = service.state().get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Pending);
        let logs = service.state().list_logs(&execution.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_queued_mode_requires_started_queue() {
        let wf = workflow(WorkflowStatus::Active, vec![transform("a", 1)]);
        let (service, store) = service(ExecutionMode::Queued, wf).await;
        if let Some(queue) = &service.queue {
            queue.stop().await.unwrap();
        }

        let err = service.execute("wf-1", "user-1", json!({}), JobOptions::default()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Queue(QueueError::NotInitialized)));
        assert_eq!(store.execution_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_options_create_no_execution() {
        let wf = workflow(WorkflowStatus::Active, vec![transform("a", 1)]);
        let (service, store) = service(ExecutionMode::Queued, wf).await;

        let options = JobOptions {
            retry_limit: Some(11),
            ..Default::default()
        };
        let err = service.execute("wf-1", "user-1", json!({}), options).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Queue(QueueError::Validation(_))));
        assert_eq!(store.execution_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_cancels_execution() {
        let wf = workflow(WorkflowStatus::Active, vec![transform("a", 1)]);
        let (service, _) = service(ExecutionMode::Queued, wf).await;
        service.register_worker(WorkerOptions::default()).await.unwrap();

        let options = JobOptions {
            delay: Some(60),
            ..Default::default()
        };
        let response = service.execute("wf-1", "user-1", json!({}), options).await.unwrap();
        let ExecutionResponse::Queued { execution_id, job } = response else {
            panic!("expected a queued response");
        };

        let queue = service.queue.clone().unwrap();
        let state = queue.cancel_job(&job.queue_name, &job.job_id).await.unwrap();
        assert_eq!(state, Some(JobState::Cancelled));

        let execution = service.state().get_execution(&execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert!(execution.completed_at.is_some());
        let result = ExecutionResult::from_record(&execution);
        assert!(!result.success);
        assert_eq!(result.total_steps, 1);
        assert_eq!(result.completed_steps, 0);
        assert!(result.error.unwrap().contains("cancelled"));
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_running_execution_fails_with_reason() {
        let wf = workflow(WorkflowStatus::Active, vec![transform("a", 1), transform("b", 2)]);
        let (service, _) = service(ExecutionMode::Inline, wf).await;
        let state = service.state();
        let execution = state.create_execution("wf-1", "user-1", &json!({})).await.unwrap();
        state.mark_running(&execution.id).await.unwrap();

        let mut checkpoint = Checkpoint::default();
        checkpoint.scope.record_output("a", json!({ "greeting": "Ada" }));
        checkpoint.completed_steps.push("a".to_string());
        state.save_progress(&execution.id, checkpoint.to_progress()).await.unwrap();

        let job = WorkflowExecutionJob {
            execution_id: execution.id.clone(),
            workflow_id: "wf-1".to_string(),
            user_id: "user-1".to_string(),
            parameters: json!({}),
        };
        service.close_abandoned(&job, JobState::Failed, "job timed out after 1s").await;

        let stored = state.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        let result = ExecutionResult::from_record(&stored);
        assert_eq!(result.total_steps, 2);
        assert_eq!(result.completed_steps, 1);
        assert_eq!(result.failed_steps, 1);
        assert_eq!(result.error.as_deref(), Some("job timed out after 1s"));

        // Already terminal: a second notification changes nothing
        service.close_abandoned(&job, JobState::Expired, "job expired").await;
        let again = state.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(again.status, ExecutionStatus::Failed);
        assert_eq!(again.result, stored.result);

        let logs = state.list_logs(&execution.id).await.unwrap();
        assert_eq!(logs.iter().filter(|l| l.level == LogLevel::Error).count(), 1);
    }
}
