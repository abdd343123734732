/// Sequential workflow execution engine
///
/// Runs a workflow's active steps in `stepOrder`, threading a scope of
/// prior outputs from one step to the next. The first failing step halts
/// the run. After each step the scope is checkpointed on the execution so a
/// retried attempt picks up after the last completed step.

use crate::execution::state::ExecutionStateManager;
use crate::execution::types::{ExecutionStatus, LogLevel, StateError, WorkflowExecution};
use crate::queue::redact::redact_value;
use crate::queue::types::CancellationFlag;
use crate::runtime::context::{Checkpoint, ExecutionScope};
use crate::runtime::error::{ExecutionError, StepError};
use crate::runtime::executor::{StepContext, StepExecutor};
use crate::runtime::expression::evaluate_condition;
use crate::workflow::types::{Workflow, WorkflowStatus, WorkflowStep};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

/// Summary of one execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub success: bool,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    #[serde(default)]
    pub skipped_steps: usize,
    /// Milliseconds spent running steps in this attempt
    #[serde(rename = "totalDuration")]
    pub total_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Halted on a transient failure with attempts left; the execution stays RUNNING
    #[serde(default)]
    pub retryable: bool,
}

impl ExecutionResult {
    /// Summary of an execution that already reached a terminal status
    pub fn from_record(execution: &WorkflowExecution) -> Self {
        execution
            .result
            .as_ref()
            .and_then(|r| serde_json::from_value::<ExecutionResult>(r.clone()).ok())
            .unwrap_or_else(|| ExecutionResult {
                execution_id: execution.id.clone(),
                status: execution.status,
                success: execution.status == ExecutionStatus::Completed,
                total_steps: 0,
                completed_steps: 0,
                failed_steps: 0,
                skipped_steps: 0,
                total_duration_ms: 0,
                error: None,
                retryable: false,
            })
    }
}

/// Per-attempt knobs supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cancellation: Option<CancellationFlag>,
    /// No retry follows this attempt, so transient failures are final
    pub final_attempt: bool,
}

impl RunOptions {
    /// Single attempt on the caller's task
    pub fn inline() -> Self {
        Self {
            cancellation: None,
            final_attempt: true,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(|flag| flag.is_cancelled())
    }
}

/// Active steps in execution order
///
/// Rejects workflows that are not ACTIVE, have no active steps, or give two
/// active steps the same `stepOrder`.
pub fn plan(workflow: &Workflow) -> Result<Vec<&WorkflowStep>, ExecutionError> {
    if workflow.status != WorkflowStatus::Active {
        return Err(ExecutionError::WorkflowNotActive {
            id: workflow.id.clone(),
            status: workflow.status,
        });
    }

    let mut steps: Vec<&WorkflowStep> = workflow.steps.iter().filter(|s| s.is_active).collect();
    if steps.is_empty() {
        return Err(ExecutionError::NoActiveSteps(workflow.id.clone()));
    }

    steps.sort_by_key(|s| s.step_order);
    if let Some(pair) = steps.windows(2).find(|pair| pair[0].step_order == pair[1].step_order) {
        return Err(ExecutionError::DuplicateStepOrder {
            workflow_id: workflow.id.clone(),
            step_order: pair[0].step_order,
        });
    }

    Ok(steps)
}

enum StepFlow {
    Completed,
    Skipped,
}

enum Halt {
    Failed { step_id: String, error: StepError },
    Cancelled,
}

#[derive(Debug, Default)]
struct Tally {
    completed: usize,
    failed: usize,
    skipped: usize,
}

pub struct WorkflowExecutor {
    steps: StepExecutor,
    state: Arc<ExecutionStateManager>,
}

impl WorkflowExecutor {
    pub fn new(steps: StepExecutor, state: Arc<ExecutionStateManager>) -> Self {
        Self { steps, state }
    }

    pub fn state(&self) -> &Arc<ExecutionStateManager> {
        &self.state
    }

    /// Run (or resume) an execution
    ///
    /// A PENDING execution is moved to RUNNING first; a RUNNING one resumes
    /// from its checkpoint; a terminal one is returned as recorded. Plan
    /// errors are returned before the execution is touched.
    pub async fn run(
        &self,
        workflow: &Workflow,
        execution: &WorkflowExecution,
        parameters: &Value,
        options: RunOptions,
    ) -> Result<ExecutionResult, ExecutionError> {
        let steps = plan(workflow)?;
        let execution_id = execution.id.as_str();

        let mut checkpoint = match execution.status {
            ExecutionStatus::Pending => {
                self.state.mark_running(execution_id).await?;
                self.state
                    .append_log(
                        execution_id,
                        LogLevel::Info,
                        "Execution started",
                        Some(json!({ "workflowId": workflow.id, "totalSteps": steps.len() })),
                    )
                    .await;
                Checkpoint {
                    scope: ExecutionScope::new(parameters.clone()),
                    ..Default::default()
                }
            }
            ExecutionStatus::Running => {
                let mut checkpoint = Checkpoint::from_progress(execution.result.as_ref()).unwrap_or_default();
                checkpoint.scope.params = parameters.clone();
                self.state
                    .append_log(
                        execution_id,
                        LogLevel::Info,
                        &format!("Execution resumed after {} completed steps", checkpoint.completed_steps.len()),
                        None,
                    )
                    .await;
                checkpoint
            }
            _ => {
                tracing::info!("⏭️ Execution {} already {}, nothing to run", execution_id, execution.status);
                return Ok(ExecutionResult::from_record(execution));
            }
        };

        tracing::info!("🚀 Starting workflow execution: {} ({})", workflow.id, execution_id);
        let ctx = StepContext {
            execution_id,
            user_id: &execution.user_id,
        };
        let started = Instant::now();
        let mut tally = Tally::default();
        let mut halt = None;

        for step in &steps {
            if checkpoint.is_done(&step.id) {
                tally.completed += 1;
                continue;
            }
            if checkpoint.was_skipped(&step.id) {
                tally.skipped += 1;
                continue;
            }
            if options.is_cancelled() {
                halt = Some(Halt::Cancelled);
                break;
            }

            match self.run_step(ctx, step, &mut checkpoint).await {
                Ok(StepFlow::Completed) => tally.completed += 1,
                Ok(StepFlow::Skipped) => tally.skipped += 1,
                Err(error) => {
                    tally.failed += 1;
                    halt = Some(Halt::Failed {
                        step_id: step.id.clone(),
                        error,
                    });
                    break;
                }
            }
            self.save_checkpoint(execution_id, &checkpoint).await;
        }

        let (status, error, retryable) = match &halt {
            None => (ExecutionStatus::Completed, None, false),
            Some(Halt::Cancelled) => (ExecutionStatus::Cancelled, Some("execution cancelled".to_string()), false),
            Some(Halt::Failed { step_id, error }) => {
                let message = format!("step {} failed: {}", step_id, error);
                if error.is_transient() && !options.final_attempt {
                    (ExecutionStatus::Running, Some(message), true)
                } else {
                    (ExecutionStatus::Failed, Some(message), false)
                }
            }
        };

        let result = ExecutionResult {
            execution_id: execution_id.to_string(),
            status,
            success: status == ExecutionStatus::Completed,
            total_steps: steps.len(),
            completed_steps: tally.completed,
            failed_steps: tally.failed,
            skipped_steps: tally.skipped,
            total_duration_ms: started.elapsed().as_millis() as u64,
            error,
            retryable,
        };

        if retryable {
            self.state
                .append_log(
                    execution_id,
                    LogLevel::Warn,
                    "Execution halted on a transient failure, awaiting retry",
                    Some(json!({ "error": result.error })),
                )
                .await;
            tracing::warn!("🔁 Execution {} will be retried: {:?}", execution_id, result.error);
            return Ok(result);
        }

        let mut record = serde_json::to_value(&result).map_err(StateError::from)?;
        record["outputs"] = redact_value(&json!(checkpoint.scope.steps));
        self.state.mark_terminal(execution_id, status, Some(record)).await?;

        let level = if result.success { LogLevel::Info } else { LogLevel::Error };
        self.state
            .append_log(
                execution_id,
                level,
                &format!("Execution finished as {}", status),
                Some(json!({
                    "completedSteps": result.completed_steps,
                    "failedSteps": result.failed_steps,
                    "skippedSteps": result.skipped_steps,
                    "totalDuration": result.total_duration_ms,
                })),
            )
            .await;

        tracing::info!(
            "✅ Workflow execution {} finished as {} in {}ms",
            execution_id,
            status,
            result.total_duration_ms
        );
        Ok(result)
    }

    async fn run_step(
        &self,
        ctx: StepContext<'_>,
        step: &WorkflowStep,
        checkpoint: &mut Checkpoint,
    ) -> Result<StepFlow, StepError> {
        let execution_id = ctx.execution_id;

        if let Some(condition) = step.conditions.as_deref().filter(|c| !c.trim().is_empty()) {
            let proceed = match evaluate_condition(condition, &checkpoint.scope.document()) {
                Ok(proceed) => proceed,
                Err(error) => {
                    self.log_step_failure(execution_id, step, &error).await;
                    return Err(error);
                }
            };
            if !proceed {
                checkpoint.skipped_steps.push(step.id.clone());
                self.state
                    .append_log(
                        execution_id,
                        LogLevel::Info,
                        &format!("Step {} skipped: condition not met", step.id),
                        Some(json!({ "condition": condition })),
                    )
                    .await;
                return Ok(StepFlow::Skipped);
            }
        }

        self.state
            .append_log(
                execution_id,
                LogLevel::Info,
                &format!("Step {} started", step.id),
                Some(json!({ "type": step.step_type.as_str(), "stepOrder": step.step_order })),
            )
            .await;

        let step_start = Instant::now();
        match self.steps.execute(ctx, step, &checkpoint.scope).await {
            Ok(output) => {
                if let Some(outcome) = output.condition {
                    checkpoint.scope.record_condition(&step.id, outcome);
                }
                self.state
                    .append_log(
                        execution_id,
                        LogLevel::Info,
                        &format!("Step {} completed in {}ms", step.id, step_start.elapsed().as_millis()),
                        Some(output.data.clone()),
                    )
                    .await;
                checkpoint.scope.record_output(&step.id, output.data);
                checkpoint.completed_steps.push(step.id.clone());
                Ok(StepFlow::Completed)
            }
            Err(error) => {
                self.log_step_failure(execution_id, step, &error).await;
                Err(error)
            }
        }
    }

    async fn log_step_failure(&self, execution_id: &str, step: &WorkflowStep, error: &StepError) {
        self.state
            .append_log(
                execution_id,
                LogLevel::Error,
                &format!("Step {} failed: {}", step.id, error),
                Some(json!({ "transient": error.is_transient() })),
            )
            .await;
    }

    async fn save_checkpoint(&self, execution_id: &str, checkpoint: &Checkpoint) {
        if let Err(e) = self.state.save_progress(execution_id, checkpoint.to_progress()).await {
            tracing::warn!("⚠️ Failed to checkpoint execution {}: {}", execution_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::store::MemoryExecutionStore;
    use crate::workflow::catalog::{ConnectionResolver, ConnectionSource, StaticSecretsVault};
    use crate::workflow::types::{ApiConnection, AuthType, HttpMethod, StepType};
    use async_trait::async_trait;
    use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Connections(Vec<ApiConnection>);

    #[async_trait]
    impl ConnectionSource for Connections {
        async fn get_connection(&self, id: &str) -> anyhow::Result<Option<ApiConnection>> {
            Ok(self.0.iter().find(|c| c.id == id).cloned())
        }
    }

    fn step(id: &str, order: i32, step_type: StepType) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            workflow_id: "wf-1".to_string(),
            step_order: order,
            is_active: true,
            step_type,
            connection_id: None,
            endpoint: None,
            method: HttpMethod::Get,
            parameters: json!({}),
            data_mapping: None,
            conditions: None,
        }
    }

    fn workflow(steps: Vec<WorkflowStep>) -> Workflow {
        Workflow {
            id: "wf-1".to_string(),
            owner_id: "user-1".to_string(),
            name: "Test".to_string(),
            status: WorkflowStatus::Active,
            steps,
        }
    }

    fn executor(base_url: Option<&str>) -> WorkflowExecutor {
        let connections = base_url
            .map(|url| {
                vec![ApiConnection {
                    id: "c1".to_string(),
                    user_id: "user-1".to_string(),
                    name: "local".to_string(),
                    base_url: url.to_string(),
                    auth_type: AuthType::None,
                    auth_config: json!({}),
                    secret_ref: None,
                }]
            })
            .unwrap_or_default();
        let resolver = ConnectionResolver::new(Arc::new(Connections(connections)), Arc::new(StaticSecretsVault::new()));
        let steps = StepExecutor::new(resolver, Duration::from_secs(5), Duration::from_secs(5)).unwrap();
        let state = Arc::new(ExecutionStateManager::new(Arc::new(MemoryExecutionStore::new())));
        WorkflowExecutor::new(steps, state)
    }

    async fn pending(executor: &WorkflowExecutor, params: &Value) -> WorkflowExecution {
        executor.state().create_execution("wf-1", "user-1", params).await.unwrap()
    }

    #[test]
    fn test_plan_orders_and_validates() {
        let wf = workflow(vec![
            step("b", 2, StepType::DataTransform),
            step("a", 1, StepType::DataTransform),
            WorkflowStep {
                is_active: false,
                ..step("off", 1, StepType::DataTransform)
            },
        ]);
        let ids: Vec<&str> = plan(&wf).unwrap().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let dup = workflow(vec![step("a", 1, StepType::DataTransform), step("b", 1, StepType::DataTransform)]);
        assert!(matches!(plan(&dup), Err(ExecutionError::DuplicateStepOrder { step_order: 1, .. })));

        let mut inactive = workflow(vec![step("a", 1, StepType::DataTransform)]);
        inactive.status = WorkflowStatus::Archived;
        assert!(matches!(plan(&inactive), Err(ExecutionError::WorkflowNotActive { .. })));

        assert!(matches!(plan(&workflow(vec![])), Err(ExecutionError::NoActiveSteps(_))));
    }

    #[tokio::test]
    async fn test_sequential_run_with_mapping_and_condition_skip() {
        let executor = executor(None);
        let params = json!({ "amount": 50 });

        let mut shape = step("shape", 1, StepType::DataTransform);
        shape.data_mapping = Some(json!({ "amount": "$.params.amount" }));
        shape.parameters = json!({ "script": "return { doubled = input.amount * 2 }" });

        let mut check = step("big", 2, StepType::Condition);
        check.parameters = json!({ "expression": "steps.shape.doubled > 500" });

        let mut gated = step("gated", 3, StepType::DataTransform);
        gated.conditions = Some("conditions.big".to_string());

        let mut last = step("last", 4, StepType::DataTransform);
        last.data_mapping = Some(json!({ "value": "$.previous.result" }));

        let wf = workflow(vec![last, gated, check, shape]);
        let execution = pending(&executor, &params).await;
        let result = executor.run(&wf, &execution, &params, RunOptions::inline()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(result.success);
        assert_eq!((result.total_steps, result.completed_steps, result.skipped_steps, result.failed_steps), (4, 3, 1, 0));

        let stored = executor.state().get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        let record = stored.result.unwrap();
        assert_eq!(record["outputs"]["shape"], json!({ "doubled": 100 }));
        assert_eq!(record["outputs"]["last"], json!({ "value": false }));

        let logs = executor.state().list_logs(&execution.id).await.unwrap();
        let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages.first(), Some(&"Execution started"));
        assert!(messages.contains(&"Step gated skipped: condition not met"));
        assert_eq!(messages.last(), Some(&"Execution finished as COMPLETED"));
    }

    #[tokio::test]
    async fn test_first_failure_halts_remaining_steps() {
        let executor = executor(None);
        let params = json!({});

        let mut broken = step("broken", 2, StepType::Condition);
        broken.parameters = json!({ "expression": "nil + 1" });

        let wf = workflow(vec![
            step("first", 1, StepType::DataTransform),
            broken,
            step("never", 3, StepType::DataTransform),
        ]);
        let execution = pending(&executor, &params).await;
        let result = executor.run(&wf, &execution, &params, RunOptions::inline()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!((result.completed_steps, result.failed_steps), (1, 1));
        assert!(result.error.unwrap().starts_with("step broken failed"));

        let logs = executor.state().list_logs(&execution.id).await.unwrap();
        assert!(logs.iter().all(|l| !l.message.contains("never")));
        assert!(logs.iter().any(|l| l.level == LogLevel::Error && l.message.starts_with("Step broken failed")));
    }

    #[tokio::test]
    async fn test_transient_failure_resumes_from_checkpoint() {
        let first_calls = Arc::new(AtomicUsize::new(0));
        let flaky_calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/first",
                get(|State((first, _)): State<(Arc<AtomicUsize>, Arc<AtomicUsize>)>| async move {
                    first.fetch_add(1, Ordering::SeqCst);
                    Json(json!({ "ok": true }))
                }),
            )
            .route(
                "/flaky",
                get(|State((_, flaky)): State<(Arc<AtomicUsize>, Arc<AtomicUsize>)>| async move {
                    if flaky.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(StatusCode::BAD_GATEWAY)
                    } else {
                        Ok(Json(json!({ "ok": true })))
                    }
                }),
            )
            .with_state((first_calls.clone(), flaky_calls.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let executor = executor(Some(&base));
        let mut first = step("first", 1, StepType::ApiCall);
        first.connection_id = Some("c1".to_string());
        first.endpoint = Some("/first".to_string());
        let mut flaky = step("flaky", 2, StepType::ApiCall);
        flaky.connection_id = Some("c1".to_string());
        flaky.endpoint = Some("/flaky".to_string());
        let wf = workflow(vec![first, flaky]);

        let params = json!({});
        let execution = pending(&executor, &params).await;
        let options = RunOptions {
            cancellation: None,
            final_attempt: false,
        };

        let attempt = executor.run(&wf, &execution, &params, options.clone()).await.unwrap();
        assert!(attempt.retryable);
        assert_eq!(attempt.status, ExecutionStatus::Running);

        let stored = executor.state().get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Running);

        let retried = executor.run(&wf, &stored, &params, options).await.unwrap();
        assert_eq!(retried.status, ExecutionStatus::Completed);
        assert_eq!(retried.completed_steps, 2);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);

        // Terminal executions are reported as recorded
        let finished = executor.state().get_execution(&execution.id).await.unwrap().unwrap();
        let again = executor.run(&wf, &finished, &params, RunOptions::inline()).await.unwrap();
        assert_eq!(again.status, ExecutionStatus::Completed);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_before_next_step() {
        let executor = executor(None);
        let params = json!({});
        let flag = CancellationFlag::new();
        flag.cancel();

        let wf = workflow(vec![step("a", 1, StepType::DataTransform)]);
        let execution = pending(&executor, &params).await;
        let options = RunOptions {
            cancellation: Some(flag),
            final_attempt: false,
        };
        let result = executor.run(&wf, &execution, &params, options).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.completed_steps, 0);
        let stored = executor.state().get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_plan_errors_leave_execution_pending() {
        let executor = executor(None);
        let params = json!({});
        let execution = pending(&executor, &params).await;

        let dup = workflow(vec![step("a", 1, StepType::DataTransform), step("b", 1, StepType::DataTransform)]);
        let err = executor.run(&dup, &execution, &params, RunOptions::inline()).await.unwrap_err();
        assert!(err.is_precondition());

        let stored = executor.state().get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Pending);
    }
}
