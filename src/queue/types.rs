/// Queue job type definitions
///
/// Neutral job state machine, typed payloads, submission options and the
/// stored job record shared by every job store implementation.

use crate::queue::error::{QueueError, QueueResult};
use crate::queue::redact::{redact_value, Redact};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Queue consumed by the workflow execution worker pool
pub const WORKFLOW_EXECUTION_QUEUE: &str = "workflow-execution";

/// Job name used for workflow execution jobs
pub const WORKFLOW_EXECUTION_JOB: &str = "execute-workflow";

const MAX_RETRY_LIMIT: u32 = 10;
const RETRY_DELAY_RANGE: (u64, u64) = (1, 300);
const TIMEOUT_RANGE: (u64, u64) = (1, 3600);
const PRIORITY_RANGE: (i32, i32) = (-10, 10);
const MAX_DELAY_SECS: u64 = 24 * 60 * 60;
const EXPIRE_RANGE: (u64, u64) = (1, 24 * 60 * 60);

/// Lifecycle of a queue job
///
/// `created → active → {completed | retry → active | failed | expired | cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Active,
    Retry,
    Completed,
    Cancelled,
    Expired,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Active => "active",
            JobState::Retry => "retry",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Expired => "expired",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Expired | JobState::Failed
        )
    }

    /// Waiting for a worker (eligible for dispatch once `start_after` passes)
    pub fn is_queued(&self) -> bool {
        matches!(self, JobState::Created | JobState::Retry)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Created, Active) | (Created, Cancelled) | (Created, Expired) => true,
            (Retry, Active) | (Retry, Cancelled) | (Retry, Expired) => true,
            (Active, Completed) | (Active, Retry) | (Active, Failed) => true,
            (Active, Cancelled) | (Active, Expired) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobState::Created),
            "active" => Ok(JobState::Active),
            "retry" => Ok(JobState::Retry),
            "completed" => Ok(JobState::Completed),
            "cancelled" => Ok(JobState::Cancelled),
            "expired" => Ok(JobState::Expired),
            "failed" => Ok(JobState::Failed),
            other => Err(QueueError::Backend(format!("unknown job state '{}'", other))),
        }
    }
}

/// Payload of a workflow execution job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionJob {
    /// Execution record created by the entry point before enqueueing
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    /// Runtime parameters (free-form JSON object)
    pub parameters: Value,
}

impl Redact for WorkflowExecutionJob {
    /// Ids are kept; parameters are caller data and get masked by name
    fn redacted(&self) -> Value {
        serde_json::json!({
            "executionId": self.execution_id,
            "workflowId": self.workflow_id,
            "userId": self.user_id,
            "parameters": redact_value(&self.parameters),
        })
    }
}

/// Tagged job payload, one variant per job kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    WorkflowExecution(WorkflowExecutionJob),
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::WorkflowExecution(_) => "workflow_execution",
        }
    }

    /// Boundary validation run before a job is handed to the backend
    pub fn validate(&self) -> QueueResult<()> {
        match self {
            JobPayload::WorkflowExecution(job) => {
                if job.execution_id.trim().is_empty() {
                    return Err(QueueError::Validation("executionId must not be empty".to_string()));
                }
                if job.workflow_id.trim().is_empty() {
                    return Err(QueueError::Validation("workflowId must not be empty".to_string()));
                }
                if job.user_id.trim().is_empty() {
                    return Err(QueueError::Validation("userId must not be empty".to_string()));
                }
                if !job.parameters.is_object() {
                    return Err(QueueError::Validation("parameters must be a JSON object".to_string()));
                }
                Ok(())
            }
        }
    }

    /// Loggable copy with sensitive fields blanked
    pub fn redacted(&self) -> Value {
        let inner = match self {
            JobPayload::WorkflowExecution(job) => job.redacted(),
        };
        serde_json::json!({ "kind": self.kind(), "data": inner })
    }
}

/// Per-job options; unset values fall back to worker options, then service defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub retry_limit: Option<u32>,
    /// Seconds between attempts
    pub retry_delay: Option<u64>,
    /// Double the delay on every retry (capped at 300s)
    #[serde(default)]
    pub retry_backoff: bool,
    /// Seconds a handler invocation may run
    pub timeout: Option<u64>,
    pub priority: Option<i32>,
    /// Seconds before the job becomes eligible
    pub delay: Option<u64>,
    /// Seconds the job may wait for a worker
    pub expire_in: Option<u64>,
    /// Caller-supplied dedup key
    pub job_key: Option<String>,
}

/// A job as submitted by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    pub queue_name: String,
    pub job_name: String,
    pub payload: JobPayload,
    #[serde(default)]
    pub options: JobOptions,
}

fn check_range<T: PartialOrd + fmt::Display + Copy>(
    field: &str,
    value: Option<T>,
    (min, max): (T, T),
    unit: &str,
) -> QueueResult<()> {
    match value {
        Some(v) if v < min || v > max => Err(QueueError::Validation(format!(
            "{} must be within [{}{}, {}{}], got {}{}",
            field, min, unit, max, unit, v, unit
        ))),
        _ => Ok(()),
    }
}

impl JobSubmission {
    pub fn new(queue_name: impl Into<String>, job_name: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            queue_name: queue_name.into(),
            job_name: job_name.into(),
            payload,
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Synchronous validation; a failing submission never touches the backend
    pub fn validate(&self) -> QueueResult<()> {
        if self.queue_name.trim().is_empty() {
            return Err(QueueError::Validation("queue name must not be empty".to_string()));
        }
        if self.job_name.trim().is_empty() {
            return Err(QueueError::Validation("job name must not be empty".to_string()));
        }

        self.options.validate()?;
        self.payload.validate()
    }
}

impl JobOptions {
    /// Range checks shared by every submission
    pub fn validate(&self) -> QueueResult<()> {
        check_range("retryLimit", self.retry_limit, (0, MAX_RETRY_LIMIT), "")?;
        check_range("retryDelay", self.retry_delay, RETRY_DELAY_RANGE, "s")?;
        check_range("timeout", self.timeout, TIMEOUT_RANGE, "s")?;
        check_range("priority", self.priority, PRIORITY_RANGE, "")?;
        check_range("delay", self.delay, (0, MAX_DELAY_SECS), "s")?;
        check_range("expireIn", self.expire_in, EXPIRE_RANGE, "s")?;

        if let Some(key) = &self.job_key {
            if key.trim().is_empty() {
                return Err(QueueError::Validation("jobKey must not be empty when provided".to_string()));
            }
        }
        Ok(())
    }
}

/// Handle returned from a successful submission
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub queue_name: String,
    pub job_id: String,
}

/// Stored job record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub id: String,
    pub queue_name: String,
    pub job_name: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub job_key: Option<String>,
    pub priority: i32,
    pub retry_limit: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub retry_backoff: bool,
    pub timeout_secs: Option<u64>,
    pub expire_in_secs: u64,
    /// Retries consumed so far
    pub retry_count: u32,
    pub start_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub last_error: Option<String>,
    /// Every state the job has been in, oldest first
    pub state_history: Vec<JobState>,
}

impl QueueJob {
    /// Build the initial record for a validated submission
    pub fn from_submission(submission: JobSubmission, default_expire_in: u64, now: DateTime<Utc>) -> Self {
        let opts = submission.options;
        let delay = chrono::Duration::seconds(opts.delay.unwrap_or(0) as i64);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            queue_name: submission.queue_name,
            job_name: submission.job_name,
            payload: submission.payload,
            state: JobState::Created,
            job_key: opts.job_key,
            priority: opts.priority.unwrap_or(0),
            retry_limit: opts.retry_limit,
            retry_delay_secs: opts.retry_delay,
            retry_backoff: opts.retry_backoff,
            timeout_secs: opts.timeout,
            expire_in_secs: opts.expire_in.unwrap_or(default_expire_in),
            retry_count: 0,
            start_after: now + delay,
            created_at: now,
            started_at: None,
            completed_at: None,
            output: None,
            last_error: None,
            state_history: vec![JobState::Created],
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            queue_name: self.queue_name.clone(),
            job_id: self.id.clone(),
        }
    }
}

/// Effective retry settings for one failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_limit: u32,
    pub retry_delay: Duration,
    pub backoff: bool,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        if !self.backoff {
            return self.retry_delay;
        }
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        let secs = self.retry_delay.as_secs().saturating_mul(factor);
        Duration::from_secs(secs.min(RETRY_DELAY_RANGE.1))
    }
}

/// Cooperative cancellation signal shared between the queue and a running handler
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runtime information handed to a job handler with each dispatched job
#[derive(Debug, Clone)]
pub struct JobContext {
    /// 1-based attempt number
    pub attempt: u32,
    /// Total attempts allowed (retry limit + 1)
    pub max_attempts: u32,
    pub cancellation: CancellationFlag,
}

impl JobContext {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Job counts by state, as reported by the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub created: u64,
    pub active: u64,
    pub retry: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub expired: u64,
}

impl JobCounts {
    pub fn queued(&self) -> u64 {
        self.created + self.retry
    }

    pub fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Created => self.created += count,
            JobState::Active => self.active += count,
            JobState::Retry => self.retry += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
            JobState::Cancelled => self.cancelled += count,
            JobState::Expired => self.expired += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> JobPayload {
        JobPayload::WorkflowExecution(WorkflowExecutionJob {
            execution_id: "exec-1".to_string(),
            workflow_id: "wf-1".to_string(),
            user_id: "user-1".to_string(),
            parameters: json!({ "email": "a@b.c", "apiToken": "t-123" }),
        })
    }

    fn submission(options: JobOptions) -> JobSubmission {
        JobSubmission::new(WORKFLOW_EXECUTION_QUEUE, WORKFLOW_EXECUTION_JOB, payload()).with_options(options)
    }

    #[test]
    fn test_terminal_states_never_transition() {
        let all = [
            JobState::Created,
            JobState::Active,
            JobState::Retry,
            JobState::Completed,
            JobState::Cancelled,
            JobState::Expired,
            JobState::Failed,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all.iter() {
                assert!(!from.can_transition_to(*to), "{} -> {} must be rejected", from, to);
            }
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        assert!(JobState::Created.can_transition_to(JobState::Active));
        assert!(JobState::Active.can_transition_to(JobState::Retry));
        assert!(JobState::Retry.can_transition_to(JobState::Active));
        assert!(JobState::Active.can_transition_to(JobState::Failed));
        assert!(JobState::Created.can_transition_to(JobState::Cancelled));
        assert!(JobState::Active.can_transition_to(JobState::Expired));
        assert!(!JobState::Created.can_transition_to(JobState::Completed));
        assert!(!JobState::Retry.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in [JobState::Created, JobState::Retry, JobState::Expired] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("paused".parse::<JobState>().is_err());
    }

    #[test]
    fn test_validation_bounds() {
        assert!(submission(JobOptions::default()).validate().is_ok());

        let bad = [
            JobOptions { retry_limit: Some(11), ..Default::default() },
            JobOptions { retry_delay: Some(0), ..Default::default() },
            JobOptions { retry_delay: Some(301), ..Default::default() },
            JobOptions { timeout: Some(3601), ..Default::default() },
            JobOptions { priority: Some(-11), ..Default::default() },
            JobOptions { delay: Some(24 * 60 * 60 + 1), ..Default::default() },
            JobOptions { expire_in: Some(0), ..Default::default() },
            JobOptions { job_key: Some("  ".to_string()), ..Default::default() },
        ];
        for options in bad {
            let err = submission(options.clone()).validate().unwrap_err();
            assert!(matches!(err, QueueError::Validation(_)), "{:?} should fail", options);
        }

        let edges = JobOptions {
            retry_limit: Some(10),
            retry_delay: Some(300),
            timeout: Some(3600),
            priority: Some(-10),
            delay: Some(0),
            expire_in: Some(86_400),
            ..Default::default()
        };
        assert!(submission(edges).validate().is_ok());
    }

    #[test]
    fn test_empty_names_rejected() {
        let mut sub = submission(JobOptions::default());
        sub.queue_name = " ".to_string();
        assert!(matches!(sub.validate(), Err(QueueError::Validation(_))));

        let mut sub = submission(JobOptions::default());
        sub.job_name.clear();
        assert!(matches!(sub.validate(), Err(QueueError::Validation(_))));
    }

    #[test]
    fn test_payload_validation() {
        let bad = JobPayload::WorkflowExecution(WorkflowExecutionJob {
            execution_id: "exec-1".to_string(),
            workflow_id: String::new(),
            user_id: "user-1".to_string(),
            parameters: json!({}),
        });
        assert!(bad.validate().is_err());

        let not_object = JobPayload::WorkflowExecution(WorkflowExecutionJob {
            execution_id: "exec-1".to_string(),
            workflow_id: "wf".to_string(),
            user_id: "user-1".to_string(),
            parameters: json!([1, 2]),
        });
        assert!(not_object.validate().is_err());
    }

    #[test]
    fn test_payload_is_tagged() {
        let value = serde_json::to_value(payload()).unwrap();
        assert_eq!(value["kind"], "workflow_execution");
        assert_eq!(value["workflowId"], "wf-1");
    }

    #[test]
    fn test_payload_redaction() {
        let redacted = payload().redacted();
        assert_eq!(redacted["data"]["parameters"]["email"], "a@b.c");
        assert_eq!(redacted["data"]["parameters"]["apiToken"], crate::queue::redact::REDACTED);
        assert_eq!(redacted["data"]["workflowId"], "wf-1");
    }

    #[test]
    fn test_backoff_delay() {
        let policy = RetryPolicy {
            retry_limit: 5,
            retry_delay: Duration::from_secs(10),
            backoff: true,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(40));
        assert_eq!(policy.delay_for(10), Duration::from_secs(300));

        let flat = RetryPolicy { backoff: false, ..policy };
        assert_eq!(flat.delay_for(4), Duration::from_secs(10));
    }

    #[test]
    fn test_from_submission_applies_delay_and_defaults() {
        let now = Utc::now();
        let job = QueueJob::from_submission(
            submission(JobOptions { delay: Some(60), priority: Some(3), ..Default::default() }),
            900,
            now,
        );
        assert_eq!(job.state, JobState::Created);
        assert_eq!(job.priority, 3);
        assert_eq!(job.expire_in_secs, 900);
        assert_eq!(job.start_after, now + chrono::Duration::seconds(60));
        assert_eq!(job.state_history, vec![JobState::Created]);
    }

    #[test]
    fn test_context_final_attempt() {
        let ctx = JobContext { attempt: 3, max_attempts: 3, cancellation: CancellationFlag::new() };
        assert!(ctx.is_final_attempt());
        let ctx = JobContext { attempt: 1, ..ctx };
        assert!(!ctx.is_final_attempt());
    }
}
