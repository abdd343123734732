/// Queue subsystem
///
/// Durable, at-least-once job dispatch: validated submission, bounded worker
/// pools, retry/expiry policy, cooperative cancellation and health reporting.

// Queue error taxonomy
pub mod error;

// Scheduled purge, expiry and health sweeps
pub mod maintenance;

// Masking of sensitive payload fields
pub mod redact;

// Queue service - submission, cancellation, worker registry
pub mod service;

// SQLite-backed job store
pub mod sqlite;

// Job store trait and in-memory store
pub mod store;

// Job, options and payload types
pub mod types;

// Worker pools and the job handler seam
pub mod worker;

pub use error::{QueueError, QueueResult};
pub use maintenance::QueueMaintenance;
pub use redact::Redact;
pub use service::{HealthLevel, HealthStatus, QueueService};
pub use sqlite::SqliteJobStore;
pub use store::{JobStore, MemoryJobStore};
pub use types::{
    CancellationFlag, JobContext, JobHandle, JobOptions, JobPayload, JobState, JobSubmission, QueueJob,
    WorkflowExecutionJob, WORKFLOW_EXECUTION_JOB, WORKFLOW_EXECUTION_QUEUE,
};
pub use worker::{handler_fn, FnHandler, JobHandler, WorkerOptions, WorkerSnapshot};
