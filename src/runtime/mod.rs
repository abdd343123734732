/// Runtime Execution Engine
///
/// This module runs workflows. It handles:
/// - Ordering and validating a workflow's active steps
/// - Executing each step type (HTTP calls, transforms, conditions, webhooks)
/// - Data mapping between steps and checkpointing for retries
/// - The entry point that runs inline or hands executions to the queue

// Request validation, inline/queued dispatch and the queue handler
pub mod entry;

// Sequential step engine with fail-fast and checkpointing
pub mod engine;

// Scope document, JSONPath mapping and checkpoints
pub mod context;

// Execution and step error types
pub mod error;

// Individual step execution handlers
pub mod executor;

// Sandboxed Lua conditions and transforms
pub mod expression;

// Re-export main types
pub use engine::{plan, ExecutionResult, RunOptions, WorkflowExecutor};
pub use entry::{ExecutionResponse, ExecutionService, WorkflowExecutionHandler};
pub use error::{ExecutionError, StepError};
pub use executor::StepExecutor;
