/// apiflow: queue-backed execution engine for multi-step API automations
///
/// This library runs user-defined workflows (ordered API calls, transforms,
/// conditions and webhooks) either inline or through a durable job queue,
/// tracking every execution and its log in SQLite.

// Core configuration and setup
pub mod config;

// SQLite pool and schema shared by every store
pub mod database;

// Workflow management layer - definitions, connections, secrets and registry
pub mod workflow;

// Durable job queue - submission, workers, retries, health
pub mod queue;

// Execution records and their audit log
pub mod execution;

// Runtime execution engine - step execution and the execution entry point
pub mod runtime;

// HTTP API layer - REST endpoints over the engine
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use execution::{ExecutionStatus, WorkflowExecution};
pub use queue::QueueService;
pub use runtime::{ExecutionResponse, ExecutionResult, ExecutionService};
pub use server::{start_server, Services};
pub use workflow::{Workflow, WorkflowStep};
