/// Execution state
///
/// Lifecycle of `WorkflowExecution` records and their append-only logs.

// Status transitions and log appends
pub mod state;

// Execution persistence - SQLite and in-memory
pub mod store;

// Execution records, logs and status
pub mod types;

pub use state::ExecutionStateManager;
pub use store::{ExecutionStore, MemoryExecutionStore, SqliteExecutionStore};
pub use types::{ExecutionLog, ExecutionStatus, LogLevel, StateError, StateResult, WorkflowExecution};
