/// Error types for the queue subsystem
///
/// Validation and duplicate-submission errors are raised synchronously at the
/// submission boundary; backend errors wrap whatever the job store reported.

use thiserror::Error;

/// Error type for queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// Job fields failed validation; nothing reached the backend
    #[error("invalid job: {0}")]
    Validation(String),

    /// A job with the same dedup key is still outstanding
    #[error("duplicate submission: job key '{key}' is already in flight on queue '{queue}'")]
    DuplicateSubmission { queue: String, key: String },

    /// The service has not been started (or was stopped)
    #[error("queue service is not initialized")]
    NotInitialized,

    /// Job store / backend failure
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Backend(format!("payload serialization failed: {}", err))
    }
}

/// Result type for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;
