//! Orchestrator error types.

use thiserror::Error;

use crate::operation::OperationStatus;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Operation or registry entry does not exist.
    #[error("not found")]
    NotFound,

    /// Request-level validation failed (bad config, premature execute).
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested status change violates the operation state machine.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: OperationStatus,
        to: OperationStatus,
    },

    /// The supervisor exhausted its options to get a worker running.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The worker was reached but the call failed (HTTP error, timeout).
    #[error("worker transport error: {0}")]
    WorkerTransport(String),

    /// Persisting an operation state transition failed. Critical: the
    /// in-memory and stored views of the operation may now disagree.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => OrchestratorError::NotFound,
            other => OrchestratorError::Persistence(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
