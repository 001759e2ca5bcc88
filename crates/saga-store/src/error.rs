use thiserror::Error;

use crate::{SagaId, SagaStatus, Version};

/// Errors that can occur when interacting with the saga store or the
/// idempotency guard.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The expected version did not match the stored version.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// No saga instance exists with this ID.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// A saga instance with this ID has already been created.
    #[error("Saga already exists: {0}")]
    AlreadyExists(SagaId),

    /// The new state breaks an instance invariant (rewritten history,
    /// mutation after a terminal status, changed identity).
    #[error("Invalid swap for saga {saga_id}: {reason}")]
    InvalidSwap { saga_id: SagaId, reason: String },

    /// The backend could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be mapped back into the model.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true if the backend was unreachable and the operation can be
    /// retried later without any state having changed.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Returns true if a compare-and-swap lost against a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

/// Rejected state-machine transitions on a [`SagaInstance`](crate::SagaInstance).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The instance is not in a status that allows this action.
    #[error("Saga {saga_id} is {actual}, cannot {action}")]
    InvalidStatus {
        saga_id: SagaId,
        action: &'static str,
        actual: SagaStatus,
    },

    /// Compensation targeted a step whose forward action never completed.
    #[error("Saga {saga_id} has no completed step at index {step_index} to compensate")]
    NotCompleted { saga_id: SagaId, step_index: usize },

    /// The cursor would move past the end of the step sequence.
    #[error("Saga {saga_id} cursor {step_index} is out of range for {step_count} steps")]
    CursorOutOfRange {
        saga_id: SagaId,
        step_index: usize,
        step_count: usize,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
