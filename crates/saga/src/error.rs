//! Saga error types.

use common::SagaId;
use saga_store::{StoreError, TransitionError, Version};
use thiserror::Error;

/// Errors that can occur during saga operations.
///
/// Step failures never show up here: the orchestrator classifies them and
/// records them in the instance history.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No definition is registered for this saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// No saga instance exists with this ID.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// Compare-and-swap kept losing against other drivers.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// The state store or idempotency guard could not be reached. Nothing
    /// was executed; the saga can be resumed later.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The requested action is not allowed in the saga's current status.
    #[error("Invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    /// A saga definition failed validation.
    #[error("Invalid saga definition '{saga_type}': {reason}")]
    InvalidDefinition { saga_type: String, reason: String },

    /// A definition with this saga type is already registered.
    #[error("Saga type already registered: {0}")]
    DuplicateDefinition(String),

    /// Any other store error.
    #[error("Store error: {0}")]
    Store(#[source] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if the operation can be retried later as is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SagaError::StoreUnavailable(_) | SagaError::ConcurrencyConflict { .. }
        )
    }
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        if err.is_unavailable() {
            return SagaError::StoreUnavailable(err.to_string());
        }
        match err {
            StoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual,
            } => SagaError::ConcurrencyConflict {
                saga_id,
                expected,
                actual,
            },
            StoreError::SagaNotFound(id) => SagaError::SagaNotFound(id),
            StoreError::Serialization(e) => SagaError::Serialization(e),
            other => SagaError::Store(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
