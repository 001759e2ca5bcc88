use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Result, SagaId, SagaInstance, SagaStatus, StoreError, Version};

/// Core trait for saga state persistence.
///
/// Every mutation of an existing instance goes through
/// [`compare_and_swap`](SagaStateStore::compare_and_swap): a writer that read
/// version `n` can only store version `n + 1`, so two drivers racing on the
/// same instance never silently overwrite each other.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStateStore: Send + Sync {
    /// Stores a new instance at [`Version::first`].
    ///
    /// Fails with `AlreadyExists` if the ID is taken. Returns the stored
    /// snapshot with its assigned version and timestamps.
    async fn create(&self, instance: &SagaInstance) -> Result<SagaInstance>;

    /// Loads the latest snapshot of an instance.
    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaInstance>>;

    /// Replaces the stored instance if its version still equals `expected`.
    ///
    /// Fails with `ConcurrencyConflict` when another writer got there first,
    /// and with `InvalidSwap` when `new_state` is not a legal successor (see
    /// [`validate_swap`]). Returns the stored snapshot at the new version.
    async fn compare_and_swap(
        &self,
        saga_id: SagaId,
        expected: Version,
        new_state: &SagaInstance,
    ) -> Result<SagaInstance>;

    /// Lists running or compensating instances not updated within `older_than`.
    async fn find_stale(&self, older_than: Duration) -> Result<Vec<SagaId>>;

    /// Lists instances currently in `status`, oldest update first.
    async fn list_by_status(&self, status: SagaStatus) -> Result<Vec<SagaId>>;
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaStateStoreExt: SagaStateStore {
    /// Loads an instance, failing with `SagaNotFound` if it doesn't exist.
    async fn load_required(&self, saga_id: SagaId) -> Result<SagaInstance> {
        self.load(saga_id)
            .await?
            .ok_or(StoreError::SagaNotFound(saga_id))
    }
}

// Blanket implementation for all SagaStateStore implementations
impl<T: SagaStateStore + ?Sized> SagaStateStoreExt for T {}

/// Timestamp before which an active instance counts as stale.
pub fn stale_cutoff(older_than: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Error returned when a swap would break an instance invariant.
#[derive(Debug, Clone)]
pub struct SwapValidationError {
    pub message: String,
}

impl std::fmt::Display for SwapValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Swap validation error: {}", self.message)
    }
}

impl std::error::Error for SwapValidationError {}

fn reject(message: impl Into<String>) -> std::result::Result<(), SwapValidationError> {
    Err(SwapValidationError {
        message: message.into(),
    })
}

/// Validates that `next` is a legal successor of the stored `current` state.
///
/// Backends call this before writing so that a buggy or stale writer can't
/// rewrite history, drop context keys, or touch a finished saga.
pub fn validate_swap(
    current: &SagaInstance,
    next: &SagaInstance,
) -> std::result::Result<(), SwapValidationError> {
    if current.id != next.id || current.saga_type != next.saga_type {
        return reject("identity of a saga cannot change");
    }
    if current.is_terminal() {
        return reject(format!("saga is already {}", current.status));
    }

    // History is append-only
    if next.history.len() < current.history.len()
        || next.history[..current.history.len()] != current.history[..]
    {
        return reject("history entries cannot be rewritten or removed");
    }

    // Context never loses keys
    if let Some(missing) = current.context.keys().find(|k| !next.context.contains_key(k)) {
        return reject(format!("context key '{missing}' cannot be removed"));
    }

    // Allowed status moves and cursor direction
    match (current.status, next.status) {
        (SagaStatus::Running, SagaStatus::Running | SagaStatus::Completed) => {
            if next.current_step_index < current.current_step_index {
                return reject("cursor cannot move backwards while running");
            }
        }
        (SagaStatus::Running, SagaStatus::Compensating) => {}
        (
            SagaStatus::Compensating,
            SagaStatus::Compensating | SagaStatus::Compensated | SagaStatus::Failed,
        ) => {
            if next.current_step_index > current.current_step_index {
                return reject("cursor cannot move forwards while compensating");
            }
        }
        (from, to) => return reject(format!("illegal transition {from} -> {to}")),
    }

    Ok(())
}
