//! Idempotency guard contract.
//!
//! Before running a step, a driver claims the key
//! `(saga, phase, step, epoch)`. Only the driver holding an acquired claim may
//! run the step. When it finishes, the claim becomes a `done` marker carrying
//! the outcome, so a duplicate delivery reuses the outcome instead of running
//! the step again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, SagaContext, SagaId, StepPhase};

/// Identity of one step attempt.
///
/// The epoch is the attempt number derived from persisted history, so every
/// driver that loaded the same version of an instance computes the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimKey {
    pub saga_id: SagaId,
    pub phase: StepPhase,
    pub step_name: String,
    pub epoch: u32,
}

impl ClaimKey {
    pub fn new(saga_id: SagaId, phase: StepPhase, step_name: impl Into<String>, epoch: u32) -> Self {
        Self {
            saga_id,
            phase,
            step_name: step_name.into(),
            epoch,
        }
    }

    /// Flat string form used as the primary key by backends.
    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.saga_id, self.phase, self.step_name, self.epoch
        )
    }
}

impl std::fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Outcome of a step attempt as remembered by the guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StepRecord {
    /// The step succeeded; forward steps carry their context output.
    Succeeded(SagaContext),
    /// The step failed in a way that may succeed on retry.
    TransientFailure(String),
    /// The step failed for good.
    PermanentFailure(String),
    /// The saga was cancelled; the step was never run.
    Cancelled(String),
}

/// Result of [`IdempotencyGuard::try_claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
    /// The caller owns the attempt and must run the step.
    Acquired,
    /// Another driver owns the attempt and has not finished it.
    Pending,
    /// The attempt already ran; here is what happened.
    Completed(StepRecord),
}

/// Stored state of a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ClaimState {
    Pending {
        expires_at: DateTime<Utc>,
    },
    Done {
        record: StepRecord,
        expires_at: DateTime<Utc>,
    },
}

impl ClaimState {
    pub fn expires_at(&self) -> DateTime<Utc> {
        match self {
            ClaimState::Pending { expires_at } | ClaimState::Done { expires_at, .. } => *expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

/// Deduplicates step executions.
///
/// An unreachable backend surfaces as `StoreError::Unavailable`; callers must
/// treat that as "not claimed" and must not run the step.
#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    /// Claims an attempt for `ttl`.
    ///
    /// An expired claim (pending or done) is treated as absent and
    /// re-acquired.
    async fn try_claim(&self, key: &ClaimKey, ttl: Duration) -> Result<ClaimResult>;

    /// Turns the claim into a `done` marker kept for `retention`.
    async fn complete(&self, key: &ClaimKey, record: StepRecord, retention: Duration)
    -> Result<()>;

    /// Reads an unexpired claim without acquiring it.
    async fn lookup(&self, key: &ClaimKey) -> Result<Option<ClaimState>>;

    /// Drops expired claims, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize>;
}

/// Absolute expiry for a claim taken now.
pub fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
