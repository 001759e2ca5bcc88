//! The step contract.

use std::time::Duration;

use async_trait::async_trait;
use common::SagaId;
use saga_store::{SagaContext, StepPhase};
use thiserror::Error;

/// Default per-attempt timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default attempt budget per step and phase.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Error returned by a step's forward or compensating action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// May succeed if retried (timeouts, unavailable dependencies).
    #[error("transient: {0}")]
    Transient(String),

    /// Will not succeed on retry (validation, business rejection).
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        StepError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StepError::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StepError::Transient(m) | StepError::Permanent(m) => m,
        }
    }
}

/// Timeout and retry budget for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPolicy {
    /// Deadline for a single attempt. Exceeding it counts as a transient failure.
    pub timeout: Duration,
    /// Attempts allowed per phase before a transient failure becomes permanent.
    pub max_attempts: u32,
}

impl StepPolicy {
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            timeout,
            max_attempts,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_TIMEOUT, DEFAULT_MAX_ATTEMPTS)
    }
}

/// What a step knows about the attempt it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub step_name: String,
    pub step_index: usize,
    pub phase: StepPhase,
    /// 1-based attempt number. Also the epoch of the claim guarding this
    /// attempt.
    pub attempt: u32,
}

impl StepContext {
    /// Claim epoch of this attempt.
    pub fn epoch(&self) -> u32 {
        self.attempt
    }

    /// Key that stays the same across every attempt of this step.
    ///
    /// Steps pass it to downstream services so a retried call after a lost
    /// response does not apply the side effect twice.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.saga_id, self.step_name)
    }
}

/// One unit of work in a saga, with the action that undoes it.
///
/// `execute` may be called more than once for the same step (a retry after a
/// timeout, or a redelivered trigger whose claim expired), so it should be
/// idempotent with respect to [`StepContext::idempotency_key`]. `compensate`
/// must be idempotent and safe to call after a partial execution.
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique name within the saga definition.
    fn name(&self) -> &str;

    fn policy(&self) -> StepPolicy {
        StepPolicy::default()
    }

    /// Runs the forward action. The returned context is merged into the
    /// saga context.
    async fn execute(
        &self,
        step: &StepContext,
        context: &SagaContext,
    ) -> Result<SagaContext, StepError>;

    /// Undoes a completed forward action.
    async fn compensate(&self, step: &StepContext, context: &SagaContext) -> Result<(), StepError>;
}
