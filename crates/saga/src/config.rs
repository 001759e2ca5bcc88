//! Orchestrator settings.

use std::time::Duration;

use crate::retry::BackoffPolicy;

/// Tuning for [`SagaOrchestrator`](crate::SagaOrchestrator).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Backoff between attempts of the same step.
    pub backoff: BackoffPolicy,
    /// Minimum lifetime of a pending claim. The effective TTL is never
    /// shorter than twice the step timeout.
    pub claim_ttl: Duration,
    /// How long a finished claim keeps its outcome for duplicate deliveries.
    pub claim_retention: Duration,
    /// Compare-and-swap losses tolerated per drive before giving up.
    pub max_conflict_retries: u32,
}

impl OrchestratorConfig {
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn with_claim_retention(mut self, retention: Duration) -> Self {
        self.claim_retention = retention;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// TTL for a claim on a step with the given timeout.
    pub fn claim_ttl_for(&self, step_timeout: Duration) -> Duration {
        self.claim_ttl.max(step_timeout.saturating_mul(2))
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            claim_ttl: Duration::from_secs(60),
            claim_retention: Duration::from_secs(24 * 60 * 60),
            max_conflict_retries: 5,
        }
    }
}
