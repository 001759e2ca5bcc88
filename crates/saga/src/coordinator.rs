//! Saga orchestrator: drives instances through their definition.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::SagaId;
use saga_store::{
    Attempt, ClaimKey, ClaimResult, IdempotencyGuard, SagaContext, SagaInstance, SagaStateStore,
    SagaStateStoreExt, SagaStatus, StepPhase, StepRecord, StoreError, TransitionError,
};

use crate::config::OrchestratorConfig;
use crate::definition::{SagaDefinition, SagaRegistry};
use crate::error::{Result, SagaError};
use crate::step::{Step, StepContext, StepError, StepPolicy};

/// What one orchestration step did.
enum Progress {
    /// A transition was persisted; keep driving.
    Persisted(SagaInstance),
    /// A transient failure was persisted; wait before the next attempt.
    RetryAfter(SagaInstance, Duration),
    /// Another driver holds the current step. Stop and leave it to them.
    Deferred,
}

/// Orchestrates saga instances.
///
/// Each call drives one instance until it reaches a terminal status, another
/// driver turns out to own the current step, or an infrastructure error stops
/// it. Every transition is written with compare-and-swap and every step
/// invocation is preceded by a claim on the idempotency guard, so any number
/// of orchestrators (and the recovery sweeper) can drive the same instance
/// concurrently without running a step twice or losing a transition.
pub struct SagaOrchestrator<S, G>
where
    S: SagaStateStore,
    G: IdempotencyGuard,
{
    store: S,
    guard: G,
    registry: Arc<SagaRegistry>,
    config: OrchestratorConfig,
}

impl<S, G> SagaOrchestrator<S, G>
where
    S: SagaStateStore,
    G: IdempotencyGuard,
{
    /// Creates a new orchestrator.
    pub fn new(store: S, guard: G, registry: SagaRegistry, config: OrchestratorConfig) -> Self {
        Self {
            store,
            guard,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn guard(&self) -> &G {
        &self.guard
    }

    pub fn registry(&self) -> &SagaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Starts a new saga of the given type and drives it.
    ///
    /// Returns the saga ID once the saga is terminal or another driver has
    /// taken over.
    pub async fn start_saga(&self, saga_type: &str, initial_context: SagaContext) -> Result<SagaId> {
        self.start_saga_with_id(SagaId::new(), saga_type, initial_context)
            .await
    }

    /// Starts a saga under a caller-chosen ID.
    ///
    /// Use with [`SagaId::from_trigger`] for at-least-once trigger transports:
    /// if the ID already exists the call resumes that instance instead of
    /// starting a second one.
    #[tracing::instrument(skip(self, initial_context))]
    pub async fn start_saga_with_id(
        &self,
        saga_id: SagaId,
        saga_type: &str,
        initial_context: SagaContext,
    ) -> Result<SagaId> {
        let definition = self.registry.get(saga_type)?;
        let instance = SagaInstance::new(saga_id, saga_type, initial_context);

        match self.store.create(&instance).await {
            Ok(created) => {
                metrics::counter!("saga_started_total", "saga_type" => saga_type.to_string())
                    .increment(1);
                tracing::info!(steps = definition.len(), "saga started");
                self.drive(&definition, created).await?;
            }
            Err(StoreError::AlreadyExists(_)) => {
                tracing::info!("duplicate start trigger, resuming existing saga");
                self.resume_saga(saga_id).await?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(saga_id)
    }

    /// Returns a consistent, versioned snapshot of a saga.
    pub async fn get_saga_status(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        Ok(self.store.load(saga_id).await?)
    }

    /// Reloads a saga and continues it from its persisted cursor.
    ///
    /// Idempotent: calling it on a terminal saga returns the saga unchanged,
    /// and calling it while another driver owns the current step returns the
    /// latest snapshot without doing anything.
    #[tracing::instrument(skip(self))]
    pub async fn resume_saga(&self, saga_id: SagaId) -> Result<SagaInstance> {
        let instance = self.store.load_required(saga_id).await?;
        if instance.is_terminal() {
            return Ok(instance);
        }
        let definition = self.registry.get(instance.saga_type())?;
        self.drive(&definition, instance).await
    }

    /// Requests cancellation of a running saga and drives it.
    ///
    /// The request is persisted first; the step at the cursor is then
    /// recorded as cancelled instead of being run, and everything completed
    /// before it is compensated. A step already in flight on another driver
    /// finishes and is compensated along with the rest. Cancelling a saga
    /// that is already compensating is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_saga(&self, saga_id: SagaId, reason: &str) -> Result<SagaInstance> {
        let mut conflicts = 0;
        let requested = loop {
            let instance = self.store.load_required(saga_id).await?;
            if instance.status() == SagaStatus::Compensating || instance.cancel_requested().is_some()
            {
                break instance;
            }

            let mut next = instance.clone();
            next.request_cancel(reason)?;
            match self.persist(&instance, next).await {
                Ok(stored) => break stored,
                Err(SagaError::ConcurrencyConflict { .. })
                    if conflicts < self.config.max_conflict_retries =>
                {
                    conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        };

        tracing::info!(reason, "saga cancellation requested");
        if requested.is_terminal() {
            return Ok(requested);
        }
        let definition = self.registry.get(requested.saga_type())?;
        self.drive(&definition, requested).await
    }

    async fn drive(
        &self,
        definition: &SagaDefinition,
        mut instance: SagaInstance,
    ) -> Result<SagaInstance> {
        let saga_id = instance.id();
        let mut conflicts = 0;

        loop {
            let progress = match instance.status() {
                SagaStatus::Running => self.advance(definition, &instance).await,
                SagaStatus::Compensating => self.rewind(definition, &instance).await,
                SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed => {
                    return Ok(instance);
                }
            };

            match progress {
                Ok(Progress::Persisted(next)) => instance = next,
                Ok(Progress::RetryAfter(next, delay)) => {
                    instance = next;
                    tokio::time::sleep(delay).await;
                }
                Ok(Progress::Deferred) => {
                    metrics::counter!("saga_deferred_total").increment(1);
                    tracing::debug!(%saga_id, "current step owned by another driver");
                    return Ok(self.store.load_required(saga_id).await?);
                }
                Err(SagaError::ConcurrencyConflict { .. })
                    if conflicts < self.config.max_conflict_retries =>
                {
                    conflicts += 1;
                    metrics::counter!("saga_cas_conflicts_total").increment(1);
                    tracing::debug!(%saga_id, conflicts, "lost compare-and-swap, reloading");
                    instance = self.store.load_required(saga_id).await?;
                }
                Err(e) => {
                    if matches!(e, SagaError::ConcurrencyConflict { .. }) {
                        metrics::counter!("saga_cas_conflicts_total").increment(1);
                    }
                    tracing::warn!(%saga_id, error = %e, "saga drive interrupted");
                    return Err(e);
                }
            }
        }
    }

    /// Runs (or replays) the forward action of the step at the cursor.
    async fn advance(
        &self,
        definition: &SagaDefinition,
        instance: &SagaInstance,
    ) -> Result<Progress> {
        let index = instance.current_step_index();
        let step = step_at(definition, instance, index)?;
        let policy = step.policy();
        let step_ctx = self.step_context(instance, step.as_ref(), index, StepPhase::Forward);
        let attempt = Attempt::new(step.name(), index, step_ctx.attempt);

        let record = match self.claim(&step_ctx, policy).await? {
            ClaimResult::Pending => return Ok(Progress::Deferred),
            ClaimResult::Completed(record) => {
                tracing::debug!(step = step.name(), attempt = step_ctx.attempt, "replaying recorded outcome");
                record
            }
            ClaimResult::Acquired => {
                let record = match instance.cancel_requested() {
                    Some(reason) => StepRecord::Cancelled(reason.to_string()),
                    None => run_forward(step.as_ref(), &step_ctx, instance.context(), policy).await,
                };
                self.remember(&step_ctx, &record).await;
                record
            }
        };
        count_attempt(&step_ctx, &record);

        let step_count = definition.len();
        let mut next = instance.clone();
        let mut delay = None;
        match record {
            StepRecord::Succeeded(output) => {
                tracing::info!(step = step.name(), attempt = step_ctx.attempt, "saga step completed");
                next.record_step_completed(attempt, output, step_count)?;
            }
            StepRecord::TransientFailure(error) => {
                next.record_step_failed(attempt, &error, true, step_count)?;
                if step_ctx.attempt >= policy.max_attempts {
                    tracing::warn!(step = step.name(), attempts = step_ctx.attempt, %error, "step attempts exhausted, compensating");
                    next.begin_compensation(format!(
                        "{} failed after {} attempts: {error}",
                        step.name(),
                        step_ctx.attempt
                    ))?;
                } else {
                    tracing::info!(step = step.name(), attempt = step_ctx.attempt, %error, "transient step failure, will retry");
                    delay = Some(self.retry_delay(step_ctx.attempt, policy));
                }
            }
            StepRecord::PermanentFailure(error) => {
                tracing::warn!(step = step.name(), %error, "step failed permanently, compensating");
                next.record_step_failed(attempt, &error, false, step_count)?;
                next.begin_compensation(format!("{} failed: {error}", step.name()))?;
            }
            StepRecord::Cancelled(_) => {
                tracing::info!(step = step.name(), "step cancelled, compensating");
                next.record_step_cancelled(attempt, step_count)?;
            }
        }

        let stored = self.persist(instance, next).await?;
        Ok(match delay {
            Some(delay) => Progress::RetryAfter(stored, delay),
            None => Progress::Persisted(stored),
        })
    }

    /// Runs (or replays) the compensating action of the last completed step
    /// that has not been undone yet, or finishes compensation.
    async fn rewind(
        &self,
        definition: &SagaDefinition,
        instance: &SagaInstance,
    ) -> Result<Progress> {
        let Some(index) = instance.compensation_target() else {
            let mut next = instance.clone();
            next.finish_compensation()?;
            return Ok(Progress::Persisted(self.persist(instance, next).await?));
        };

        let step = step_at(definition, instance, index)?;
        let policy = step.policy();
        let step_ctx = self.step_context(instance, step.as_ref(), index, StepPhase::Compensation);
        let attempt = Attempt::new(step.name(), index, step_ctx.attempt);

        let record = match self.claim(&step_ctx, policy).await? {
            ClaimResult::Pending => return Ok(Progress::Deferred),
            ClaimResult::Completed(record) => record,
            ClaimResult::Acquired => {
                let record =
                    run_compensation(step.as_ref(), &step_ctx, instance.context(), policy).await;
                self.remember(&step_ctx, &record).await;
                record
            }
        };
        count_attempt(&step_ctx, &record);

        let mut next = instance.clone();
        let mut delay = None;
        match record {
            StepRecord::Succeeded(_) => {
                tracing::info!(step = step.name(), "saga step compensated");
                next.record_compensation_succeeded(attempt)?;
            }
            StepRecord::TransientFailure(error) => {
                next.record_compensation_failed(attempt, &error)?;
                if step_ctx.attempt >= policy.max_attempts {
                    next.escalate(format!(
                        "compensation of {} failed after {} attempts: {error}",
                        step.name(),
                        step_ctx.attempt
                    ))?;
                } else {
                    tracing::info!(step = step.name(), attempt = step_ctx.attempt, %error, "transient compensation failure, will retry");
                    delay = Some(self.retry_delay(step_ctx.attempt, policy));
                }
            }
            StepRecord::PermanentFailure(error) => {
                next.record_compensation_failed(attempt, &error)?;
                next.escalate(format!("compensation of {} failed: {error}", step.name()))?;
            }
            StepRecord::Cancelled(_) => {
                return Err(SagaError::Store(StoreError::CorruptRecord(format!(
                    "cancellation recorded for compensation claim {}",
                    claim_key(&step_ctx)
                ))));
            }
        }

        let stored = self.persist(instance, next).await?;
        Ok(match delay {
            Some(delay) => Progress::RetryAfter(stored, delay),
            None => Progress::Persisted(stored),
        })
    }

    fn step_context(
        &self,
        instance: &SagaInstance,
        step: &dyn Step,
        index: usize,
        phase: StepPhase,
    ) -> StepContext {
        StepContext {
            saga_id: instance.id(),
            saga_type: instance.saga_type().to_string(),
            step_name: step.name().to_string(),
            step_index: index,
            phase,
            attempt: instance.next_attempt(phase, index),
        }
    }

    /// Backoff before the next attempt, never longer than the step timeout.
    fn retry_delay(&self, attempt: u32, policy: StepPolicy) -> Duration {
        self.config.backoff.delay_for(attempt).min(policy.timeout)
    }

    async fn claim(&self, step_ctx: &StepContext, policy: StepPolicy) -> Result<ClaimResult> {
        let ttl = self.config.claim_ttl_for(policy.timeout);
        Ok(self.guard.try_claim(&claim_key(step_ctx), ttl).await?)
    }

    /// Stores the outcome on the claim. A failure here only weakens
    /// deduplication for this attempt, so it is logged and the transition
    /// is still persisted.
    async fn remember(&self, step_ctx: &StepContext, record: &StepRecord) {
        let key = claim_key(step_ctx);
        if let Err(e) = self
            .guard
            .complete(&key, record.clone(), self.config.claim_retention)
            .await
        {
            tracing::warn!(claim = %key, error = %e, "failed to record step outcome on claim");
        }
    }

    async fn persist(&self, current: &SagaInstance, next: SagaInstance) -> Result<SagaInstance> {
        let stored = self
            .store
            .compare_and_swap(current.id(), current.version(), &next)
            .await?;
        if stored.is_terminal() && !current.is_terminal() {
            record_terminal(&stored);
        }
        Ok(stored)
    }
}

fn step_at<'a>(
    definition: &'a SagaDefinition,
    instance: &SagaInstance,
    index: usize,
) -> Result<&'a Arc<dyn Step>> {
    definition.step(index).ok_or_else(|| {
        SagaError::InvalidTransition(TransitionError::CursorOutOfRange {
            saga_id: instance.id(),
            step_index: index,
            step_count: definition.len(),
        })
    })
}

fn claim_key(step_ctx: &StepContext) -> ClaimKey {
    ClaimKey::new(
        step_ctx.saga_id,
        step_ctx.phase,
        step_ctx.step_name.clone(),
        step_ctx.epoch(),
    )
}

async fn run_forward(
    step: &dyn Step,
    step_ctx: &StepContext,
    context: &SagaContext,
    policy: StepPolicy,
) -> StepRecord {
    match tokio::time::timeout(policy.timeout, step.execute(step_ctx, context)).await {
        Ok(Ok(output)) => StepRecord::Succeeded(output),
        Ok(Err(e)) => failure_record(e),
        Err(_) => StepRecord::TransientFailure(format!("timed out after {:?}", policy.timeout)),
    }
}

async fn run_compensation(
    step: &dyn Step,
    step_ctx: &StepContext,
    context: &SagaContext,
    policy: StepPolicy,
) -> StepRecord {
    match tokio::time::timeout(policy.timeout, step.compensate(step_ctx, context)).await {
        Ok(Ok(())) => StepRecord::Succeeded(SagaContext::new()),
        Ok(Err(e)) => failure_record(e),
        Err(_) => StepRecord::TransientFailure(format!("timed out after {:?}", policy.timeout)),
    }
}

fn failure_record(error: StepError) -> StepRecord {
    match error {
        StepError::Transient(m) => StepRecord::TransientFailure(m),
        StepError::Permanent(m) => StepRecord::PermanentFailure(m),
    }
}

fn count_attempt(step_ctx: &StepContext, record: &StepRecord) {
    let outcome = match record {
        StepRecord::Succeeded(_) => "succeeded",
        StepRecord::TransientFailure(_) => "transient_failure",
        StepRecord::PermanentFailure(_) => "permanent_failure",
        StepRecord::Cancelled(_) => "cancelled",
    };
    metrics::counter!(
        "saga_step_attempts_total",
        "step" => step_ctx.step_name.clone(),
        "phase" => step_ctx.phase.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

fn record_terminal(instance: &SagaInstance) {
    let saga_id = instance.id();
    let duration = (Utc::now() - instance.created_at())
        .to_std()
        .unwrap_or_default()
        .as_secs_f64();
    metrics::histogram!("saga_duration_seconds").record(duration);

    match instance.status() {
        SagaStatus::Completed => {
            metrics::counter!("saga_completed").increment(1);
            tracing::info!(%saga_id, duration, "saga completed successfully");
        }
        SagaStatus::Compensated => {
            metrics::counter!("saga_compensated").increment(1);
            tracing::info!(
                %saga_id,
                duration,
                reason = instance.failure_reason().unwrap_or("unknown"),
                "saga compensated"
            );
        }
        SagaStatus::Failed => {
            metrics::counter!("saga_failed").increment(1);
            tracing::error!(
                %saga_id,
                reason = instance.failure_reason().unwrap_or("unknown"),
                "saga failed, manual intervention required"
            );
        }
        SagaStatus::Running | SagaStatus::Compensating => {}
    }
}
