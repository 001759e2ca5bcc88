//! Saga instance model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SagaContext, SagaId, SagaStatus, TransitionError, Version};

/// Which action of a step an attempt ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Forward,
    Compensation,
}

impl StepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::Forward => "forward",
            StepPhase::Compensation => "compensation",
        }
    }
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a single recorded attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Forward action succeeded.
    Completed,
    /// Forward action failed but may be retried.
    TransientFailure,
    /// Forward action failed for good.
    PermanentFailure,
    /// The saga was cancelled before this step ran.
    Cancelled,
    /// Compensating action succeeded.
    Compensated,
    /// Compensating action failed.
    CompensationFailed,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Completed => "completed",
            StepOutcome::TransientFailure => "transient_failure",
            StepOutcome::PermanentFailure => "permanent_failure",
            StepOutcome::Cancelled => "cancelled",
            StepOutcome::Compensated => "compensated",
            StepOutcome::CompensationFailed => "compensation_failed",
        }
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of the append-only attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_name: String,
    pub step_index: usize,
    pub phase: StepPhase,
    /// 1-based attempt number within this step and phase.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An attempt about to be recorded: which step, which try, when it began.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub step_name: String,
    pub step_index: usize,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

impl Attempt {
    pub fn new(step_name: impl Into<String>, step_index: usize, attempt: u32) -> Self {
        Self {
            step_name: step_name.into(),
            step_index,
            attempt,
            started_at: Utc::now(),
        }
    }

    fn into_entry(self, phase: StepPhase, outcome: StepOutcome, error: Option<String>) -> HistoryEntry {
        HistoryEntry {
            step_name: self.step_name,
            step_index: self.step_index,
            phase,
            attempt: self.attempt,
            started_at: self.started_at,
            ended_at: Utc::now(),
            outcome,
            error,
        }
    }
}

/// One execution of a saga definition.
///
/// All mutation goes through the `record_*` / transition methods, which
/// enforce the lifecycle: the cursor only moves one step at a time, only
/// completed steps are compensated, history is append-only, and nothing
/// changes once the status is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub(crate) id: SagaId,
    pub(crate) saga_type: String,
    pub(crate) status: SagaStatus,
    pub(crate) current_step_index: usize,
    pub(crate) context: SagaContext,
    pub(crate) history: Vec<HistoryEntry>,
    pub(crate) version: Version,
    pub(crate) failure_reason: Option<String>,
    pub(crate) cancel_requested: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl SagaInstance {
    /// Creates a new, not yet stored, running instance.
    pub fn new(id: SagaId, saga_type: impl Into<String>, context: SagaContext) -> Self {
        let now = Utc::now();
        Self {
            id,
            saga_type: saga_type.into(),
            status: SagaStatus::Running,
            current_step_index: 0,
            context,
            history: Vec::new(),
            version: Version::initial(),
            failure_reason: None,
            cancel_requested: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies the version and timestamp assigned by the store.
    pub(crate) fn stamp(&mut self, version: Version, updated_at: DateTime<Utc>) {
        self.version = version;
        self.updated_at = updated_at;
    }

    fn ensure_status(&self, expected: SagaStatus, action: &'static str) -> Result<(), TransitionError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(TransitionError::InvalidStatus {
                saga_id: self.id,
                action,
                actual: self.status,
            })
        }
    }

    fn ensure_cursor(&self, step_index: usize, step_count: usize) -> Result<(), TransitionError> {
        if step_index != self.current_step_index || step_index >= step_count {
            return Err(TransitionError::CursorOutOfRange {
                saga_id: self.id,
                step_index,
                step_count,
            });
        }
        Ok(())
    }

    // -- forward --

    /// Records a successful forward attempt of the step at the cursor,
    /// merges its output and advances. Completes the saga after the last step.
    pub fn record_step_completed(
        &mut self,
        attempt: Attempt,
        output: SagaContext,
        step_count: usize,
    ) -> Result<(), TransitionError> {
        self.ensure_status(SagaStatus::Running, "complete a step")?;
        self.ensure_cursor(attempt.step_index, step_count)?;

        self.history
            .push(attempt.into_entry(StepPhase::Forward, StepOutcome::Completed, None));
        self.context.merge(output);
        self.current_step_index += 1;
        if self.current_step_index == step_count {
            self.status = SagaStatus::Completed;
        }
        Ok(())
    }

    /// Records a failed forward attempt of the step at the cursor.
    pub fn record_step_failed(
        &mut self,
        attempt: Attempt,
        error: impl Into<String>,
        transient: bool,
        step_count: usize,
    ) -> Result<(), TransitionError> {
        self.ensure_status(SagaStatus::Running, "record a step failure")?;
        self.ensure_cursor(attempt.step_index, step_count)?;

        let outcome = if transient {
            StepOutcome::TransientFailure
        } else {
            StepOutcome::PermanentFailure
        };
        self.history
            .push(attempt.into_entry(StepPhase::Forward, outcome, Some(error.into())));
        Ok(())
    }

    /// Records the cancellation of the step at the cursor and starts
    /// compensating everything completed before it.
    pub fn record_step_cancelled(
        &mut self,
        attempt: Attempt,
        step_count: usize,
    ) -> Result<(), TransitionError> {
        self.ensure_status(SagaStatus::Running, "cancel a step")?;
        self.ensure_cursor(attempt.step_index, step_count)?;

        let reason = format!(
            "cancelled: {}",
            self.cancel_requested.as_deref().unwrap_or("no reason given")
        );
        self.history.push(attempt.into_entry(
            StepPhase::Forward,
            StepOutcome::Cancelled,
            Some(reason.clone()),
        ));
        self.begin_compensation(reason)
    }

    /// Switches a running saga to compensation. The cursor stays on the
    /// failed step; compensation starts at the step before it.
    pub fn begin_compensation(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure_status(SagaStatus::Running, "begin compensation")?;
        self.status = SagaStatus::Compensating;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Marks the saga for cancellation. The driver turns the request into a
    /// failure at the next step boundary. Repeated requests are no-ops.
    pub fn request_cancel(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure_status(SagaStatus::Running, "cancel")?;
        if self.cancel_requested.is_none() {
            self.cancel_requested = Some(reason.into());
        }
        Ok(())
    }

    // -- compensation --

    /// Index of the next step to compensate, if any remain.
    pub fn compensation_target(&self) -> Option<usize> {
        if self.status == SagaStatus::Compensating && self.current_step_index > 0 {
            Some(self.current_step_index - 1)
        } else {
            None
        }
    }

    fn ensure_compensation_target(&self, step_index: usize) -> Result<(), TransitionError> {
        let completed = self.history.iter().any(|e| {
            e.phase == StepPhase::Forward
                && e.outcome == StepOutcome::Completed
                && e.step_index == step_index
        });
        if self.compensation_target() != Some(step_index) || !completed {
            return Err(TransitionError::NotCompleted {
                saga_id: self.id,
                step_index,
            });
        }
        Ok(())
    }

    /// Records a successful compensation and moves the cursor back one step.
    pub fn record_compensation_succeeded(&mut self, attempt: Attempt) -> Result<(), TransitionError> {
        self.ensure_status(SagaStatus::Compensating, "record a compensation")?;
        self.ensure_compensation_target(attempt.step_index)?;

        self.history.push(attempt.into_entry(
            StepPhase::Compensation,
            StepOutcome::Compensated,
            None,
        ));
        self.current_step_index -= 1;
        Ok(())
    }

    /// Records a failed compensation attempt.
    pub fn record_compensation_failed(
        &mut self,
        attempt: Attempt,
        error: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.ensure_status(SagaStatus::Compensating, "record a compensation failure")?;
        self.ensure_compensation_target(attempt.step_index)?;

        self.history.push(attempt.into_entry(
            StepPhase::Compensation,
            StepOutcome::CompensationFailed,
            Some(error.into()),
        ));
        Ok(())
    }

    /// Ends compensation once every completed step has been undone.
    pub fn finish_compensation(&mut self) -> Result<(), TransitionError> {
        self.ensure_status(SagaStatus::Compensating, "finish compensation")?;
        if self.current_step_index != 0 {
            return Err(TransitionError::CursorOutOfRange {
                saga_id: self.id,
                step_index: self.current_step_index,
                step_count: 0,
            });
        }
        self.status = SagaStatus::Compensated;
        Ok(())
    }

    /// Gives up on compensation. The saga needs manual intervention.
    pub fn escalate(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure_status(SagaStatus::Compensating, "escalate")?;
        self.status = SagaStatus::Failed;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}

// Query methods
impl SagaInstance {
    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn context(&self) -> &SagaContext {
        &self.context
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Reason the saga left the forward path, if it did.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Pending cancellation request, if any.
    pub fn cancel_requested(&self) -> Option<&str> {
        self.cancel_requested.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of attempts already recorded for a step in a phase.
    pub fn attempts(&self, phase: StepPhase, step_index: usize) -> u32 {
        let count = self
            .history
            .iter()
            .filter(|e| e.phase == phase && e.step_index == step_index)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Attempt number (and claim epoch) for the next try of a step.
    pub fn next_attempt(&self, phase: StepPhase, step_index: usize) -> u32 {
        self.attempts(phase, step_index).saturating_add(1)
    }

    /// Forward-phase entries in the order they were recorded.
    pub fn forward_history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter().filter(|e| e.phase == StepPhase::Forward)
    }

    /// Names of completed forward steps, in completion order.
    pub fn completed_steps(&self) -> Vec<&str> {
        self.history
            .iter()
            .filter(|e| e.phase == StepPhase::Forward && e.outcome == StepOutcome::Completed)
            .map(|e| e.step_name.as_str())
            .collect()
    }

    /// Names of compensated steps, in compensation order.
    pub fn compensated_steps(&self) -> Vec<&str> {
        self.history
            .iter()
            .filter(|e| e.outcome == StepOutcome::Compensated)
            .map(|e| e.step_name.as_str())
            .collect()
    }
}
