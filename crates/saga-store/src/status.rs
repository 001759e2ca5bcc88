//! Saga status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// The status of a saga instance in its lifecycle.
///
/// State transitions:
/// ```text
/// Running ──┬──► Completed
///           └──► Compensating ──┬──► Compensated
///                               └──► Failed
/// ```
///
/// `Failed` is the only status that needs an operator: a compensation
/// exhausted its retry budget and the saga's effects are partially undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Forward steps are being executed.
    #[default]
    Running,

    /// All steps completed successfully (terminal).
    Completed,

    /// A step failed and completed steps are being undone.
    Compensating,

    /// Every completed step was compensated (terminal).
    Compensated,

    /// A compensation failed irrecoverably (terminal).
    Failed,
}

impl SagaStatus {
    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns true for statuses the recovery sweeper picks up.
    pub fn is_active(&self) -> bool {
        matches!(self, SagaStatus::Running | SagaStatus::Compensating)
    }

    /// Returns the status name as stored and displayed.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
            SagaStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SagaStatus::Running),
            "completed" => Ok(SagaStatus::Completed),
            "compensating" => Ok(SagaStatus::Compensating),
            "compensated" => Ok(SagaStatus::Compensated),
            "failed" => Ok(SagaStatus::Failed),
            other => Err(StoreError::CorruptRecord(format!(
                "unknown saga status '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SagaStatus; 5] = [
        SagaStatus::Running,
        SagaStatus::Completed,
        SagaStatus::Compensating,
        SagaStatus::Compensated,
        SagaStatus::Failed,
    ];

    #[test]
    fn test_default_status_is_running() {
        assert_eq!(SagaStatus::default(), SagaStatus::Running);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
    }

    #[test]
    fn test_active_is_complement_of_terminal() {
        for status in ALL {
            assert_eq!(status.is_active(), !status.is_terminal(), "{status}");
        }
    }

    #[test]
    fn test_parse_matches_display() {
        for status in ALL {
            assert_eq!(status.to_string().parse::<SagaStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SagaStatus>().is_err());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&SagaStatus::Compensating).unwrap();
        assert_eq!(json, "\"compensating\"");
    }
}
