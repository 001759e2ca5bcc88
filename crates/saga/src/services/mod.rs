//! External service traits and in-memory implementations used by the order
//! fulfillment saga.

pub mod inventory;
pub mod payment;
pub mod shipping;

use thiserror::Error;

use crate::step::StepError;

pub use inventory::{InMemoryInventoryService, InventoryService, ReservationItem, ReservationResult};
pub use payment::{InMemoryPaymentService, PaymentResult, PaymentService};
pub use shipping::{InMemoryShippingService, ShipmentResult, ShippingService};

/// Errors returned by business services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The service could not be reached or timed out. Safe to retry.
    #[error("{0} unavailable")]
    Unavailable(String),

    /// The service refused the request.
    #[error("{0}")]
    Rejected(String),
}

impl From<ServiceError> for StepError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(_) => StepError::Transient(err.to_string()),
            ServiceError::Rejected(_) => StepError::Permanent(err.to_string()),
        }
    }
}

/// Scripted failure behavior of an in-memory service operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    #[default]
    Never,
    /// Every call fails transiently.
    Transient,
    /// Every call is rejected.
    Permanent,
    /// The next `n` calls fail transiently, then calls succeed.
    TransientTimes(u32),
}

impl FailureMode {
    /// Applies the mode to one call, consuming a scripted failure if any.
    pub(crate) fn trip(&mut self, service: &str, rejection: &str) -> Result<(), ServiceError> {
        match *self {
            FailureMode::Never | FailureMode::TransientTimes(0) => Ok(()),
            FailureMode::Transient => Err(ServiceError::Unavailable(service.to_string())),
            FailureMode::Permanent => Err(ServiceError::Rejected(rejection.to_string())),
            FailureMode::TransientTimes(n) => {
                *self = FailureMode::TransientTimes(n - 1);
                Err(ServiceError::Unavailable(service.to_string()))
            }
        }
    }
}
