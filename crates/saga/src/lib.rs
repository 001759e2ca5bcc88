//! Saga orchestration engine.
//!
//! A saga is an ordered list of steps, each with a forward action and a
//! compensating action. The [`SagaOrchestrator`] runs the forward actions in
//! order; when one fails for good, it runs the compensating actions of the
//! steps that completed, in reverse order.
//!
//! State lives in a [`SagaStateStore`](saga_store::SagaStateStore) and is only
//! ever written with compare-and-swap, and every step invocation is guarded
//! by an [`IdempotencyGuard`](saga_store::IdempotencyGuard) claim. Together
//! they let several drivers, including the [`RecoverySweeper`], work on the
//! same saga without running a step twice.
//!
//! The order fulfillment saga follows these steps:
//! 1. Reserve inventory
//! 2. Charge payment
//! 3. Create shipment

pub mod config;
pub mod coordinator;
pub mod definition;
pub mod error;
pub mod order_fulfillment;
pub mod retry;
pub mod services;
pub mod step;
pub mod sweeper;

pub use config::OrchestratorConfig;
pub use coordinator::SagaOrchestrator;
pub use definition::{SagaDefinition, SagaDefinitionBuilder, SagaRegistry};
pub use error::{Result, SagaError};
pub use order_fulfillment::OrderRequest;
pub use retry::BackoffPolicy;
pub use services::{
    FailureMode, InMemoryInventoryService, InMemoryPaymentService, InMemoryShippingService,
    InventoryService, PaymentResult, PaymentService, ReservationItem, ReservationResult,
    ServiceError, ShipmentResult, ShippingService,
};
pub use step::{Step, StepContext, StepError, StepPolicy};
pub use sweeper::{RecoverySweeper, SweepReport, SweeperConfig};
