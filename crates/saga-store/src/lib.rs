//! Durable saga state and step-claim storage.
//!
//! Two contracts live here:
//! - [`SagaStateStore`]: versioned saga instances mutated only through
//!   compare-and-swap, plus the stale-instance scan used for recovery.
//! - [`IdempotencyGuard`]: per-attempt claims that keep a step from running
//!   twice for the same `(saga, phase, step, epoch)` key.
//!
//! Both come with an in-memory backend (tests, single process) and a
//! PostgreSQL backend.

pub mod context;
pub mod error;
pub mod guard;
pub mod instance;
pub mod memory;
pub mod postgres;
pub mod status;
pub mod store;
pub mod version;

pub use common::SagaId;
pub use context::SagaContext;
pub use error::{Result, StoreError, TransitionError};
pub use guard::{ClaimKey, ClaimResult, ClaimState, IdempotencyGuard, StepRecord, expiry_from_now};
pub use instance::{Attempt, HistoryEntry, SagaInstance, StepOutcome, StepPhase};
pub use memory::{InMemoryIdempotencyGuard, InMemorySagaStore};
pub use postgres::{PostgresIdempotencyGuard, PostgresSagaStore};
pub use status::SagaStatus;
pub use store::{SagaStateStore, SagaStateStoreExt, SwapValidationError, stale_cutoff, validate_swap};
pub use version::Version;
