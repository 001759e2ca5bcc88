//! Identifiers shared by the saga store, orchestrator and worker crates.

mod types;

pub use types::SagaId;
