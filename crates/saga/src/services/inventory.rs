//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{FailureMode, ServiceError};

/// Result of a successful inventory reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationResult {
    /// The reservation ID assigned by the inventory service.
    pub reservation_id: String,
}

/// An item to reserve in inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationItem {
    pub sku: String,
    pub quantity: u32,
}

impl ReservationItem {
    pub fn new(sku: impl Into<String>, quantity: u32) -> Self {
        Self {
            sku: sku.into(),
            quantity,
        }
    }
}

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for an order. Repeating a call with the same
    /// idempotency key returns the original reservation.
    async fn reserve(
        &self,
        idempotency_key: &str,
        order_id: &str,
        items: Vec<ReservationItem>,
    ) -> Result<ReservationResult, ServiceError>;

    /// Releases a reservation. Releasing an unknown reservation is a no-op.
    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    reservations: HashMap<String, (String, Vec<ReservationItem>)>,
    by_key: HashMap<String, String>,
    next_id: u32,
    reserve_failure: FailureMode,
    release_failure: FailureMode,
    reserve_calls: u32,
    release_calls: u32,
}

/// In-memory inventory service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_reserve_failure(&self, mode: FailureMode) {
        self.state.write().await.reserve_failure = mode;
    }

    pub async fn set_release_failure(&self, mode: FailureMode) {
        self.state.write().await.release_failure = mode;
    }

    /// Returns the number of active reservations.
    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.reservations.len()
    }

    /// Returns true if a reservation exists with the given ID.
    pub async fn has_reservation(&self, reservation_id: &str) -> bool {
        self.state
            .read()
            .await
            .reservations
            .contains_key(reservation_id)
    }

    pub async fn reserve_calls(&self) -> u32 {
        self.state.read().await.reserve_calls
    }

    pub async fn release_calls(&self) -> u32 {
        self.state.read().await.release_calls
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(
        &self,
        idempotency_key: &str,
        order_id: &str,
        items: Vec<ReservationItem>,
    ) -> Result<ReservationResult, ServiceError> {
        let mut state = self.state.write().await;
        state.reserve_calls += 1;
        state.reserve_failure.trip("inventory", "insufficient stock")?;

        if let Some(existing) = state.by_key.get(idempotency_key) {
            return Ok(ReservationResult {
                reservation_id: existing.clone(),
            });
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), (order_id.to_string(), items));
        state
            .by_key
            .insert(idempotency_key.to_string(), reservation_id.clone());

        Ok(ReservationResult { reservation_id })
    }

    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().await;
        state.release_calls += 1;
        state.release_failure.trip("inventory", "release refused")?;
        state.reservations.remove(reservation_id);
        Ok(())
    }
}
