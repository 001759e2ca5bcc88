//! Shipping service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{FailureMode, ServiceError};

/// Result of a successful shipment creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipmentResult {
    /// The tracking number assigned by the shipping service.
    pub tracking_number: String,
}

/// Trait for shipping operations.
#[async_trait]
pub trait ShippingService: Send + Sync {
    /// Creates a shipment for an order. Repeating a call with the same
    /// idempotency key returns the original shipment.
    async fn create_shipment(
        &self,
        idempotency_key: &str,
        order_id: &str,
    ) -> Result<ShipmentResult, ServiceError>;

    /// Cancels a shipment. Cancelling an unknown shipment is a no-op.
    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryShippingState {
    shipments: HashMap<String, String>,
    by_key: HashMap<String, String>,
    next_id: u32,
    create_failure: FailureMode,
    cancel_failure: FailureMode,
    create_calls: u32,
    cancel_calls: u32,
}

/// In-memory shipping service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShippingService {
    state: Arc<RwLock<InMemoryShippingState>>,
}

impl InMemoryShippingService {
    /// Creates a new in-memory shipping service.
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_create_failure(&self, mode: FailureMode) {
        self.state.write().await.create_failure = mode;
    }

    pub async fn set_cancel_failure(&self, mode: FailureMode) {
        self.state.write().await.cancel_failure = mode;
    }

    /// Returns the number of active shipments.
    pub async fn shipment_count(&self) -> usize {
        self.state.read().await.shipments.len()
    }

    /// Returns true if a shipment exists with the given tracking number.
    pub async fn has_shipment(&self, tracking_number: &str) -> bool {
        self.state
            .read()
            .await
            .shipments
            .contains_key(tracking_number)
    }

    pub async fn create_calls(&self) -> u32 {
        self.state.read().await.create_calls
    }

    pub async fn cancel_calls(&self) -> u32 {
        self.state.read().await.cancel_calls
    }
}

#[async_trait]
impl ShippingService for InMemoryShippingService {
    async fn create_shipment(
        &self,
        idempotency_key: &str,
        order_id: &str,
    ) -> Result<ShipmentResult, ServiceError> {
        let mut state = self.state.write().await;
        state.create_calls += 1;
        state.create_failure.trip("shipping", "no carrier available")?;

        if let Some(existing) = state.by_key.get(idempotency_key) {
            return Ok(ShipmentResult {
                tracking_number: existing.clone(),
            });
        }

        state.next_id += 1;
        let tracking_number = format!("TRK-{:06}", state.next_id);
        state
            .shipments
            .insert(tracking_number.clone(), order_id.to_string());
        state
            .by_key
            .insert(idempotency_key.to_string(), tracking_number.clone());

        Ok(ShipmentResult { tracking_number })
    }

    async fn cancel_shipment(&self, tracking_number: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().await;
        state.cancel_calls += 1;
        state.cancel_failure.trip("shipping", "shipment already dispatched")?;
        state.shipments.remove(tracking_number);
        Ok(())
    }
}
