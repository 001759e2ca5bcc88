//! Order fulfillment saga: reserve inventory, charge payment, create shipment.
//!
//! Each step reads its input from the saga context and writes the ID it got
//! back from the service (`reservation_id`, `payment_id`,
//! `tracking_number`), which its compensation later uses.

use async_trait::async_trait;
use saga_store::SagaContext;
use serde::{Deserialize, Serialize};

use crate::definition::SagaDefinition;
use crate::error::Result;
use crate::services::{InventoryService, PaymentService, ReservationItem, ShippingService};
use crate::step::{Step, StepContext, StepError};

/// The saga type identifier for order fulfillment.
pub const SAGA_TYPE: &str = "OrderFulfillment";

/// Step name: Reserve inventory for the order.
pub const STEP_RESERVE_INVENTORY: &str = "reserve_inventory";

/// Step name: Charge the customer.
pub const STEP_CHARGE_PAYMENT: &str = "charge_payment";

/// Step name: Create shipment for the order.
pub const STEP_CREATE_SHIPMENT: &str = "create_shipment";

const RESERVATION_ID: &str = "reservation_id";
const PAYMENT_ID: &str = "payment_id";
const TRACKING_NUMBER: &str = "tracking_number";

/// Input of an order fulfillment saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<ReservationItem>,
    pub amount_cents: i64,
}

impl OrderRequest {
    /// Initial saga context for this order.
    pub fn into_context(self) -> Result<SagaContext> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(SagaContext::from(map)),
            _ => Ok(SagaContext::new()),
        }
    }
}

/// Builds the order fulfillment definition on top of the given services.
pub fn definition<I, P, Sh>(inventory: I, payment: P, shipping: Sh) -> Result<SagaDefinition>
where
    I: InventoryService + 'static,
    P: PaymentService + 'static,
    Sh: ShippingService + 'static,
{
    SagaDefinition::builder(SAGA_TYPE)
        .step(ReserveInventory { inventory })
        .step(ChargePayment { payment })
        .step(CreateShipment { shipping })
        .build()
}

fn required<T: serde::de::DeserializeOwned>(
    context: &SagaContext,
    key: &str,
) -> std::result::Result<T, StepError> {
    context
        .get_as::<T>(key)
        .map_err(|e| StepError::permanent(format!("invalid '{key}' in saga context: {e}")))?
        .ok_or_else(|| StepError::permanent(format!("missing '{key}' in saga context")))
}

/// Reserves stock for the order's items.
pub struct ReserveInventory<I> {
    inventory: I,
}

#[async_trait]
impl<I: InventoryService> Step for ReserveInventory<I> {
    fn name(&self) -> &str {
        STEP_RESERVE_INVENTORY
    }

    async fn execute(
        &self,
        step: &StepContext,
        context: &SagaContext,
    ) -> std::result::Result<SagaContext, StepError> {
        let order_id: String = required(context, "order_id")?;
        let items: Vec<ReservationItem> = required(context, "items")?;
        if items.is_empty() {
            return Err(StepError::permanent("order has no items"));
        }

        let result = self
            .inventory
            .reserve(&step.idempotency_key(), &order_id, items)
            .await?;
        Ok(SagaContext::new().with(RESERVATION_ID, result.reservation_id))
    }

    async fn compensate(
        &self,
        _step: &StepContext,
        context: &SagaContext,
    ) -> std::result::Result<(), StepError> {
        if let Some(reservation_id) = context.get_str(RESERVATION_ID) {
            self.inventory.release(reservation_id).await?;
        }
        Ok(())
    }
}

/// Charges the customer the order total.
pub struct ChargePayment<P> {
    payment: P,
}

#[async_trait]
impl<P: PaymentService> Step for ChargePayment<P> {
    fn name(&self) -> &str {
        STEP_CHARGE_PAYMENT
    }

    async fn execute(
        &self,
        step: &StepContext,
        context: &SagaContext,
    ) -> std::result::Result<SagaContext, StepError> {
        let customer_id: String = required(context, "customer_id")?;
        let amount_cents: i64 = required(context, "amount_cents")?;

        let result = self
            .payment
            .charge(&step.idempotency_key(), &customer_id, amount_cents)
            .await?;
        Ok(SagaContext::new().with(PAYMENT_ID, result.payment_id))
    }

    async fn compensate(
        &self,
        _step: &StepContext,
        context: &SagaContext,
    ) -> std::result::Result<(), StepError> {
        if let Some(payment_id) = context.get_str(PAYMENT_ID) {
            self.payment.refund(payment_id).await?;
        }
        Ok(())
    }
}

/// Books a shipment for the order.
pub struct CreateShipment<Sh> {
    shipping: Sh,
}

#[async_trait]
impl<Sh: ShippingService> Step for CreateShipment<Sh> {
    fn name(&self) -> &str {
        STEP_CREATE_SHIPMENT
    }

    async fn execute(
        &self,
        step: &StepContext,
        context: &SagaContext,
    ) -> std::result::Result<SagaContext, StepError> {
        let order_id: String = required(context, "order_id")?;

        let result = self
            .shipping
            .create_shipment(&step.idempotency_key(), &order_id)
            .await?;
        Ok(SagaContext::new().with(TRACKING_NUMBER, result.tracking_number))
    }

    async fn compensate(
        &self,
        _step: &StepContext,
        context: &SagaContext,
    ) -> std::result::Result<(), StepError> {
        if let Some(tracking_number) = context.get_str(TRACKING_NUMBER) {
            self.shipping.cancel_shipment(tracking_number).await?;
        }
        Ok(())
    }
}
