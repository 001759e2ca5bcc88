//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{FailureMode, ServiceError};

/// Result of a successful payment charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentResult {
    /// The payment ID assigned by the payment service.
    pub payment_id: String,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges a customer for an order. Repeating a call with the same
    /// idempotency key returns the original payment.
    async fn charge(
        &self,
        idempotency_key: &str,
        customer_id: &str,
        amount_cents: i64,
    ) -> Result<PaymentResult, ServiceError>;

    /// Refunds a payment. Refunding an unknown payment is a no-op.
    async fn refund(&self, payment_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, (String, i64)>,
    by_key: HashMap<String, String>,
    next_id: u32,
    charge_failure: FailureMode,
    refund_failure: FailureMode,
    charge_calls: u32,
    refund_calls: u32,
}

/// In-memory payment service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_charge_failure(&self, mode: FailureMode) {
        self.state.write().await.charge_failure = mode;
    }

    pub async fn set_refund_failure(&self, mode: FailureMode) {
        self.state.write().await.refund_failure = mode;
    }

    /// Returns the number of active payments.
    pub async fn payment_count(&self) -> usize {
        self.state.read().await.payments.len()
    }

    /// Returns true if a payment exists with the given ID.
    pub async fn has_payment(&self, payment_id: &str) -> bool {
        self.state.read().await.payments.contains_key(payment_id)
    }

    pub async fn charge_calls(&self) -> u32 {
        self.state.read().await.charge_calls
    }

    pub async fn refund_calls(&self) -> u32 {
        self.state.read().await.refund_calls
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(
        &self,
        idempotency_key: &str,
        customer_id: &str,
        amount_cents: i64,
    ) -> Result<PaymentResult, ServiceError> {
        let mut state = self.state.write().await;
        state.charge_calls += 1;
        state.charge_failure.trip("payment gateway", "payment declined")?;

        if amount_cents <= 0 {
            return Err(ServiceError::Rejected(format!(
                "invalid amount: {amount_cents}"
            )));
        }

        if let Some(existing) = state.by_key.get(idempotency_key) {
            return Ok(PaymentResult {
                payment_id: existing.clone(),
            });
        }

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state
            .payments
            .insert(payment_id.clone(), (customer_id.to_string(), amount_cents));
        state
            .by_key
            .insert(idempotency_key.to_string(), payment_id.clone());

        Ok(PaymentResult { payment_id })
    }

    async fn refund(&self, payment_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.write().await;
        state.refund_calls += 1;
        state.refund_failure.trip("payment gateway", "refund refused")?;
        state.payments.remove(payment_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_charge_and_refund() {
        let service = InMemoryPaymentService::new();

        let result = service.charge("k1", "CUST-1", 5000).await.unwrap();
        assert!(result.payment_id.starts_with("PAY-"));
        assert_eq!(service.payment_count().await, 1);
        assert!(service.has_payment(&result.payment_id).await);

        service.refund(&result.payment_id).await.unwrap();
        assert_eq!(service.payment_count().await, 0);
    }

    #[tokio::test]
    async fn test_fail_on_charge() {
        let service = InMemoryPaymentService::new();
        service.set_charge_failure(FailureMode::Permanent).await;

        let result = service.charge("k1", "CUST-1", 5000).await;
        assert_eq!(
            result,
            Err(ServiceError::Rejected("payment declined".into()))
        );
        assert_eq!(service.payment_count().await, 0);
        assert_eq!(service.charge_calls().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_amount_is_rejected() {
        let service = InMemoryPaymentService::new();
        let result = service.charge("k1", "CUST-1", 0).await;
        assert!(matches!(result, Err(ServiceError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_retried_charge_is_not_applied_twice() {
        let service = InMemoryPaymentService::new();

        let r1 = service.charge("k1", "CUST-1", 1000).await.unwrap();
        let r2 = service.charge("k1", "CUST-1", 1000).await.unwrap();
        let r3 = service.charge("k2", "CUST-1", 1000).await.unwrap();

        assert_eq!(r1.payment_id, "PAY-0001");
        assert_eq!(r2.payment_id, "PAY-0001");
        assert_eq!(r3.payment_id, "PAY-0002");
        assert_eq!(service.payment_count().await, 2);
    }
}
