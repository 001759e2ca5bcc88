//! Integration tests for the saga orchestration engine.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use saga::order_fulfillment::{
    self, OrderRequest, STEP_CHARGE_PAYMENT, STEP_CREATE_SHIPMENT, STEP_RESERVE_INVENTORY,
};
use saga::{
    BackoffPolicy, FailureMode, InMemoryInventoryService, InMemoryPaymentService,
    InMemoryShippingService, OrchestratorConfig, ReservationItem, SagaDefinition, SagaError,
    SagaOrchestrator, SagaRegistry, Step, StepContext, StepError, StepPolicy,
};
use saga_store::{
    ClaimKey, IdempotencyGuard, InMemoryIdempotencyGuard, InMemorySagaStore, SagaContext, SagaId,
    SagaInstance, SagaStateStore, SagaStatus, StepOutcome, StepPhase, StepRecord, StoreError,
    Version,
};
use tokio::sync::Notify;

/// Store wrapper that records the status of every successful write.
#[derive(Clone, Default)]
struct RecordingStore {
    inner: InMemorySagaStore,
    statuses: Arc<Mutex<Vec<SagaStatus>>>,
}

impl RecordingStore {
    /// Recorded statuses with consecutive duplicates removed.
    fn transitions(&self) -> Vec<SagaStatus> {
        let mut statuses = self.statuses.lock().unwrap().clone();
        statuses.dedup();
        statuses
    }
}

#[async_trait]
impl SagaStateStore for RecordingStore {
    async fn create(&self, instance: &SagaInstance) -> Result<SagaInstance, StoreError> {
        let stored = self.inner.create(instance).await?;
        self.statuses.lock().unwrap().push(stored.status());
        Ok(stored)
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaInstance>, StoreError> {
        self.inner.load(saga_id).await
    }

    async fn compare_and_swap(
        &self,
        saga_id: SagaId,
        expected: Version,
        new_state: &SagaInstance,
    ) -> Result<SagaInstance, StoreError> {
        let stored = self
            .inner
            .compare_and_swap(saga_id, expected, new_state)
            .await?;
        self.statuses.lock().unwrap().push(stored.status());
        Ok(stored)
    }

    async fn find_stale(&self, older_than: Duration) -> Result<Vec<SagaId>, StoreError> {
        self.inner.find_stale(older_than).await
    }

    async fn list_by_status(&self, status: SagaStatus) -> Result<Vec<SagaId>, StoreError> {
        self.inner.list_by_status(status).await
    }
}

type TestOrchestrator = SagaOrchestrator<RecordingStore, InMemoryIdempotencyGuard>;

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_backoff(BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)))
}

struct TestHarness {
    orchestrator: Arc<TestOrchestrator>,
    store: RecordingStore,
    guard: InMemoryIdempotencyGuard,
    inventory: InMemoryInventoryService,
    payment: InMemoryPaymentService,
    shipping: InMemoryShippingService,
}

impl TestHarness {
    fn new() -> Self {
        let store = RecordingStore::default();
        let guard = InMemoryIdempotencyGuard::new();
        let inventory = InMemoryInventoryService::new();
        let payment = InMemoryPaymentService::new();
        let shipping = InMemoryShippingService::new();

        let definition =
            order_fulfillment::definition(inventory.clone(), payment.clone(), shipping.clone())
                .unwrap();
        let orchestrator = SagaOrchestrator::new(
            store.clone(),
            guard.clone(),
            SagaRegistry::new().with(definition).unwrap(),
            test_config(),
        );

        Self {
            orchestrator: Arc::new(orchestrator),
            store,
            guard,
            inventory,
            payment,
            shipping,
        }
    }

    fn order(&self) -> SagaContext {
        OrderRequest {
            order_id: "ORD-1001".into(),
            customer_id: "CUST-42".into(),
            items: vec![
                ReservationItem::new("SKU-001", 2),
                ReservationItem::new("SKU-002", 1),
            ],
            amount_cents: 4500,
        }
        .into_context()
        .unwrap()
    }

    async fn run_order(&self) -> SagaInstance {
        let saga_id = self
            .orchestrator
            .start_saga(order_fulfillment::SAGA_TYPE, self.order())
            .await
            .unwrap();
        self.orchestrator
            .get_saga_status(saga_id)
            .await
            .unwrap()
            .unwrap()
    }
}

fn forward_summary(saga: &SagaInstance) -> Vec<(String, StepOutcome)> {
    saga.forward_history()
        .map(|e| (e.step_name.clone(), e.outcome))
        .collect()
}

#[tokio::test]
async fn test_happy_path_full_order_fulfillment() {
    let h = TestHarness::new();
    let saga = h.run_order().await;

    assert_eq!(saga.status(), SagaStatus::Completed);
    assert_eq!(saga.saga_type(), "OrderFulfillment");
    assert_eq!(saga.current_step_index(), 3);
    assert_eq!(
        saga.completed_steps(),
        [STEP_RESERVE_INVENTORY, STEP_CHARGE_PAYMENT, STEP_CREATE_SHIPMENT]
    );
    assert!(saga.compensated_steps().is_empty());
    assert_eq!(saga.version(), Version::new(4));

    // Context accumulated every step's output
    assert!(saga.context().get_str("reservation_id").is_some());
    assert!(saga.context().get_str("payment_id").is_some());
    assert!(saga.context().get_str("tracking_number").is_some());
    assert_eq!(saga.context().get_str("order_id"), Some("ORD-1001"));

    // No compensations invoked
    assert_eq!(h.inventory.release_calls().await, 0);
    assert_eq!(h.payment.refund_calls().await, 0);
    assert_eq!(h.shipping.cancel_calls().await, 0);
    assert_eq!(h.inventory.reservation_count().await, 1);
    assert_eq!(h.payment.payment_count().await, 1);
    assert_eq!(h.shipping.shipment_count().await, 1);

    assert_eq!(
        h.store.transitions(),
        [SagaStatus::Running, SagaStatus::Completed]
    );
}

#[tokio::test]
async fn test_payment_rejected_releases_inventory_only() {
    let h = TestHarness::new();
    h.payment.set_charge_failure(FailureMode::Permanent).await;

    let saga = h.run_order().await;

    assert_eq!(saga.status(), SagaStatus::Compensated);
    assert_eq!(
        forward_summary(&saga),
        [
            (STEP_RESERVE_INVENTORY.to_string(), StepOutcome::Completed),
            (STEP_CHARGE_PAYMENT.to_string(), StepOutcome::PermanentFailure),
        ]
    );
    assert_eq!(saga.compensated_steps(), [STEP_RESERVE_INVENTORY]);
    assert_eq!(saga.current_step_index(), 0);
    assert_eq!(
        saga.failure_reason(),
        Some("charge_payment failed: payment declined")
    );

    // Only the reservation was undone; shipping never ran
    assert_eq!(h.inventory.release_calls().await, 1);
    assert_eq!(h.payment.refund_calls().await, 0);
    assert_eq!(h.shipping.create_calls().await, 0);
    assert_eq!(h.shipping.cancel_calls().await, 0);
    assert_eq!(h.inventory.reservation_count().await, 0);

    assert_eq!(
        h.store.transitions(),
        [
            SagaStatus::Running,
            SagaStatus::Compensating,
            SagaStatus::Compensated
        ]
    );
}

#[tokio::test]
async fn test_shipping_failure_compensates_in_reverse_order() {
    let h = TestHarness::new();
    h.shipping.set_create_failure(FailureMode::Permanent).await;

    let saga = h.run_order().await;

    assert_eq!(saga.status(), SagaStatus::Compensated);
    assert_eq!(
        saga.compensated_steps(),
        [STEP_CHARGE_PAYMENT, STEP_RESERVE_INVENTORY]
    );
    assert_eq!(h.inventory.reservation_count().await, 0);
    assert_eq!(h.payment.payment_count().await, 0);
    assert_eq!(h.shipping.shipment_count().await, 0);
    assert_eq!(h.shipping.cancel_calls().await, 0);
}

#[tokio::test]
async fn test_inventory_failure_compensates_nothing() {
    let h = TestHarness::new();
    h.inventory.set_reserve_failure(FailureMode::Permanent).await;

    let saga = h.run_order().await;

    assert_eq!(saga.status(), SagaStatus::Compensated);
    assert!(saga.completed_steps().is_empty());
    assert!(saga.compensated_steps().is_empty());
    assert_eq!(h.inventory.release_calls().await, 0);
    assert_eq!(h.payment.charge_calls().await, 0);
}

#[tokio::test]
async fn test_always_transient_step_is_attempted_exactly_max_attempts_times() {
    let h = TestHarness::new();
    h.payment.set_charge_failure(FailureMode::Transient).await;

    let saga = h.run_order().await;

    assert_eq!(h.payment.charge_calls().await, 3);
    assert_eq!(saga.attempts(StepPhase::Forward, 1), 3);
    assert_eq!(saga.status(), SagaStatus::Compensated);

    let charge_attempts: Vec<_> = saga
        .forward_history()
        .filter(|e| e.step_name == STEP_CHARGE_PAYMENT)
        .map(|e| (e.attempt, e.outcome))
        .collect();
    assert_eq!(
        charge_attempts,
        [
            (1, StepOutcome::TransientFailure),
            (2, StepOutcome::TransientFailure),
            (3, StepOutcome::TransientFailure),
        ]
    );
    assert!(saga.failure_reason().unwrap().contains("after 3 attempts"));
    assert_eq!(saga.compensated_steps(), [STEP_RESERVE_INVENTORY]);
}

#[tokio::test]
async fn test_transient_failures_within_budget_recover() {
    let h = TestHarness::new();
    h.shipping
        .set_create_failure(FailureMode::TransientTimes(2))
        .await;

    let saga = h.run_order().await;

    assert_eq!(saga.status(), SagaStatus::Completed);
    assert_eq!(h.shipping.create_calls().await, 3);
    assert_eq!(h.shipping.shipment_count().await, 1);
}

#[tokio::test]
async fn test_compensation_failure_escalates_to_failed() {
    let h = TestHarness::new();
    h.payment.set_charge_failure(FailureMode::Permanent).await;
    h.inventory
        .set_release_failure(FailureMode::Transient)
        .await;

    let saga = h.run_order().await;

    assert_eq!(saga.status(), SagaStatus::Failed);
    assert_eq!(h.inventory.release_calls().await, 3);
    assert_eq!(saga.attempts(StepPhase::Compensation, 0), 3);
    assert!(
        saga.failure_reason()
            .unwrap()
            .starts_with("compensation of reserve_inventory failed after 3 attempts")
    );

    let failed = h.store.list_by_status(SagaStatus::Failed).await.unwrap();
    assert_eq!(failed, vec![saga.id()]);

    // Terminal: resuming changes nothing
    let resumed = h.orchestrator.resume_saga(saga.id()).await.unwrap();
    assert_eq!(resumed, saga);
}

#[tokio::test]
async fn test_permanent_compensation_error_escalates_immediately() {
    let h = TestHarness::new();
    h.shipping.set_create_failure(FailureMode::Permanent).await;
    h.payment.set_refund_failure(FailureMode::Permanent).await;

    let saga = h.run_order().await;

    assert_eq!(saga.status(), SagaStatus::Failed);
    assert_eq!(h.payment.refund_calls().await, 1);
    // Escalation stops compensation where it failed
    assert_eq!(h.inventory.release_calls().await, 0);
    assert_eq!(saga.current_step_index(), 2);
}

#[tokio::test]
async fn test_recorded_outcome_is_replayed_instead_of_executing() {
    let h = TestHarness::new();

    // A driver ran reserve_inventory and recorded the outcome on its claim,
    // then crashed before persisting the transition.
    let instance = SagaInstance::new(SagaId::new(), order_fulfillment::SAGA_TYPE, h.order());
    h.store.create(&instance).await.unwrap();
    let key = ClaimKey::new(instance.id(), StepPhase::Forward, STEP_RESERVE_INVENTORY, 1);
    h.guard
        .try_claim(&key, Duration::from_secs(30))
        .await
        .unwrap();
    h.guard
        .complete(
            &key,
            StepRecord::Succeeded(SagaContext::new().with("reservation_id", "RES-CRASHED")),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();

    let saga = h.orchestrator.resume_saga(instance.id()).await.unwrap();

    assert_eq!(saga.status(), SagaStatus::Completed);
    assert_eq!(h.inventory.reserve_calls().await, 0);
    assert_eq!(saga.context().get_str("reservation_id"), Some("RES-CRASHED"));
    assert_eq!(h.payment.charge_calls().await, 1);
}

#[tokio::test]
async fn test_duplicate_start_trigger_runs_saga_once() {
    let h = TestHarness::new();
    let saga_id = SagaId::from_trigger("orders/ORD-1001/placed");

    let first = h
        .orchestrator
        .start_saga_with_id(saga_id, order_fulfillment::SAGA_TYPE, h.order())
        .await
        .unwrap();
    let second = h
        .orchestrator
        .start_saga_with_id(
            SagaId::from_trigger("orders/ORD-1001/placed"),
            order_fulfillment::SAGA_TYPE,
            h.order(),
        )
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.store.inner.instance_count().await, 1);
    assert_eq!(h.inventory.reserve_calls().await, 1);
    assert_eq!(h.payment.charge_calls().await, 1);
    assert_eq!(h.shipping.create_calls().await, 1);
}

#[tokio::test]
async fn test_multiple_independent_sagas() {
    let h = TestHarness::new();

    let (a, b) = tokio::join!(h.run_order(), h.run_order());

    assert_ne!(a.id(), b.id());
    assert_eq!(a.status(), SagaStatus::Completed);
    assert_eq!(b.status(), SagaStatus::Completed);
    assert_eq!(h.inventory.reservation_count().await, 2);
    assert_eq!(h.payment.payment_count().await, 2);
    assert_eq!(h.shipping.shipment_count().await, 2);
}

#[tokio::test]
async fn test_get_saga_status_of_unknown_saga() {
    let h = TestHarness::new();
    let status = h.orchestrator.get_saga_status(SagaId::new()).await.unwrap();
    assert!(status.is_none());
}

// -- generic steps --

/// Step that counts calls and can be slowed down or held at a gate.
#[derive(Clone)]
struct Tracked {
    name: &'static str,
    executions: Arc<AtomicU32>,
    compensations: Arc<AtomicU32>,
    delay: Duration,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
    policy: StepPolicy,
}

impl Tracked {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            executions: Arc::default(),
            compensations: Arc::default(),
            delay: Duration::ZERO,
            gate: None,
            policy: StepPolicy::default(),
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    fn compensations(&self) -> u32 {
        self.compensations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step for Tracked {
    fn name(&self) -> &str {
        self.name
    }

    fn policy(&self) -> StepPolicy {
        self.policy
    }

    async fn execute(
        &self,
        _step: &StepContext,
        _context: &SagaContext,
    ) -> Result<SagaContext, StepError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        tokio::time::sleep(self.delay).await;
        Ok(SagaContext::new().with(self.name, "done"))
    }

    async fn compensate(
        &self,
        _step: &StepContext,
        _context: &SagaContext,
    ) -> Result<(), StepError> {
        self.compensations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn tracked_orchestrator(
    steps: &[Tracked],
) -> (
    Arc<SagaOrchestrator<InMemorySagaStore, InMemoryIdempotencyGuard>>,
    InMemorySagaStore,
) {
    let store = InMemorySagaStore::new();
    let mut builder = SagaDefinition::builder("Tracked");
    for step in steps {
        builder = builder.step(step.clone());
    }
    let orchestrator = SagaOrchestrator::new(
        store.clone(),
        InMemoryIdempotencyGuard::new(),
        SagaRegistry::new().with(builder.build().unwrap()).unwrap(),
        test_config(),
    );
    (Arc::new(orchestrator), store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_resumes_advance_each_step_once() {
    let steps = [
        Tracked::new("a").slow(Duration::from_millis(20)),
        Tracked::new("b").slow(Duration::from_millis(20)),
        Tracked::new("c").slow(Duration::from_millis(20)),
    ];
    let (orchestrator, store) = tracked_orchestrator(&steps);

    // Stalled instance nobody is driving
    let instance = SagaInstance::new(SagaId::new(), "Tracked", SagaContext::new());
    store.create(&instance).await.unwrap();
    let saga_id = instance.id();

    let first = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.resume_saga(saga_id).await }
    });
    let second = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.resume_saga(saga_id).await }
    });
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    // Whoever deferred returned early; make sure the saga is finished
    let saga = orchestrator.resume_saga(saga_id).await.unwrap();
    assert_eq!(saga.status(), SagaStatus::Completed);
    assert_eq!(saga.history().len(), 3);
    assert_eq!(saga.version(), Version::new(4));
    for step in &steps {
        assert_eq!(step.executions(), 1, "step {} ran more than once", step.name);
    }
}

#[tokio::test]
async fn test_three_step_saga_second_step_fails() {
    struct Failing;

    #[async_trait]
    impl Step for Failing {
        fn name(&self) -> &str {
            "second"
        }

        async fn execute(&self, _: &StepContext, _: &SagaContext) -> Result<SagaContext, StepError> {
            Err(StepError::permanent("boom"))
        }

        async fn compensate(&self, _: &StepContext, _: &SagaContext) -> Result<(), StepError> {
            panic!("a step that never completed must not be compensated");
        }
    }

    let first = Tracked::new("first");
    let third = Tracked::new("third");
    let store = InMemorySagaStore::new();
    let definition = SagaDefinition::builder("ThreeSteps")
        .step(first.clone())
        .step(Failing)
        .step(third.clone())
        .build()
        .unwrap();
    let orchestrator = SagaOrchestrator::new(
        store,
        InMemoryIdempotencyGuard::new(),
        SagaRegistry::new().with(definition).unwrap(),
        test_config(),
    );

    let id = orchestrator
        .start_saga("ThreeSteps", SagaContext::new())
        .await
        .unwrap();
    let saga = orchestrator.get_saga_status(id).await.unwrap().unwrap();

    assert_eq!(saga.status(), SagaStatus::Compensated);
    assert_eq!(first.compensations(), 1);
    assert_eq!(third.executions(), 0);
    assert_eq!(third.compensations(), 0);
}

#[tokio::test]
async fn test_step_timeout_counts_as_transient() {
    let mut slow = Tracked::new("slow").slow(Duration::from_secs(5));
    slow.policy = StepPolicy::new(Duration::from_millis(20), 2);
    let (orchestrator, _store) = tracked_orchestrator(std::slice::from_ref(&slow));

    let id = orchestrator
        .start_saga("Tracked", SagaContext::new())
        .await
        .unwrap();
    let saga = orchestrator.get_saga_status(id).await.unwrap().unwrap();

    assert_eq!(slow.executions(), 2);
    assert_eq!(saga.status(), SagaStatus::Compensated);
    let errors: Vec<_> = saga
        .history()
        .iter()
        .map(|e| (e.outcome, e.error.clone().unwrap_or_default()))
        .collect();
    assert!(errors
        .iter()
        .all(|(outcome, error)| *outcome == StepOutcome::TransientFailure
            && error.starts_with("timed out")));
}

#[tokio::test]
async fn test_cancel_before_any_step_runs() {
    let first = Tracked::new("first");
    let (orchestrator, store) = tracked_orchestrator(std::slice::from_ref(&first));
    let instance = SagaInstance::new(SagaId::new(), "Tracked", SagaContext::new());
    store.create(&instance).await.unwrap();

    let saga = orchestrator
        .cancel_saga(instance.id(), "customer changed their mind")
        .await
        .unwrap();

    assert_eq!(saga.status(), SagaStatus::Compensated);
    assert_eq!(first.executions(), 0);
    assert_eq!(saga.history().len(), 1);
    assert_eq!(saga.history()[0].outcome, StepOutcome::Cancelled);
    assert_eq!(saga.cancel_requested(), Some("customer changed their mind"));
    assert_eq!(
        saga.failure_reason(),
        Some("cancelled: customer changed their mind")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_lets_in_flight_step_finish_then_compensates() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let a = Tracked::new("a");
    let mut b = Tracked::new("b");
    b.gate = Some((started.clone(), release.clone()));
    let c = Tracked::new("c");
    let (orchestrator, _store) = tracked_orchestrator(&[a.clone(), b.clone(), c.clone()]);

    let saga_id = SagaId::new();
    let driver = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            orchestrator
                .start_saga_with_id(saga_id, "Tracked", SagaContext::new())
                .await
        }
    });

    // Step b is now in flight on the driver
    started.notified().await;
    let snapshot = orchestrator.cancel_saga(saga_id, "stop").await.unwrap();
    assert_eq!(snapshot.status(), SagaStatus::Running);
    assert_eq!(snapshot.cancel_requested(), Some("stop"));

    release.notify_one();
    driver.await.unwrap().unwrap();

    let saga = orchestrator.get_saga_status(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status(), SagaStatus::Compensated);
    assert_eq!(saga.completed_steps(), ["a", "b"]);
    assert_eq!(saga.compensated_steps(), ["b", "a"]);
    assert_eq!(c.executions(), 0);
    assert_eq!(b.executions(), 1);
    assert_eq!(
        saga.forward_history().last().map(|e| e.outcome),
        Some(StepOutcome::Cancelled)
    );
}

#[tokio::test]
async fn test_cancel_of_terminal_saga_is_rejected() {
    let (orchestrator, _store) = tracked_orchestrator(&[Tracked::new("a")]);
    let id = orchestrator
        .start_saga("Tracked", SagaContext::new())
        .await
        .unwrap();

    let result = orchestrator.cancel_saga(id, "too late").await;
    assert!(matches!(result, Err(SagaError::InvalidTransition(_))));
}
