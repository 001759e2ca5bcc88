use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::guard::expiry_from_now;
use crate::store::{stale_cutoff, validate_swap};
use crate::{
    ClaimKey, ClaimResult, ClaimState, IdempotencyGuard, Result, SagaId, SagaInstance,
    SagaStateStore, SagaStatus, StepRecord, StoreError, Version,
};

/// Shared switch used to simulate an unreachable backend.
#[derive(Debug, Clone, Default)]
struct Availability(Arc<AtomicBool>);

impl Availability {
    fn set_unavailable(&self, unavailable: bool) {
        self.0.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self, backend: &str) -> Result<()> {
        if self.0.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{backend} is unreachable")));
        }
        Ok(())
    }
}

/// In-memory saga state store.
///
/// Provides the same interface as the PostgreSQL implementation. Cloning
/// shares the underlying map, so clones behave like separate connections to
/// one database.
#[derive(Debug, Clone, Default)]
pub struct InMemorySagaStore {
    instances: Arc<RwLock<HashMap<SagaId, SagaInstance>>>,
    availability: Availability,
}

impl InMemorySagaStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `StoreError::Unavailable`
    /// until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.availability.set_unavailable(unavailable);
    }

    /// Returns the number of stored instances.
    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Clears all instances.
    pub async fn clear(&self) {
        self.instances.write().await.clear();
    }
}

#[async_trait]
impl SagaStateStore for InMemorySagaStore {
    async fn create(&self, instance: &SagaInstance) -> Result<SagaInstance> {
        self.availability.check("saga store")?;
        let mut instances = self.instances.write().await;

        if instances.contains_key(&instance.id()) {
            return Err(StoreError::AlreadyExists(instance.id()));
        }

        let mut stored = instance.clone();
        stored.stamp(Version::first(), Utc::now());
        instances.insert(stored.id(), stored.clone());
        Ok(stored)
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        self.availability.check("saga store")?;
        Ok(self.instances.read().await.get(&saga_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        saga_id: SagaId,
        expected: Version,
        new_state: &SagaInstance,
    ) -> Result<SagaInstance> {
        self.availability.check("saga store")?;
        let mut instances = self.instances.write().await;

        let current = instances
            .get(&saga_id)
            .ok_or(StoreError::SagaNotFound(saga_id))?;

        if current.version() != expected {
            return Err(StoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual: current.version(),
            });
        }

        validate_swap(current, new_state).map_err(|e| StoreError::InvalidSwap {
            saga_id,
            reason: e.message,
        })?;

        let mut stored = new_state.clone();
        stored.stamp(expected.next(), Utc::now());
        instances.insert(saga_id, stored.clone());
        Ok(stored)
    }

    async fn find_stale(&self, older_than: Duration) -> Result<Vec<SagaId>> {
        self.availability.check("saga store")?;
        let cutoff = stale_cutoff(older_than);
        let instances = self.instances.read().await;

        let mut stale: Vec<_> = instances
            .values()
            .filter(|i| i.status().is_active() && i.updated_at() < cutoff)
            .map(|i| (i.updated_at(), i.id()))
            .collect();
        stale.sort();
        Ok(stale.into_iter().map(|(_, id)| id).collect())
    }

    async fn list_by_status(&self, status: SagaStatus) -> Result<Vec<SagaId>> {
        self.availability.check("saga store")?;
        let instances = self.instances.read().await;

        let mut matching: Vec<_> = instances
            .values()
            .filter(|i| i.status() == status)
            .map(|i| (i.updated_at(), i.id()))
            .collect();
        matching.sort();
        Ok(matching.into_iter().map(|(_, id)| id).collect())
    }
}

/// In-memory idempotency guard.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdempotencyGuard {
    claims: Arc<RwLock<HashMap<String, ClaimState>>>,
    acquired: Arc<AtomicUsize>,
    availability: Availability,
}

impl InMemoryIdempotencyGuard {
    /// Creates a new empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `StoreError::Unavailable`
    /// until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.availability.set_unavailable(unavailable);
    }

    /// Number of claims handed out as `Acquired` so far.
    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Returns the number of stored claims, expired or not.
    pub async fn claim_count(&self) -> usize {
        self.claims.read().await.len()
    }
}

#[async_trait]
impl IdempotencyGuard for InMemoryIdempotencyGuard {
    async fn try_claim(&self, key: &ClaimKey, ttl: Duration) -> Result<ClaimResult> {
        self.availability.check("idempotency guard")?;
        let now = Utc::now();
        let mut claims = self.claims.write().await;

        match claims.get(&key.storage_key()) {
            Some(state) if !state.is_expired(now) => match state {
                ClaimState::Pending { .. } => Ok(ClaimResult::Pending),
                ClaimState::Done { record, .. } => Ok(ClaimResult::Completed(record.clone())),
            },
            _ => {
                claims.insert(
                    key.storage_key(),
                    ClaimState::Pending {
                        expires_at: expiry_from_now(ttl),
                    },
                );
                self.acquired.fetch_add(1, Ordering::SeqCst);
                Ok(ClaimResult::Acquired)
            }
        }
    }

    async fn complete(
        &self,
        key: &ClaimKey,
        record: StepRecord,
        retention: Duration,
    ) -> Result<()> {
        self.availability.check("idempotency guard")?;
        self.claims.write().await.insert(
            key.storage_key(),
            ClaimState::Done {
                record,
                expires_at: expiry_from_now(retention),
            },
        );
        Ok(())
    }

    async fn lookup(&self, key: &ClaimKey) -> Result<Option<ClaimState>> {
        self.availability.check("idempotency guard")?;
        let now = Utc::now();
        Ok(self
            .claims
            .read()
            .await
            .get(&key.storage_key())
            .filter(|state| !state.is_expired(now))
            .cloned())
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.availability.check("idempotency guard")?;
        let now = Utc::now();
        let mut claims = self.claims.write().await;
        let before = claims.len();
        claims.retain(|_, state| !state.is_expired(now));
        Ok(before - claims.len())
    }
}
