use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::store::{stale_cutoff, validate_swap};
use crate::{
    ClaimKey, ClaimResult, ClaimState, HistoryEntry, IdempotencyGuard, Result, SagaContext,
    SagaId, SagaInstance, SagaStateStore, SagaStatus, StepRecord, StoreError, Version,
};

const INSTANCE_COLUMNS: &str = "id, saga_type, status, current_step_index, context, history, \
     version, failure_reason, cancel_requested, created_at, updated_at";

/// Converts connection-level failures into `StoreError::Unavailable` so
/// callers can tell "nothing happened" apart from a rejected write.
fn map_db_error(e: sqlx::Error) -> StoreError {
    let err = StoreError::Database(e);
    if err.is_unavailable() {
        StoreError::Unavailable(err.to_string())
    } else {
        err
    }
}

/// Longest lifetime written to `step_claims.expires_at`; keeps
/// `NOW() + interval` inside the timestamp range.
const MAX_CLAIM_LIFETIME: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Claim lifetime in seconds for `make_interval`. Expiry is computed
/// against the database clock, the same clock it is compared with.
fn lifetime_secs(ttl: Duration) -> f64 {
    ttl.min(MAX_CLAIM_LIFETIME).as_secs_f64()
}

fn to_i64(value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|_| StoreError::CorruptRecord(format!("{value} exceeds i64")))
}

/// PostgreSQL-backed saga state store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_instance(row: PgRow) -> Result<SagaInstance> {
        let status: String = row.try_get("status")?;
        let index: i64 = row.try_get("current_step_index")?;
        let context: serde_json::Value = row.try_get("context")?;
        let history: serde_json::Value = row.try_get("history")?;

        Ok(SagaInstance {
            id: SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_type: row.try_get("saga_type")?,
            status: status.parse()?,
            current_step_index: usize::try_from(index).map_err(|_| {
                StoreError::CorruptRecord(format!("negative step index {index}"))
            })?,
            context: serde_json::from_value::<SagaContext>(context)?,
            history: serde_json::from_value::<Vec<HistoryEntry>>(history)?,
            version: Version::new(row.try_get("version")?),
            failure_reason: row.try_get("failure_reason")?,
            cancel_requested: row.try_get("cancel_requested")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn ids_where(
        &self,
        sql: &str,
        status: &[&str],
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<SagaId>> {
        let status: Vec<String> = status.iter().map(|s| s.to_string()).collect();
        let mut query = sqlx::query_scalar::<_, Uuid>(sql).bind(status);
        if let Some(cutoff) = cutoff {
            query = query.bind(cutoff);
        }
        let ids = query.fetch_all(&self.pool).await.map_err(map_db_error)?;
        Ok(ids.into_iter().map(SagaId::from_uuid).collect())
    }
}

#[async_trait]
impl SagaStateStore for PostgresSagaStore {
    async fn create(&self, instance: &SagaInstance) -> Result<SagaInstance> {
        let mut stored = instance.clone();
        stored.stamp(Version::first(), Utc::now());

        let result = sqlx::query(
            r#"
            INSERT INTO saga_instances (id, saga_type, status, current_step_index, context, history,
                                        version, failure_reason, cancel_requested, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(stored.id.as_uuid())
        .bind(&stored.saga_type)
        .bind(stored.status.as_str())
        .bind(to_i64(stored.current_step_index)?)
        .bind(serde_json::to_value(&stored.context)?)
        .bind(serde_json::to_value(&stored.history)?)
        .bind(stored.version.as_i64())
        .bind(&stored.failure_reason)
        .bind(&stored.cancel_requested)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(stored.id));
        }
        Ok(stored)
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM saga_instances WHERE id = $1"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn compare_and_swap(
        &self,
        saga_id: SagaId,
        expected: Version,
        new_state: &SagaInstance,
    ) -> Result<SagaInstance> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        // Lock the row so validation and update see the same version
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM saga_instances WHERE id = $1 FOR UPDATE"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?
        .ok_or(StoreError::SagaNotFound(saga_id))?;
        let current = Self::row_to_instance(row)?;

        if current.version != expected {
            tracing::debug!(%saga_id, %expected, actual = %current.version, "compare-and-swap lost");
            return Err(StoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual: current.version,
            });
        }

        validate_swap(&current, new_state).map_err(|e| StoreError::InvalidSwap {
            saga_id,
            reason: e.message,
        })?;

        let mut stored = new_state.clone();
        stored.stamp(expected.next(), Utc::now());

        let result = sqlx::query(
            r#"
            UPDATE saga_instances
            SET status = $3, current_step_index = $4, context = $5, history = $6, version = $7,
                failure_reason = $8, cancel_requested = $9, updated_at = $10
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(expected.as_i64())
        .bind(stored.status.as_str())
        .bind(to_i64(stored.current_step_index)?)
        .bind(serde_json::to_value(&stored.context)?)
        .bind(serde_json::to_value(&stored.history)?)
        .bind(stored.version.as_i64())
        .bind(&stored.failure_reason)
        .bind(&stored.cancel_requested)
        .bind(stored.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual: current.version,
            });
        }

        tx.commit().await.map_err(map_db_error)?;
        Ok(stored)
    }

    async fn find_stale(&self, older_than: Duration) -> Result<Vec<SagaId>> {
        let active: Vec<&str> = [SagaStatus::Running, SagaStatus::Compensating]
            .iter()
            .map(|s| s.as_str())
            .collect();
        self.ids_where(
            r#"
            SELECT id FROM saga_instances
            WHERE status = ANY($1) AND updated_at < $2
            ORDER BY updated_at ASC
            "#,
            &active,
            Some(stale_cutoff(older_than)),
        )
        .await
    }

    async fn list_by_status(&self, status: SagaStatus) -> Result<Vec<SagaId>> {
        self.ids_where(
            r#"
            SELECT id FROM saga_instances
            WHERE status = ANY($1)
            ORDER BY updated_at ASC
            "#,
            &[status.as_str()],
            None,
        )
        .await
    }
}

/// PostgreSQL-backed idempotency guard.
///
/// Claims live in `step_claims`. Acquisition is a single upsert that only
/// overwrites an expired row, so two drivers racing on one key cannot both
/// acquire it.
#[derive(Clone)]
pub struct PostgresIdempotencyGuard {
    pool: PgPool,
}

impl PostgresIdempotencyGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_state(row: &PgRow) -> Result<ClaimState> {
        let state: String = row.try_get("state")?;
        let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
        match state.as_str() {
            "pending" => Ok(ClaimState::Pending { expires_at }),
            "done" => {
                let record: Option<serde_json::Value> = row.try_get("record")?;
                let record = record
                    .ok_or_else(|| StoreError::CorruptRecord("done claim without record".into()))?;
                Ok(ClaimState::Done {
                    record: serde_json::from_value::<StepRecord>(record)?,
                    expires_at,
                })
            }
            other => Err(StoreError::CorruptRecord(format!("unknown claim state: {other}"))),
        }
    }
}

#[async_trait]
impl IdempotencyGuard for PostgresIdempotencyGuard {
    async fn try_claim(&self, key: &ClaimKey, ttl: Duration) -> Result<ClaimResult> {
        let storage_key = key.storage_key();

        let acquired = sqlx::query(
            r#"
            INSERT INTO step_claims (claim_key, saga_id, state, record, expires_at, updated_at)
            VALUES ($1, $2, 'pending', NULL, NOW() + make_interval(secs => $3), NOW())
            ON CONFLICT (claim_key) DO UPDATE
                SET state = 'pending', record = NULL, expires_at = EXCLUDED.expires_at, updated_at = NOW()
                WHERE step_claims.expires_at <= NOW()
            RETURNING claim_key
            "#,
        )
        .bind(&storage_key)
        .bind(key.saga_id.as_uuid())
        .bind(lifetime_secs(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        if acquired.is_some() {
            return Ok(ClaimResult::Acquired);
        }

        // Someone else holds a live claim; report what it is
        let row = sqlx::query(
            "SELECT state, record, expires_at FROM step_claims WHERE claim_key = $1",
        )
        .bind(&storage_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        match row.as_ref().map(Self::row_to_state).transpose()? {
            Some(ClaimState::Done { record, .. }) => Ok(ClaimResult::Completed(record)),
            // Pending, or purged between the two statements
            _ => Ok(ClaimResult::Pending),
        }
    }

    async fn complete(
        &self,
        key: &ClaimKey,
        record: StepRecord,
        retention: Duration,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO step_claims (claim_key, saga_id, state, record, expires_at, updated_at)
            VALUES ($1, $2, 'done', $3, NOW() + make_interval(secs => $4), NOW())
            ON CONFLICT (claim_key) DO UPDATE
                SET state = 'done', record = EXCLUDED.record, expires_at = EXCLUDED.expires_at,
                    updated_at = NOW()
            "#,
        )
        .bind(key.storage_key())
        .bind(key.saga_id.as_uuid())
        .bind(serde_json::to_value(&record)?)
        .bind(lifetime_secs(retention))
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn lookup(&self, key: &ClaimKey) -> Result<Option<ClaimState>> {
        let row = sqlx::query(
            r#"
            SELECT state, record, expires_at FROM step_claims
            WHERE claim_key = $1 AND expires_at > NOW()
            "#,
        )
        .bind(key.storage_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        row.as_ref().map(Self::row_to_state).transpose()
    }

    async fn purge_expired(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM step_claims WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        let purged = usize::try_from(result.rows_affected()).unwrap_or(usize::MAX);
        if purged > 0 {
            tracing::debug!(purged, "purged expired step claims");
        }
        Ok(purged)
    }
}
