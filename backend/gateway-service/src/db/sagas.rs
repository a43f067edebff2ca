//! Saga registry: the gateway owns the saga row from acceptance to
//! terminal state. Also holds the client idempotency keys for order
//! creation.

use chrono::{DateTime, Utc};
use saga_core::SagaState;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct SagaRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: Uuid,
    pub order_id: Option<i64>,
    pub state: SagaState,
    pub last_event_type: Option<String>,
    pub last_event_ts: DateTime<Utc>,
    /// Watchdog emissions for this saga
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn saga_from_row(row: &sqlx::postgres::PgRow) -> Result<SagaRow> {
    Ok(SagaRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        order_id: row.try_get("order_id")?,
        state: SagaState::from_i16(row.try_get("state")?)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
        last_event_type: row.try_get("last_event_type")?,
        last_event_ts: row.try_get("last_event_ts")?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const SAGA_COLUMNS: &str = "id, tenant_id, user_id, order_id, state, last_event_type, \
                            last_event_ts, attempts, created_at, updated_at";

#[derive(Clone)]
pub struct SagaRepository {
    pool: PgPool,
}

impl SagaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        saga_id: Uuid,
        tenant_id: &str,
        user_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sagas (id, tenant_id, user_id, state)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(saga_id)
        .bind(tenant_id)
        .bind(user_id)
        .bind(SagaState::Pending.as_i16())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn find(&self, saga_id: Uuid) -> Result<Option<SagaRow>> {
        let row = sqlx::query(&format!("SELECT {SAGA_COLUMNS} FROM sagas WHERE id = $1"))
            .bind(saga_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(saga_from_row).transpose()
    }

    pub async fn find_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        saga_id: Uuid,
    ) -> Result<Option<SagaRow>> {
        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM sagas WHERE id = $1 FOR UPDATE"
        ))
        .bind(saga_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.as_ref().map(saga_from_row).transpose()
    }

    /// Record an applied event: optionally move the state, always remember
    /// the event and its timestamp.
    pub async fn apply_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        saga_id: Uuid,
        new_state: Option<SagaState>,
        event_type: &str,
        event_ts: DateTime<Utc>,
        order_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sagas
            SET state = COALESCE($2, state),
                last_event_type = $3,
                last_event_ts = $4,
                order_id = COALESCE($5, order_id),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(saga_id)
        .bind(new_state.map(|s| s.as_i16()))
        .bind(event_type)
        .bind(event_ts)
        .bind(order_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Live sagas idle longer than the shortest budget; the watchdog
    /// re-checks each against its state's own budget.
    pub async fn stale_candidates(&self, limit: i64) -> Result<Vec<SagaRow>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAGA_COLUMNS}
            FROM sagas
            WHERE state NOT IN ($1, $2)
              AND last_event_ts < NOW() - INTERVAL '30 seconds'
            ORDER BY last_event_ts ASC
            LIMIT $3
            "#
        ))
        .bind(SagaState::Completed.as_i16())
        .bind(SagaState::Failed.as_i16())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(saga_from_row).collect()
    }

    /// Arm the next watchdog window. The optimistic guard on
    /// `last_event_ts` makes concurrent watchdogs emit at most once.
    pub async fn record_timeout(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        saga: &SagaRow,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET attempts = attempts + 1,
                last_event_ts = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND state = $2 AND last_event_ts = $3
            "#,
        )
        .bind(saga.id)
        .bind(saga.state.as_i16())
        .bind(saga.last_event_ts)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim a client idempotency key. Returns the already-registered saga
    /// when the key was seen before.
    pub async fn claim_create_key(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        key: &str,
        saga_id: Uuid,
    ) -> Result<Option<Uuid>> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO order_create_keys (tenant_id, idempotency_key, saga_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(key)
        .bind(saga_id)
        .execute(&mut **tx)
        .await?;

        if inserted.rows_affected() > 0 {
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            SELECT saga_id FROM order_create_keys
            WHERE tenant_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_one(&mut **tx)
        .await?;

        Ok(Some(row.try_get("saga_id")?))
    }

    /// Drop idempotency keys past the dedup window.
    pub async fn cleanup_create_keys(&self, window_secs: u64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM order_create_keys WHERE created_at < NOW() - make_interval(secs => $1)",
        )
        .bind(window_secs as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
