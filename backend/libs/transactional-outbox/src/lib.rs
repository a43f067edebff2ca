//! # Transactional outbox
//!
//! Turns local database commits into at-least-once, ordered, de-duplicated
//! event emission. A service writes its aggregate change and an outbox row
//! in one transaction; a background publisher leases committed rows, sends
//! them to the bus and deletes them after the broker acknowledges. A
//! crashed publisher simply lets its leases expire, the rows become
//! eligible again, and the consumer-side idempotency ledger absorbs the
//! duplicate delivery.
//!
//! The outbox table is range-partitioned by `created_on` (daily), so the
//! primary key is the composite `(id, created_on)`. Rows for one
//! `(tenant, saga)` always publish in non-decreasing `created_at` order;
//! across sagas the broker partitioner decides (the record key is pinned to
//! the saga id).
//!
//! ## Writing events
//!
//! ```rust,no_run
//! use transactional_outbox::{NewOutboxEvent, OutboxStore, SqlxOutboxStore};
//! use sqlx::PgPool;
//! use serde_json::json;
//! use uuid::Uuid;
//!
//! async fn reserve_stock(pool: &PgPool, store: &SqlxOutboxStore) -> anyhow::Result<()> {
//!     let saga_id = Uuid::now_v7();
//!     let mut tx = pool.begin().await?;
//!
//!     sqlx::query("UPDATE inventory_stock SET available = available - 2 WHERE sku = $1")
//!         .bind("A")
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     store
//!         .save_event(
//!             &mut tx,
//!             NewOutboxEvent::new("acme", saga_id, "reservation", "INVENTORY_RESERVED")
//!                 .payload(json!({"sku": "A", "qty": 2})),
//!         )
//!         .await?;
//!
//!     // Both the stock change and the event become visible atomically.
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Draining
//!
//! [`publisher::OutboxPublisher`] is the background loop; see its module
//! docs for the scheduling and retry model.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

mod error;
pub mod metrics;
pub mod publisher;

pub use error::{OutboxError, OutboxResult};
pub use publisher::{EventSink, KafkaEventSink, OutboxPublisher, PublisherConfig};

/// Composite primary key of an outbox row; the table is range-partitioned
/// by `created_on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutboxKey {
    pub id: i64,
    pub created_on: NaiveDate,
}

/// A committed event waiting in the outbox table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: i64,
    pub created_on: NaiveDate,
    pub tenant_id: String,
    pub saga_id: Uuid,
    /// Aggregate family the event belongs to (e.g. "order", "payment")
    pub aggregate_type: String,
    /// Domain id of the aggregate, when one exists at emission time
    pub aggregate_id: Option<String>,
    pub event_type: String,
    /// Explicit partition key override; `saga_id` when absent
    pub event_key: Option<String>,
    pub payload: serde_json::Value,
    /// Bus headers as a JSON object (`correlationId`, ...)
    pub headers: Option<serde_json::Value>,
    pub attempts: i32,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    pub fn key(&self) -> OutboxKey {
        OutboxKey {
            id: self.id,
            created_on: self.created_on,
        }
    }

    /// Partition key used on the bus.
    pub fn effective_key(&self) -> String {
        self.event_key
            .clone()
            .unwrap_or_else(|| self.saga_id.to_string())
    }

    /// A named header value, when headers were stored.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.as_ref()?.get(name)?.as_str()
    }
}

/// Event to be inserted; built by the writing service inside its own
/// transaction.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub tenant_id: String,
    pub saga_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Option<String>,
    pub event_type: String,
    pub event_key: Option<String>,
    pub payload: serde_json::Value,
    pub headers: Option<serde_json::Value>,
}

impl NewOutboxEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        saga_id: Uuid,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            saga_id,
            aggregate_type: aggregate_type.into(),
            aggregate_id: None,
            event_type: event_type.into(),
            event_key: None,
            payload: serde_json::Value::Null,
            headers: None,
        }
    }

    pub fn aggregate_id(mut self, id: impl Into<String>) -> Self {
        self.aggregate_id = Some(id.into());
        self
    }

    pub fn event_key(mut self, key: impl Into<String>) -> Self {
        self.event_key = Some(key.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn headers(mut self, headers: serde_json::Value) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Storage operations backing the outbox.
///
/// `save_event` runs in the caller's transaction; everything else uses the
/// store's own pool. Abstracted behind a trait so the publisher can be
/// exercised against an in-memory double.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert one row inside the caller's transaction. The row becomes
    /// visible to leasing only when that transaction commits.
    async fn save_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: NewOutboxEvent,
    ) -> OutboxResult<OutboxRecord>;

    /// Atomically lease up to `batch_size` eligible rows for one tenant.
    ///
    /// Eligible means unleased or lease-expired. Rows are claimed with
    /// `FOR UPDATE SKIP LOCKED`, so concurrent callers observe disjoint
    /// subsets; each claim bumps `attempts` and pushes `lease_until`
    /// forward. Returned rows are ordered by `created_at` ascending.
    async fn lease_batch(
        &self,
        tenant_id: &str,
        batch_size: i64,
        lease_duration: Duration,
    ) -> OutboxResult<Vec<OutboxRecord>>;

    /// Hard-delete rows after broker acknowledgment.
    async fn delete_by_keys(&self, keys: &[OutboxKey]) -> OutboxResult<u64>;

    /// Move a poisoned row to the dead-letter table.
    async fn quarantine(&self, key: OutboxKey, reason: &str) -> OutboxResult<()>;

    /// Tenants that currently have eligible rows.
    async fn active_tenants(&self, limit: i64) -> OutboxResult<Vec<String>>;

    /// Pending row count and oldest pending age in seconds, across tenants.
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// SQLx/PostgreSQL implementation of [`OutboxStore`].
pub struct SqlxOutboxStore {
    pool: PgPool,
}

impl SqlxOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Move quarantined rows for a tenant back into the outbox. Operational
    /// backfill after a broker outage; normal retries never need it.
    pub async fn requeue_dead_letters(&self, tenant_id: &str) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM outbox_dead_letters
                WHERE tenant_id = $1
                RETURNING tenant_id, saga_id, aggregate_type, aggregate_id,
                          event_type, event_key, payload, headers
            )
            INSERT INTO outbox (tenant_id, saga_id, aggregate_type, aggregate_id,
                                event_type, event_key, payload, headers)
            SELECT tenant_id, saga_id, aggregate_type, aggregate_id,
                   event_type, event_key, payload, headers
            FROM moved
            "#,
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxRecord, sqlx::Error> {
    Ok(OutboxRecord {
        id: row.try_get("id")?,
        created_on: row.try_get("created_on")?,
        tenant_id: row.try_get("tenant_id")?,
        saga_id: row.try_get("saga_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("event_type")?,
        event_key: row.try_get("event_key")?,
        payload: row.try_get("payload")?,
        headers: row.try_get("headers")?,
        attempts: row.try_get("attempts")?,
        lease_until: row.try_get("lease_until")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const RECORD_COLUMNS: &str = "id, created_on, tenant_id, saga_id, aggregate_type, aggregate_id, \
                              event_type, event_key, payload, headers, attempts, lease_until, \
                              created_at, updated_at";

#[async_trait]
impl OutboxStore for SqlxOutboxStore {
    async fn save_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: NewOutboxEvent,
    ) -> OutboxResult<OutboxRecord> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO outbox (tenant_id, saga_id, aggregate_type, aggregate_id,
                                event_type, event_key, payload, headers)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(&event.tenant_id)
        .bind(event.saga_id)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.event_key)
        .bind(&event.payload)
        .bind(&event.headers)
        .fetch_one(&mut **tx)
        .await?;

        let record = record_from_row(&row)?;

        debug!(
            tenant_id = %record.tenant_id,
            saga_id = %record.saga_id,
            event_type = %record.event_type,
            outbox_id = record.id,
            "Event written to outbox"
        );

        Ok(record)
    }

    async fn lease_batch(
        &self,
        tenant_id: &str,
        batch_size: i64,
        lease_duration: Duration,
    ) -> OutboxResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            WITH eligible AS (
                SELECT id, created_on
                FROM outbox
                WHERE tenant_id = $1
                  AND (lease_until IS NULL OR lease_until < NOW())
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox o
            SET lease_until = NOW() + make_interval(secs => $3),
                attempts = o.attempts + 1,
                updated_at = NOW()
            FROM eligible e
            WHERE o.id = e.id AND o.created_on = e.created_on
            RETURNING o.id, o.created_on, o.tenant_id, o.saga_id, o.aggregate_type,
                      o.aggregate_id, o.event_type, o.event_key, o.payload, o.headers,
                      o.attempts, o.lease_until, o.created_at, o.updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(batch_size)
        .bind(lease_duration.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // UPDATE ... RETURNING does not preserve the subquery order.
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        debug!(tenant_id, leased = records.len(), "Leased outbox batch");

        Ok(records)
    }

    async fn delete_by_keys(&self, keys: &[OutboxKey]) -> OutboxResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = keys.iter().map(|k| k.id).collect();
        let dates: Vec<NaiveDate> = keys.iter().map(|k| k.created_on).collect();

        let result = sqlx::query(
            r#"
            DELETE FROM outbox o
            USING UNNEST($1::bigint[], $2::date[]) AS k(id, created_on)
            WHERE o.id = k.id AND o.created_on = k.created_on
            "#,
        )
        .bind(&ids)
        .bind(&dates)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn quarantine(&self, key: OutboxKey, reason: &str) -> OutboxResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO outbox_dead_letters (outbox_id, tenant_id, saga_id, aggregate_type,
                                             aggregate_id, event_type, event_key, payload,
                                             headers, attempts, reason)
            SELECT id, tenant_id, saga_id, aggregate_type, aggregate_id,
                   event_type, event_key, payload, headers, attempts, $3
            FROM outbox
            WHERE id = $1 AND created_on = $2
            "#,
        )
        .bind(key.id)
        .bind(key.created_on)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM outbox WHERE id = $1 AND created_on = $2")
            .bind(key.id)
            .bind(key.created_on)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        warn!(outbox_id = key.id, reason, "Outbox row quarantined");

        Ok(())
    }

    async fn active_tenants(&self, limit: i64) -> OutboxResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT tenant_id
            FROM outbox
            WHERE lease_until IS NULL OR lease_until < NOW()
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| r.try_get("tenant_id"))
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*)::BIGINT AS pending,
                   COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = row.try_get("pending").unwrap_or(0);
        let age: i64 = row.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn effective_key_falls_back_to_saga_id() {
        let saga_id = Uuid::now_v7();
        let mut record = OutboxRecord {
            id: 1,
            created_on: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            tenant_id: "acme".to_string(),
            saga_id,
            aggregate_type: "order".to_string(),
            aggregate_id: None,
            event_type: "ORDER_CREATED".to_string(),
            event_key: None,
            payload: json!({}),
            headers: None,
            attempts: 0,
            lease_until: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(record.effective_key(), saga_id.to_string());

        record.event_key = Some("custom".to_string());
        assert_eq!(record.effective_key(), "custom");
    }

    #[test]
    fn header_lookup_reads_stored_json() {
        let record = OutboxRecord {
            id: 1,
            created_on: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            tenant_id: "acme".to_string(),
            saga_id: Uuid::now_v7(),
            aggregate_type: "order".to_string(),
            aggregate_id: Some("42".to_string()),
            event_type: "ORDER_CREATED".to_string(),
            event_key: None,
            payload: json!({}),
            headers: Some(json!({"correlationId": "corr-1"})),
            attempts: 0,
            lease_until: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(record.header("correlationId"), Some("corr-1"));
        assert_eq!(record.header("missing"), None);
    }

    #[test]
    fn builder_populates_optionals() {
        let saga_id = Uuid::now_v7();
        let event = NewOutboxEvent::new("acme", saga_id, "payment", "PAYMENT_AUTHORIZED")
            .aggregate_id("p-1")
            .event_key("k-1")
            .payload(json!({"amountMinor": 100}))
            .headers(json!({"correlationId": "c-1"}));

        assert_eq!(event.aggregate_id.as_deref(), Some("p-1"));
        assert_eq!(event.event_key.as_deref(), Some("k-1"));
        assert_eq!(event.payload["amountMinor"], 100);
        assert_eq!(event.headers.unwrap()["correlationId"], "c-1");
    }
}
