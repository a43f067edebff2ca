//! # Idempotency ledger for saga event consumers
//!
//! Every consumer on the platform receives at-least-once delivery: the
//! outbox publisher re-sends after a crash, the broker re-delivers after a
//! rebalance, and the watchdog may race a late downstream answer. The
//! ledger turns all of that into exactly-once *effect* by inserting
//! `(tenant_id, saga_id, event_type)` into a per-service `processed_events`
//! table inside the same transaction as the state change. The unique
//! constraint makes reapplication a no-op; on conflict the consumer acks
//! the record without any additional effect.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use idempotent_consumer::{IdempotencyLedger, LedgerOutcome};
//! use sqlx::PgPool;
//! use std::time::Duration;
//! use uuid::Uuid;
//!
//! async fn apply_payment_authorized(
//!     pool: &PgPool,
//!     ledger: &IdempotencyLedger,
//!     tenant_id: &str,
//!     saga_id: Uuid,
//!     inbound_offset: i64,
//! ) -> anyhow::Result<()> {
//!     let mut tx = pool.begin().await?;
//!
//!     match ledger
//!         .begin_apply(&mut tx, tenant_id, saga_id, "PAYMENT_AUTHORIZED", inbound_offset)
//!         .await?
//!     {
//!         LedgerOutcome::Duplicate => {
//!             // Already applied; ack upstream, nothing to do.
//!             tx.rollback().await?;
//!             return Ok(());
//!         }
//!         LedgerOutcome::FirstApplication => {}
//!     }
//!
//!     // ... mutate the aggregate and write the outbox row in `tx` ...
//!     let outbound_event_id = Uuid::new_v4();
//!
//!     ledger
//!         .record_outcome(
//!             &mut tx,
//!             tenant_id,
//!             saga_id,
//!             "PAYMENT_AUTHORIZED",
//!             Some(outbound_event_id),
//!             "authorized",
//!         )
//!         .await?;
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
//!
//! The ledger row carries the `outbound_event_id` the application produced,
//! so an operator replaying a crashed publisher can match re-emissions to
//! their original effect. Retention is bounded: a periodic
//! [`IdempotencyLedger::cleanup_older_than`] sweep deletes rows past the
//! retention window (which must exceed the broker's maximum redelivery
//! horizon).

use anyhow::Context;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

mod error;

pub use error::{LedgerError, LedgerResult};

/// Outcome of attempting to claim an inbound event for application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// The claim row was inserted; the caller owns the application.
    FirstApplication,
    /// The `(tenant, saga, event_type)` key already exists; ack without
    /// effect.
    Duplicate,
}

/// Per-service idempotency ledger over the `processed_events` table.
///
/// Clone-cheap; share across tasks.
#[derive(Clone)]
pub struct IdempotencyLedger {
    pool: PgPool,
    retention: Duration,
}

impl IdempotencyLedger {
    pub fn new(pool: PgPool, retention: Duration) -> Self {
        Self { pool, retention }
    }

    /// Claim an inbound event inside the caller's transaction.
    ///
    /// Must run in the same transaction as the aggregate change and the
    /// outbox insert; that is what makes the duplicate check and the effect
    /// atomic. `inbound_offset` records the broker offset for diagnostics.
    pub async fn begin_apply(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        saga_id: Uuid,
        event_type: &str,
        inbound_offset: i64,
    ) -> LedgerResult<LedgerOutcome> {
        validate_key_part("tenant_id", tenant_id)?;
        validate_key_part("event_type", event_type)?;

        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (tenant_id, saga_id, event_type, inbound_offset)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, saga_id, event_type) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(saga_id)
        .bind(event_type)
        .bind(inbound_offset)
        .execute(&mut **tx)
        .await
        .context("Failed to claim inbound event in ledger")?;

        if result.rows_affected() > 0 {
            debug!(
                tenant_id = %tenant_id,
                saga_id = %saga_id,
                event_type = %event_type,
                inbound_offset,
                "Inbound event claimed"
            );
            Ok(LedgerOutcome::FirstApplication)
        } else {
            debug!(
                tenant_id = %tenant_id,
                saga_id = %saga_id,
                event_type = %event_type,
                "Inbound event already applied, skipping"
            );
            Ok(LedgerOutcome::Duplicate)
        }
    }

    /// Attach the produced outbound event and an outcome hash to the claim
    /// row, in the same transaction.
    pub async fn record_outcome(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        saga_id: Uuid,
        event_type: &str,
        outbound_event_id: Option<Uuid>,
        result_hash: &str,
    ) -> LedgerResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_events
            SET outbound_event_id = $4,
                result_hash = $5
            WHERE tenant_id = $1 AND saga_id = $2 AND event_type = $3
            "#,
        )
        .bind(tenant_id)
        .bind(saga_id)
        .bind(event_type)
        .bind(outbound_event_id)
        .bind(result_hash)
        .execute(&mut **tx)
        .await
        .context("Failed to record ledger outcome")?;

        Ok(())
    }

    /// Read-only duplicate check outside a transaction (diagnostics,
    /// tests). The authoritative check is [`Self::begin_apply`].
    pub async fn is_applied(
        &self,
        tenant_id: &str,
        saga_id: Uuid,
        event_type: &str,
    ) -> LedgerResult<bool> {
        let row: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_events
                WHERE tenant_id = $1 AND saga_id = $2 AND event_type = $3
            )
            "#,
        )
        .bind(tenant_id)
        .bind(saga_id)
        .bind(event_type)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check ledger")?;

        Ok(row.0)
    }

    /// Delete ledger rows past the retention window. Run periodically; the
    /// window must outlast the broker's redelivery horizon or duplicates
    /// re-apply.
    pub async fn cleanup_older_than(&self) -> LedgerResult<u64> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.retention)
                .map_err(|e| LedgerError::Other(anyhow::anyhow!("Invalid retention: {}", e)))?;

        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to clean up ledger")?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Cleaned up processed events");
        }
        Ok(deleted)
    }
}

fn validate_key_part(name: &'static str, value: &str) -> LedgerResult<()> {
    if value.is_empty() {
        return Err(LedgerError::InvalidKey(format!("{name} is empty")));
    }
    if value.len() > 255 {
        return Err(LedgerError::InvalidKey(format!(
            "{name} too long: {} characters (max 255)",
            value.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parts_are_validated() {
        assert!(validate_key_part("tenant_id", "acme").is_ok());
        assert!(validate_key_part("tenant_id", &"x".repeat(255)).is_ok());

        let err = validate_key_part("tenant_id", "").unwrap_err();
        assert!(matches!(err, LedgerError::InvalidKey(_)));

        let err = validate_key_part("event_type", &"x".repeat(256)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidKey(_)));
    }

    #[test]
    fn outcome_equality() {
        assert_eq!(LedgerOutcome::Duplicate, LedgerOutcome::Duplicate);
        assert_ne!(LedgerOutcome::FirstApplication, LedgerOutcome::Duplicate);
    }
}
