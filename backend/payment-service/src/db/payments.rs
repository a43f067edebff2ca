//! Payment and capture repositories.

use chrono::{DateTime, Utc};
use saga_core::{CaptureStatus, PaymentStatus};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct PaymentRow {
    pub id: i64,
    pub tenant_id: String,
    pub saga_id: Uuid,
    pub order_id: i64,
    pub status: PaymentStatus,
    pub amount_minor: i64,
    pub currency_code: String,
    pub provider_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        saga_id: Uuid,
        order_id: i64,
        amount_minor: i64,
        currency_code: &str,
        status: PaymentStatus,
        provider_ref: Option<&str>,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO payments (tenant_id, saga_id, order_id, status, amount_minor,
                                  currency_code, provider_ref)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(tenant_id)
        .bind(saga_id)
        .bind(order_id)
        .bind(status.as_i16())
        .bind(amount_minor)
        .bind(currency_code)
        .bind(provider_ref)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Load the saga's payment with a row lock; the capture and void steps
    /// mutate it inside the same transaction.
    pub async fn find_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        saga_id: Uuid,
    ) -> Result<Option<PaymentRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, saga_id, order_id, status, amount_minor,
                   currency_code, provider_ref, created_at, updated_at
            FROM payments
            WHERE tenant_id = $1 AND saga_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(saga_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|row| {
            Ok(PaymentRow {
                id: row.try_get("id")?,
                tenant_id: row.try_get("tenant_id")?,
                saga_id: row.try_get("saga_id")?,
                order_id: row.try_get("order_id")?,
                status: PaymentStatus::from_i16(row.try_get("status")?)?,
                amount_minor: row.try_get("amount_minor")?,
                currency_code: row.try_get("currency_code")?,
                provider_ref: row.try_get("provider_ref")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    pub async fn set_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment_id: i64,
        to: PaymentStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE payments SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(payment_id)
            .bind(to.as_i16())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn insert_capture(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment_id: i64,
        amount_minor: i64,
        status: CaptureStatus,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO captures (payment_id, amount_minor, status)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(payment_id)
        .bind(amount_minor)
        .bind(status.as_i16())
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.try_get("id")?)
    }
}
