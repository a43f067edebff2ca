//! Order aggregate repository. Writes happen inside the consumer's
//! transaction so the status change and the outbox row commit together.

use chrono::{DateTime, Utc};
use event_schema::commands::OrderLine;
use saga_core::OrderStatus;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct OrderRow {
    pub id: i64,
    pub tenant_id: String,
    pub saga_id: Uuid,
    pub customer_id: String,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub currency_code: String,
    pub total_amount_minor: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrder<'a> {
    pub tenant_id: &'a str,
    pub saga_id: Uuid,
    pub customer_id: &'a str,
    pub user_id: Uuid,
    pub currency_code: &'a str,
    pub total_amount_minor: i64,
    pub lines: &'a [OrderLine],
}

#[derive(Clone)]
pub struct OrderRepository {
    pool: PgPool,
}

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the order and its lines. The order starts in
    /// `AWAITING_PAYMENT`: the creation event leaves in the same commit, so
    /// by the time anyone observes the row the payment step is underway.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: NewOrder<'_>,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO orders (tenant_id, saga_id, customer_id, user_id, status,
                                currency_code, total_amount_minor)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(order.tenant_id)
        .bind(order.saga_id)
        .bind(order.customer_id)
        .bind(order.user_id)
        .bind(OrderStatus::AwaitingPayment.as_i16())
        .bind(order.currency_code)
        .bind(order.total_amount_minor)
        .fetch_one(&mut **tx)
        .await?;

        let order_id: i64 = row.try_get("id")?;

        for line in order.lines {
            sqlx::query(
                r#"
                INSERT INTO order_lines (order_id, sku, qty, price_minor)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(order_id)
            .bind(&line.sku)
            .bind(line.qty as i32)
            .bind(line.price_minor().unwrap_or(0))
            .execute(&mut **tx)
            .await?;
        }

        Ok(order_id)
    }

    /// Conditionally advance the order status. Returns false when the order
    /// is missing or its current status is not in `allowed_from` (an
    /// out-of-order or duplicate event; callers discard it).
    pub async fn set_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        saga_id: Uuid,
        to: OrderStatus,
        allowed_from: &[OrderStatus],
    ) -> Result<bool> {
        let from: Vec<i16> = allowed_from.iter().map(|s| s.as_i16()).collect();
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3, updated_at = NOW()
            WHERE tenant_id = $1 AND saga_id = $2 AND status = ANY($4)
            "#,
        )
        .bind(tenant_id)
        .bind(saga_id)
        .bind(to.as_i16())
        .bind(&from)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_by_saga(
        &self,
        tenant_id: &str,
        saga_id: Uuid,
    ) -> Result<Option<OrderRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, saga_id, customer_id, user_id, status,
                   currency_code, total_amount_minor, created_at, updated_at
            FROM orders
            WHERE tenant_id = $1 AND saga_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(saga_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(OrderRow {
                id: row.try_get("id")?,
                tenant_id: row.try_get("tenant_id")?,
                saga_id: row.try_get("saga_id")?,
                customer_id: row.try_get("customer_id")?,
                user_id: row.try_get("user_id")?,
                status: OrderStatus::from_i16(row.try_get("status")?)?,
                currency_code: row.try_get("currency_code")?,
                total_amount_minor: row.try_get("total_amount_minor")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }
}
