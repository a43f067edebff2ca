//! Stock and reservation repositories.
//!
//! Stock rows are locked FOR UPDATE for the whole reservation transaction:
//! two sagas competing for the last unit serialize on the row lock, and
//! only one reservation succeeds.

use chrono::{DateTime, Utc};
use event_schema::commands::OrderLine;
use saga_core::ReservationStatus;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ReservationRow {
    pub id: i64,
    pub tenant_id: String,
    pub saga_id: Uuid,
    pub order_id: i64,
    pub status: ReservationStatus,
    pub lines: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct InventoryRepository {
    pool: PgPool,
}

impl InventoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock each line's stock row and report whether every line is
    /// coverable. Missing SKUs count as insufficient.
    pub async fn check_and_lock(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        lines: &[OrderLine],
    ) -> Result<bool> {
        for line in lines {
            let row = sqlx::query(
                r#"
                SELECT available
                FROM inventory_stock
                WHERE tenant_id = $1 AND sku = $2
                FOR UPDATE
                "#,
            )
            .bind(tenant_id)
            .bind(&line.sku)
            .fetch_optional(&mut **tx)
            .await?;

            let available: i64 = match row {
                Some(row) => row.try_get("available")?,
                None => return Ok(false),
            };
            if available < i64::from(line.qty) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Move quantity from available to reserved. Caller holds the locks
    /// from [`Self::check_and_lock`].
    pub async fn reserve_stock(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        lines: &[OrderLine],
    ) -> Result<()> {
        for line in lines {
            sqlx::query(
                r#"
                UPDATE inventory_stock
                SET available = available - $3,
                    reserved = reserved + $3,
                    updated_at = NOW()
                WHERE tenant_id = $1 AND sku = $2
                "#,
            )
            .bind(tenant_id)
            .bind(&line.sku)
            .bind(i64::from(line.qty))
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Return reserved quantity to available stock.
    pub async fn release_stock(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        lines: &[OrderLine],
    ) -> Result<()> {
        for line in lines {
            sqlx::query(
                r#"
                UPDATE inventory_stock
                SET available = available + $3,
                    reserved = reserved - $3,
                    updated_at = NOW()
                WHERE tenant_id = $1 AND sku = $2
                "#,
            )
            .bind(tenant_id)
            .bind(&line.sku)
            .bind(i64::from(line.qty))
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    pub async fn insert_reservation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        saga_id: Uuid,
        order_id: i64,
        status: ReservationStatus,
        lines: &serde_json::Value,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO inventory_reservations (tenant_id, saga_id, order_id, status, lines)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(tenant_id)
        .bind(saga_id)
        .bind(order_id)
        .bind(status.as_i16())
        .bind(lines)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.try_get("id")?)
    }

    pub async fn find_reservation_for_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        saga_id: Uuid,
    ) -> Result<Option<ReservationRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, saga_id, order_id, status, lines, created_at, updated_at
            FROM inventory_reservations
            WHERE tenant_id = $1 AND saga_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(saga_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|row| {
            Ok(ReservationRow {
                id: row.try_get("id")?,
                tenant_id: row.try_get("tenant_id")?,
                saga_id: row.try_get("saga_id")?,
                order_id: row.try_get("order_id")?,
                status: ReservationStatus::from_i16(row.try_get("status")?)?,
                lines: row.try_get("lines")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    pub async fn set_reservation_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        reservation_id: i64,
        to: ReservationStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE inventory_reservations SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(reservation_id)
        .bind(to.as_i16())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
