//! Shipment repository.

use chrono::{DateTime, Utc};
use saga_core::ShipmentStatus;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::Result;

#[derive(Clone)]
pub struct ShipmentRepository {
    pool: PgPool,
}

impl ShipmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: &str,
        saga_id: Uuid,
        order_id: i64,
        status: ShipmentStatus,
        scheduled_at: DateTime<Utc>,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO shipments (tenant_id, saga_id, order_id, status, scheduled_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(tenant_id)
        .bind(saga_id)
        .bind(order_id)
        .bind(status.as_i16())
        .bind(scheduled_at)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.try_get("id")?)
    }
}
