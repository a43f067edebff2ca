//! Inventory-side saga steps: reserve on `PAYMENT_AUTHORIZED`, release on
//! `PAYMENT_VOID`. A void that finds no live reservation is absorbed
//! without an emission (the decline happened before anything was
//! reserved).

use std::sync::Arc;

use async_trait::async_trait;
use bus_consumer::{ConsumerError, Disposition, EventHandler, InboundRecord};
use event_schema::{commands::OrderLine, headers, EventEnvelope, EventType};
use idempotent_consumer::{IdempotencyLedger, LedgerOutcome};
use saga_core::ReservationStatus;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use transactional_outbox::{NewOutboxEvent, OutboxStore};

use crate::db::inventory::InventoryRepository;
use crate::error::Result;

const INSUFFICIENT_STOCK: &str = "INSUFFICIENT_STOCK";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentAuthorizedPayload {
    order_id: i64,
    lines: Vec<OrderLine>,
}

pub struct SagaEventHandler<S: OutboxStore> {
    pool: PgPool,
    inventory: InventoryRepository,
    ledger: IdempotencyLedger,
    outbox: Arc<S>,
}

impl<S: OutboxStore> SagaEventHandler<S> {
    pub fn new(
        pool: PgPool,
        inventory: InventoryRepository,
        ledger: IdempotencyLedger,
        outbox: Arc<S>,
    ) -> Self {
        Self {
            pool,
            inventory,
            ledger,
            outbox,
        }
    }

    async fn apply(
        &self,
        envelope: &EventEnvelope,
        record: &InboundRecord,
    ) -> Result<Disposition> {
        match envelope.event_type {
            EventType::PaymentAuthorized => self.apply_reserve(envelope, record).await,
            EventType::PaymentVoid => self.apply_release(envelope, record).await,
            _ => {
                debug!(event_type = %envelope.event_type, "Event outside closed set, ignoring");
                Ok(Disposition::Discarded)
            }
        }
    }

    async fn apply_reserve(
        &self,
        envelope: &EventEnvelope,
        record: &InboundRecord,
    ) -> Result<Disposition> {
        let payload: PaymentAuthorizedPayload =
            match serde_json::from_value(envelope.payload.clone()) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(
                        saga_id = %envelope.saga_id,
                        error = %e,
                        "Malformed PAYMENT_AUTHORIZED payload, discarding"
                    );
                    return Ok(Disposition::Discarded);
                }
            };

        let mut tx = self.pool.begin().await?;
        let claim = self
            .ledger
            .begin_apply(
                &mut tx,
                &envelope.tenant_id,
                envelope.saga_id,
                envelope.event_type.as_str(),
                record.offset,
            )
            .await?;
        if claim == LedgerOutcome::Duplicate {
            tx.rollback().await?;
            return Ok(Disposition::Duplicate);
        }

        let coverable = self
            .inventory
            .check_and_lock(&mut tx, &envelope.tenant_id, &payload.lines)
            .await?;

        let lines_json = serde_json::to_value(&payload.lines)?;
        let out = if coverable {
            self.inventory
                .reserve_stock(&mut tx, &envelope.tenant_id, &payload.lines)
                .await?;
            let reservation_id = self
                .inventory
                .insert_reservation(
                    &mut tx,
                    &envelope.tenant_id,
                    envelope.saga_id,
                    payload.order_id,
                    ReservationStatus::Reserved,
                    &lines_json,
                )
                .await?;
            info!(
                saga_id = %envelope.saga_id,
                reservation_id,
                "Inventory reserved"
            );
            EventEnvelope::new(
                envelope.saga_id,
                EventType::InventoryReserved,
                envelope.tenant_id.clone(),
                json!({
                    "reservationId": reservation_id,
                    "orderId": payload.order_id,
                    "lines": payload.lines,
                }),
            )
        } else {
            let reservation_id = self
                .inventory
                .insert_reservation(
                    &mut tx,
                    &envelope.tenant_id,
                    envelope.saga_id,
                    payload.order_id,
                    ReservationStatus::Failed,
                    &lines_json,
                )
                .await?;
            info!(
                saga_id = %envelope.saga_id,
                reservation_id,
                "Insufficient stock, reservation failed"
            );
            EventEnvelope::new(
                envelope.saga_id,
                EventType::InventoryFailed,
                envelope.tenant_id.clone(),
                json!({"reservationId": reservation_id, "orderId": payload.order_id}),
            )
            .with_reason(INSUFFICIENT_STOCK)
        };

        self.emit(&mut tx, envelope, record, out).await?;
        tx.commit().await?;
        Ok(Disposition::Applied)
    }

    async fn apply_release(
        &self,
        envelope: &EventEnvelope,
        record: &InboundRecord,
    ) -> Result<Disposition> {
        let mut tx = self.pool.begin().await?;
        let claim = self
            .ledger
            .begin_apply(
                &mut tx,
                &envelope.tenant_id,
                envelope.saga_id,
                envelope.event_type.as_str(),
                record.offset,
            )
            .await?;
        if claim == LedgerOutcome::Duplicate {
            tx.rollback().await?;
            return Ok(Disposition::Duplicate);
        }

        let Some(reservation) = self
            .inventory
            .find_reservation_for_update(&mut tx, &envelope.tenant_id, envelope.saga_id)
            .await?
        else {
            // Void before any reservation existed (payment declined at
            // authorization, or inventory itself failed). Nothing to undo.
            debug!(saga_id = %envelope.saga_id, "Void without reservation, nothing to release");
            tx.commit().await?;
            return Ok(Disposition::Discarded);
        };
        if reservation.status != ReservationStatus::Reserved {
            debug!(
                saga_id = %envelope.saga_id,
                status = ?reservation.status,
                "Reservation not live, nothing to release"
            );
            tx.commit().await?;
            return Ok(Disposition::Discarded);
        }

        let lines: Vec<OrderLine> = serde_json::from_value(reservation.lines.clone())?;
        self.inventory
            .release_stock(&mut tx, &envelope.tenant_id, &lines)
            .await?;
        self.inventory
            .set_reservation_status(&mut tx, reservation.id, ReservationStatus::Released)
            .await?;

        let out = EventEnvelope::new(
            envelope.saga_id,
            EventType::InventoryRelease,
            envelope.tenant_id.clone(),
            json!({"reservationId": reservation.id, "orderId": reservation.order_id}),
        );
        self.emit(&mut tx, envelope, record, out).await?;
        tx.commit().await?;

        info!(
            saga_id = %envelope.saga_id,
            reservation_id = reservation.id,
            "Reservation released"
        );
        Ok(Disposition::Applied)
    }

    async fn emit(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        inbound: &EventEnvelope,
        record: &InboundRecord,
        out: EventEnvelope,
    ) -> Result<()> {
        let event_type = out.event_type;
        let outbox_record = self
            .outbox
            .save_event(
                tx,
                NewOutboxEvent::new(
                    &inbound.tenant_id,
                    inbound.saga_id,
                    "reservation",
                    event_type.as_str(),
                )
                .payload(serde_json::to_value(&out)?)
                .headers(correlation_headers(record)),
            )
            .await?;

        self.ledger
            .record_outcome(
                tx,
                &inbound.tenant_id,
                inbound.saga_id,
                inbound.event_type.as_str(),
                None,
                &format!("{}:{}", event_type.as_str(), outbox_record.id),
            )
            .await?;

        Ok(())
    }
}

#[async_trait]
impl<S: OutboxStore> EventHandler for SagaEventHandler<S> {
    async fn handle(&self, record: &InboundRecord) -> std::result::Result<Disposition, ConsumerError> {
        let envelope = match record.envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    offset = record.offset,
                    error = %e,
                    "Unparseable record, discarding"
                );
                return Ok(Disposition::Discarded);
            }
        };

        self.apply(&envelope, record).await.map_err(ConsumerError::from)
    }
}

fn correlation_headers(record: &InboundRecord) -> serde_json::Value {
    match record.header(headers::CORRELATION_ID) {
        Some(correlation_id) => json!({ headers::CORRELATION_ID: correlation_id }),
        None => json!({}),
    }
}
