//! Shipping-side saga step: schedule dispatch on `PAYMENT_CAPTURED` and
//! close the saga with `ORDER_COMPLETED`. A capture event the scheduler
//! cannot act on (unusable payload) answers `ORDER_FAILED`; funds stay
//! captured, operators take it from the failed saga.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus_consumer::{ConsumerError, Disposition, EventHandler, InboundRecord};
use chrono::Utc;
use event_schema::{headers, reasons, EventEnvelope, EventType};
use idempotent_consumer::{IdempotencyLedger, LedgerOutcome};
use saga_core::ShipmentStatus;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use transactional_outbox::{NewOutboxEvent, OutboxStore};

use crate::db::shipments::ShipmentRepository;
use crate::error::Result;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentCapturedPayload {
    order_id: i64,
}

pub struct SagaEventHandler<S: OutboxStore> {
    pool: PgPool,
    shipments: ShipmentRepository,
    ledger: IdempotencyLedger,
    outbox: Arc<S>,
    dispatch_lead: Duration,
}

impl<S: OutboxStore> SagaEventHandler<S> {
    pub fn new(
        pool: PgPool,
        shipments: ShipmentRepository,
        ledger: IdempotencyLedger,
        outbox: Arc<S>,
        dispatch_lead: Duration,
    ) -> Self {
        Self {
            pool,
            shipments,
            ledger,
            outbox,
            dispatch_lead,
        }
    }

    async fn apply_schedule(
        &self,
        envelope: &EventEnvelope,
        record: &InboundRecord,
    ) -> Result<Disposition> {
        let payload: std::result::Result<PaymentCapturedPayload, _> =
            serde_json::from_value(envelope.payload.clone());

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

        let out = match payload {
            Ok(payload) => {
                let scheduled_at = Utc::now()
                    + chrono::Duration::from_std(self.dispatch_lead)
                        .unwrap_or_else(|_| chrono::Duration::hours(1));
                let shipment_id = self
                    .shipments
                    .insert(
                        &mut tx,
                        &envelope.tenant_id,
                        envelope.saga_id,
                        payload.order_id,
                        ShipmentStatus::Scheduled,
                        scheduled_at,
                    )
                    .await?;
                info!(
                    saga_id = %envelope.saga_id,
                    shipment_id,
                    scheduled_at = %scheduled_at,
                    "Shipment scheduled"
                );
                EventEnvelope::new(
                    envelope.saga_id,
                    EventType::OrderCompleted,
                    envelope.tenant_id.clone(),
                    json!({
                        "shipmentId": shipment_id,
                        "orderId": payload.order_id,
                        "scheduledAt": scheduled_at,
                    }),
                )
            }
            Err(e) => {
                warn!(
                    saga_id = %envelope.saga_id,
                    error = %e,
                    "Cannot schedule shipment from capture payload, failing the saga"
                );
                EventEnvelope::new(
                    envelope.saga_id,
                    EventType::OrderFailed,
                    envelope.tenant_id.clone(),
                    json!({}),
                )
                .with_reason(reasons::SHIPPING_FAILED)
            }
        };

        let event_type = out.event_type;
        let outbox_record = self
            .outbox
            .save_event(
                &mut tx,
                NewOutboxEvent::new(
                    &envelope.tenant_id,
                    envelope.saga_id,
                    "shipment",
                    event_type.as_str(),
                )
                .payload(serde_json::to_value(&out)?)
                .headers(correlation_headers(record)),
            )
            .await?;

        self.ledger
            .record_outcome(
                &mut tx,
                &envelope.tenant_id,
                envelope.saga_id,
                envelope.event_type.as_str(),
                None,
                &format!("{}:{}", event_type.as_str(), outbox_record.id),
            )
            .await?;

        tx.commit().await?;
        Ok(Disposition::Applied)
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

        match envelope.event_type {
            EventType::PaymentCaptured => self
                .apply_schedule(&envelope, record)
                .await
                .map_err(ConsumerError::from),
            _ => {
                debug!(event_type = %envelope.event_type, "Event outside closed set, ignoring");
                Ok(Disposition::Discarded)
            }
        }
    }
}

fn correlation_headers(record: &InboundRecord) -> serde_json::Value {
    match record.header(headers::CORRELATION_ID) {
        Some(correlation_id) => json!({ headers::CORRELATION_ID: correlation_id }),
        None => json!({}),
    }
}
