//! Payment-side saga steps: authorize on `ORDER_CREATED`, capture on
//! `INVENTORY_RESERVED`, void on `INVENTORY_FAILED` (and on a failed
//! capture). Each application is one transaction pairing the ledger claim,
//! the payment/capture rows and exactly one outbound event.

use std::sync::Arc;

use async_trait::async_trait;
use bus_consumer::{ConsumerError, Disposition, EventHandler, InboundRecord};
use event_schema::{headers, reasons, EventEnvelope, EventType};
use idempotent_consumer::{IdempotencyLedger, LedgerOutcome};
use saga_core::{CaptureStatus, PaymentStatus};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use transactional_outbox::{NewOutboxEvent, OutboxStore};

use crate::db::payments::PaymentRepository;
use crate::error::{PaymentError, Result};
use crate::provider::{AuthorizeRequest, PaymentProvider, ProviderDecision};

/// The slice of `ORDER_CREATED` this service needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreatedPayload {
    order_id: i64,
    total_amount_minor: i64,
    currency_code: String,
    #[serde(default)]
    lines: serde_json::Value,
}

pub struct SagaEventHandler<S: OutboxStore> {
    pool: PgPool,
    payments: PaymentRepository,
    ledger: IdempotencyLedger,
    outbox: Arc<S>,
    provider: Arc<dyn PaymentProvider>,
}

impl<S: OutboxStore> SagaEventHandler<S> {
    pub fn new(
        pool: PgPool,
        payments: PaymentRepository,
        ledger: IdempotencyLedger,
        outbox: Arc<S>,
        provider: Arc<dyn PaymentProvider>,
    ) -> Self {
        Self {
            pool,
            payments,
            ledger,
            outbox,
            provider,
        }
    }

    async fn apply(
        &self,
        envelope: &EventEnvelope,
        record: &InboundRecord,
    ) -> Result<Disposition> {
        match envelope.event_type {
            EventType::OrderCreated => self.apply_authorize(envelope, record).await,
            EventType::InventoryReserved => self.apply_capture(envelope, record).await,
            EventType::InventoryFailed => {
                self.apply_void(envelope, record, reasons::INVENTORY_FAILED)
                    .await
            }
            _ => {
                debug!(event_type = %envelope.event_type, "Event outside closed set, ignoring");
                Ok(Disposition::Discarded)
            }
        }
    }

    async fn apply_authorize(
        &self,
        envelope: &EventEnvelope,
        record: &InboundRecord,
    ) -> Result<Disposition> {
        let payload: OrderCreatedPayload = match serde_json::from_value(envelope.payload.clone())
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(saga_id = %envelope.saga_id, error = %e, "Malformed ORDER_CREATED payload");
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

        let decision = self
            .provider
            .authorize(&AuthorizeRequest {
                tenant_id: &envelope.tenant_id,
                saga_id: envelope.saga_id,
                order_id: payload.order_id,
                amount_minor: payload.total_amount_minor,
                currency_code: &payload.currency_code,
            })
            .await
            .map_err(PaymentError::Provider)?;

        let out = match &decision {
            ProviderDecision::Approved { provider_ref } => {
                let payment_id = self
                    .payments
                    .insert(
                        &mut tx,
                        &envelope.tenant_id,
                        envelope.saga_id,
                        payload.order_id,
                        payload.total_amount_minor,
                        &payload.currency_code,
                        PaymentStatus::Authorized,
                        Some(provider_ref),
                    )
                    .await?;
                info!(
                    saga_id = %envelope.saga_id,
                    payment_id,
                    amount_minor = payload.total_amount_minor,
                    "Payment authorized"
                );
                EventEnvelope::new(
                    envelope.saga_id,
                    EventType::PaymentAuthorized,
                    envelope.tenant_id.clone(),
                    json!({
                        "paymentId": payment_id,
                        "orderId": payload.order_id,
                        "amountMinor": payload.total_amount_minor,
                        "currencyCode": payload.currency_code,
                        "lines": payload.lines,
                    }),
                )
            }
            ProviderDecision::Declined { reason } => {
                let payment_id = self
                    .payments
                    .insert(
                        &mut tx,
                        &envelope.tenant_id,
                        envelope.saga_id,
                        payload.order_id,
                        payload.total_amount_minor,
                        &payload.currency_code,
                        PaymentStatus::Failed,
                        None,
                    )
                    .await?;
                info!(
                    saga_id = %envelope.saga_id,
                    payment_id,
                    reason = %reason,
                    "Payment declined"
                );
                EventEnvelope::new(
                    envelope.saga_id,
                    EventType::PaymentFailed,
                    envelope.tenant_id.clone(),
                    json!({"paymentId": payment_id, "orderId": payload.order_id}),
                )
                .with_reason(reason.clone())
            }
        };

        self.emit(&mut tx, envelope, record, out).await?;
        tx.commit().await?;
        Ok(Disposition::Applied)
    }

    async fn apply_capture(
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

        let Some(payment) = self
            .payments
            .find_for_update(&mut tx, &envelope.tenant_id, envelope.saga_id)
            .await?
        else {
            warn!(saga_id = %envelope.saga_id, "Reservation without a payment, discarding");
            tx.commit().await?;
            return Ok(Disposition::Discarded);
        };
        if payment.status != PaymentStatus::Authorized {
            warn!(
                saga_id = %envelope.saga_id,
                status = ?payment.status,
                "Capture requested in illegal payment status, discarding"
            );
            tx.commit().await?;
            return Ok(Disposition::Discarded);
        }

        let provider_ref = payment.provider_ref.clone().unwrap_or_default();
        let decision = self
            .provider
            .capture(&provider_ref, payment.amount_minor)
            .await
            .map_err(PaymentError::Provider)?;

        let out = match decision {
            ProviderDecision::Approved { .. } => {
                self.payments
                    .insert_capture(&mut tx, payment.id, payment.amount_minor, CaptureStatus::Succeeded)
                    .await?;
                self.payments
                    .set_status(&mut tx, payment.id, PaymentStatus::Captured)
                    .await?;
                info!(saga_id = %envelope.saga_id, payment_id = payment.id, "Payment captured");
                EventEnvelope::new(
                    envelope.saga_id,
                    EventType::PaymentCaptured,
                    envelope.tenant_id.clone(),
                    json!({
                        "paymentId": payment.id,
                        "orderId": payment.order_id,
                        "amountMinor": payment.amount_minor,
                    }),
                )
            }
            ProviderDecision::Declined { reason } => {
                // Capture failed: void our own authorization and let the
                // void fan the compensation out.
                self.payments
                    .insert_capture(&mut tx, payment.id, payment.amount_minor, CaptureStatus::Failed)
                    .await?;
                self.provider
                    .void(&provider_ref)
                    .await
                    .map_err(PaymentError::Provider)?;
                self.payments
                    .set_status(&mut tx, payment.id, PaymentStatus::Void)
                    .await?;
                warn!(
                    saga_id = %envelope.saga_id,
                    payment_id = payment.id,
                    reason = %reason,
                    "Capture declined, authorization voided"
                );
                EventEnvelope::new(
                    envelope.saga_id,
                    EventType::PaymentVoid,
                    envelope.tenant_id.clone(),
                    json!({"paymentId": payment.id, "orderId": payment.order_id}),
                )
                .with_reason(reasons::CAPTURE_FAILED)
            }
        };

        self.emit(&mut tx, envelope, record, out).await?;
        tx.commit().await?;
        Ok(Disposition::Applied)
    }

    async fn apply_void(
        &self,
        envelope: &EventEnvelope,
        record: &InboundRecord,
        reason: &str,
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

        let Some(payment) = self
            .payments
            .find_for_update(&mut tx, &envelope.tenant_id, envelope.saga_id)
            .await?
        else {
            warn!(saga_id = %envelope.saga_id, "Void for unknown payment, discarding");
            tx.commit().await?;
            return Ok(Disposition::Discarded);
        };
        if payment.status != PaymentStatus::Authorized {
            // Already captured, voided or failed; absorbing keeps the
            // compensation chain idempotent.
            debug!(
                saga_id = %envelope.saga_id,
                status = ?payment.status,
                "Void not applicable, discarding"
            );
            tx.commit().await?;
            return Ok(Disposition::Discarded);
        }

        let provider_ref = payment.provider_ref.clone().unwrap_or_default();
        self.provider
            .void(&provider_ref)
            .await
            .map_err(PaymentError::Provider)?;
        self.payments
            .set_status(&mut tx, payment.id, PaymentStatus::Void)
            .await?;

        let out = EventEnvelope::new(
            envelope.saga_id,
            EventType::PaymentVoid,
            envelope.tenant_id.clone(),
            json!({"paymentId": payment.id, "orderId": payment.order_id}),
        )
        .with_reason(reason);

        self.emit(&mut tx, envelope, record, out).await?;
        tx.commit().await?;

        info!(saga_id = %envelope.saga_id, payment_id = payment.id, reason, "Payment voided");
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
                    "payment",
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
