//! Order-side saga steps.
//!
//! Applies the `OrderCreate` command and the payment/inventory answers that
//! move an order through its lifecycle. Every application is one
//! transaction: ledger claim, aggregate change, outbox row. Events outside
//! this service's closed set, duplicates, and status-illegal transitions
//! are acknowledged without effect.

use std::sync::Arc;

use async_trait::async_trait;
use bus_consumer::{ConsumerError, Disposition, EventHandler, InboundRecord};
use event_schema::{commands::OrderCreate, headers, reasons, EventEnvelope, EventType};
use idempotent_consumer::{IdempotencyLedger, LedgerOutcome};
use saga_core::OrderStatus;
use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use transactional_outbox::{NewOutboxEvent, OutboxStore};

use crate::db::orders::{NewOrder, OrderRepository};
use crate::error::{OrderError, Result};

pub struct SagaEventHandler<S: OutboxStore> {
    pool: PgPool,
    orders: OrderRepository,
    ledger: IdempotencyLedger,
    outbox: Arc<S>,
}

impl<S: OutboxStore> SagaEventHandler<S> {
    pub fn new(
        pool: PgPool,
        orders: OrderRepository,
        ledger: IdempotencyLedger,
        outbox: Arc<S>,
    ) -> Self {
        Self {
            pool,
            orders,
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
            EventType::OrderCreate => self.apply_order_create(envelope, record).await,
            EventType::InventoryReserved => {
                self.apply_status_only(
                    envelope,
                    record,
                    OrderStatus::Reserved,
                    &[OrderStatus::AwaitingPayment],
                )
                .await
            }
            EventType::PaymentCaptured => {
                self.apply_status_only(
                    envelope,
                    record,
                    OrderStatus::Paid,
                    &[OrderStatus::AwaitingPayment, OrderStatus::Reserved],
                )
                .await
            }
            EventType::PaymentFailed => {
                self.apply_failure(envelope, record, reasons::PAYMENT_FAILED)
                    .await
            }
            EventType::PaymentVoid => {
                // The void carries why the saga is unwinding.
                let reason = envelope
                    .reason
                    .clone()
                    .unwrap_or_else(|| reasons::PAYMENT_FAILED.to_string());
                self.apply_failure(envelope, record, &reason).await
            }
            _ => {
                debug!(event_type = %envelope.event_type, "Event outside closed set, ignoring");
                Ok(Disposition::Discarded)
            }
        }
    }

    /// `OrderCreate`: persist the order and answer with `ORDER_CREATED`.
    async fn apply_order_create(
        &self,
        envelope: &EventEnvelope,
        record: &InboundRecord,
    ) -> Result<Disposition> {
        let command: OrderCreate = match serde_json::from_value(envelope.payload.clone()) {
            Ok(command) => command,
            Err(e) => {
                warn!(
                    saga_id = %envelope.saga_id,
                    error = %e,
                    "Malformed OrderCreate payload, discarding"
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

        let order_id = self
            .orders
            .insert(
                &mut tx,
                NewOrder {
                    tenant_id: &envelope.tenant_id,
                    saga_id: envelope.saga_id,
                    customer_id: &command.customer_id,
                    user_id: command.user_id,
                    currency_code: &command.currency_code,
                    total_amount_minor: command.total_amount_minor,
                    lines: &command.lines,
                },
            )
            .await?;

        let out = EventEnvelope::new(
            envelope.saga_id,
            EventType::OrderCreated,
            envelope.tenant_id.clone(),
            json!({
                "orderId": order_id,
                "customerId": command.customer_id,
                "userId": command.user_id,
                "lines": command.lines,
                "currencyCode": command.currency_code,
                "totalAmountMinor": command.total_amount_minor,
            }),
        );
        let outbox_record = self
            .outbox
            .save_event(
                &mut tx,
                NewOutboxEvent::new(
                    &envelope.tenant_id,
                    envelope.saga_id,
                    "order",
                    EventType::OrderCreated.as_str(),
                )
                .aggregate_id(order_id.to_string())
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
                &format!("order:{order_id}:{}", outbox_record.id),
            )
            .await?;

        tx.commit().await?;

        info!(
            saga_id = %envelope.saga_id,
            tenant_id = %envelope.tenant_id,
            order_id,
            "Order created"
        );

        Ok(Disposition::Applied)
    }

    /// Progress events with no outbound answer from this service.
    async fn apply_status_only(
        &self,
        envelope: &EventEnvelope,
        record: &InboundRecord,
        to: OrderStatus,
        allowed_from: &[OrderStatus],
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

        let moved = self
            .orders
            .set_status(&mut tx, &envelope.tenant_id, envelope.saga_id, to, allowed_from)
            .await?;
        if !moved {
            // Out-of-order event or unknown order; claim stays recorded so
            // a redelivery stays silent too.
            warn!(
                saga_id = %envelope.saga_id,
                event_type = %envelope.event_type,
                "Status transition not applicable, discarding"
            );
            tx.commit().await?;
            return Ok(Disposition::Discarded);
        }

        tx.commit().await?;
        Ok(Disposition::Applied)
    }

    /// Compensation end: mark the order rejected and broadcast
    /// `ORDER_FAILED` with the originating reason.
    async fn apply_failure(
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

        let moved = self
            .orders
            .set_status(
                &mut tx,
                &envelope.tenant_id,
                envelope.saga_id,
                OrderStatus::Rejected,
                &[
                    OrderStatus::Pending,
                    OrderStatus::AwaitingPayment,
                    OrderStatus::Reserved,
                ],
            )
            .await?;
        if !moved {
            warn!(
                saga_id = %envelope.saga_id,
                event_type = %envelope.event_type,
                "No order to reject (already terminal or never created), discarding"
            );
            tx.commit().await?;
            return Ok(Disposition::Discarded);
        }

        let out = EventEnvelope::new(
            envelope.saga_id,
            EventType::OrderFailed,
            envelope.tenant_id.clone(),
            json!({}),
        )
        .with_reason(reason);
        self.outbox
            .save_event(
                &mut tx,
                NewOutboxEvent::new(
                    &envelope.tenant_id,
                    envelope.saga_id,
                    "order",
                    EventType::OrderFailed.as_str(),
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
                &format!("rejected:{reason}"),
            )
            .await?;

        tx.commit().await?;

        info!(
            saga_id = %envelope.saga_id,
            reason,
            "Order rejected, saga failed"
        );

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

        self.apply(&envelope, record).await.map_err(ConsumerError::from)
    }
}

/// Carry the inbound correlation id into the emitted event's headers.
fn correlation_headers(record: &InboundRecord) -> serde_json::Value {
    match record.header(headers::CORRELATION_ID) {
        Some(correlation_id) => json!({ headers::CORRELATION_ID: correlation_id }),
        None => json!({}),
    }
}
