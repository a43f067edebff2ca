//! Saga registry consumer.
//!
//! The gateway watches all three event topics and advances its saga rows
//! through the shared transition table. It emits nothing; the registry is
//! what `GET /orders/{sagaId}` serves and what the watchdog scans.

use async_trait::async_trait;
use bus_consumer::{ConsumerError, Disposition, EventHandler, InboundRecord};
use event_schema::{EventEnvelope, EventType};
use idempotent_consumer::{IdempotencyLedger, LedgerOutcome};
use saga_core::{transition, Transition};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::db::sagas::SagaRepository;
use crate::error::ApiError;

pub struct SagaRegistryHandler {
    pool: PgPool,
    sagas: SagaRepository,
    ledger: IdempotencyLedger,
}

impl SagaRegistryHandler {
    pub fn new(pool: PgPool, sagas: SagaRepository, ledger: IdempotencyLedger) -> Self {
        Self {
            pool,
            sagas,
            ledger,
        }
    }

    async fn apply(
        &self,
        envelope: &EventEnvelope,
        record: &InboundRecord,
    ) -> Result<Disposition, ApiError> {
        if envelope.event_type == EventType::OrderCreate {
            return Ok(Disposition::Discarded);
        }

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
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;
        if claim == LedgerOutcome::Duplicate {
            tx.rollback().await?;
            return Ok(Disposition::Duplicate);
        }

        let Some(saga) = self.sagas.find_for_update(&mut tx, envelope.saga_id).await? else {
            warn!(saga_id = %envelope.saga_id, "Event for unknown saga, discarding");
            tx.commit().await?;
            return Ok(Disposition::Discarded);
        };

        // The gateway accepted this saga under one tenant; an envelope
        // claiming another is corrupt routing, not a transition.
        if saga.tenant_id != envelope.tenant_id {
            warn!(
                saga_id = %envelope.saga_id,
                expected = %saga.tenant_id,
                got = %envelope.tenant_id,
                "Tenant mismatch on saga event, discarding"
            );
            tx.commit().await?;
            return Ok(Disposition::Discarded);
        }

        let order_id = envelope.payload.get("orderId").and_then(|v| v.as_i64());

        let disposition = match transition(saga.state, envelope.event_type) {
            Transition::Advance(next) | Transition::Terminal(next) => {
                self.sagas
                    .apply_event(
                        &mut tx,
                        saga.id,
                        Some(next),
                        envelope.event_type.as_str(),
                        envelope.ts,
                        order_id,
                    )
                    .await?;
                info!(
                    saga_id = %saga.id,
                    from = %saga.state,
                    to = %next,
                    event_type = %envelope.event_type,
                    "Saga advanced"
                );
                Disposition::Applied
            }
            Transition::Observe => {
                self.sagas
                    .apply_event(
                        &mut tx,
                        saga.id,
                        None,
                        envelope.event_type.as_str(),
                        envelope.ts,
                        order_id,
                    )
                    .await?;
                Disposition::Applied
            }
            Transition::Duplicate => {
                debug!(
                    saga_id = %saga.id,
                    event_type = %envelope.event_type,
                    "Event on terminal saga, absorbed"
                );
                Disposition::Duplicate
            }
            Transition::Invalid => {
                warn!(
                    saga_id = %saga.id,
                    state = %saga.state,
                    event_type = %envelope.event_type,
                    "Illegal transition, discarding"
                );
                Disposition::Discarded
            }
        };

        tx.commit().await?;
        Ok(disposition)
    }
}

#[async_trait]
impl EventHandler for SagaRegistryHandler {
    async fn handle(&self, record: &InboundRecord) -> Result<Disposition, ConsumerError> {
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

        self.apply(&envelope, record)
            .await
            .map_err(|e| ConsumerError::Transient(anyhow::anyhow!(e.to_string())))
    }
}
