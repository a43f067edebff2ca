//! Per-state timeout watchdog.
//!
//! Scans live sagas whose last applied event is older than the state's
//! budget and emits the failure event the missing downstream answer would
//! have carried, with reason `TIMEOUT`. The substitute event flows through
//! the outbox and the bus like any other; the regular compensation chain
//! does the rest, and consumer-side idempotency absorbs the race where the
//! real answer arrives after all.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use event_schema::{reasons, EventEnvelope};
use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, error, info};
use transactional_outbox::{NewOutboxEvent, OutboxStore};

use crate::db::sagas::{SagaRepository, SagaRow};
use crate::error::Result;

pub struct Watchdog<S: OutboxStore> {
    pool: PgPool,
    sagas: SagaRepository,
    outbox: Arc<S>,
    interval: Duration,
}

impl<S: OutboxStore> Watchdog<S> {
    pub fn new(
        pool: PgPool,
        sagas: SagaRepository,
        outbox: Arc<S>,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            sagas,
            outbox,
            interval,
        }
    }

    /// Run forever; one scan per interval.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Saga watchdog starting");
        loop {
            tokio::time::sleep(self.interval).await;
            if let Err(e) = self.scan().await {
                error!(error = ?e, "Watchdog scan failed");
            }
        }
    }

    /// One pass over stale candidates. Returns how many timeouts fired.
    pub async fn scan(&self) -> Result<usize> {
        let candidates = self.sagas.stale_candidates(100).await?;
        let now = Utc::now();

        let mut fired = 0;
        for saga in candidates {
            let Some(budget) = saga.state.timeout_budget() else {
                continue;
            };
            let deadline = saga.last_event_ts
                + chrono::Duration::from_std(budget).unwrap_or_else(|_| chrono::Duration::seconds(30));
            if now < deadline {
                continue;
            }
            if self.fire(&saga).await? {
                fired += 1;
            }
        }

        Ok(fired)
    }

    async fn fire(&self, saga: &SagaRow) -> Result<bool> {
        let Some(event_type) = saga.state.timeout_event() else {
            return Ok(false);
        };

        let mut tx = self.pool.begin().await?;

        // Optimistic claim: if another watchdog instance (or a real event)
        // touched the saga since the scan, skip.
        if !self.sagas.record_timeout(&mut tx, saga).await? {
            debug!(saga_id = %saga.id, "Saga moved since scan, timeout skipped");
            tx.rollback().await?;
            return Ok(false);
        }

        let envelope = EventEnvelope::new(
            saga.id,
            event_type,
            saga.tenant_id.clone(),
            json!({"orderId": saga.order_id}),
        )
        .with_reason(reasons::TIMEOUT);

        self.outbox
            .save_event(
                &mut tx,
                NewOutboxEvent::new(&saga.tenant_id, saga.id, "saga", event_type.as_str())
                    .payload(serde_json::to_value(&envelope).map_err(anyhow::Error::from)?),
            )
            .await
            .map_err(|e| crate::error::ApiError::Internal(e.into()))?;

        tx.commit().await?;

        info!(
            saga_id = %saga.id,
            state = %saga.state,
            substitute = %event_type,
            attempts = saga.attempts + 1,
            "State budget expired, failure event emitted"
        );

        Ok(true)
    }
}
