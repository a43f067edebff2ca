//! Bus consumer runtime.
//!
//! Wraps an rdkafka `StreamConsumer` with the delivery contract every
//! service on the platform relies on: ordered per-partition dispatch,
//! at-least-once delivery, and manual offset commit that never runs ahead
//! of a record's completion. Auto-commit is disabled; offsets are stored
//! after the handler returns and flushed on a bounded interval.
//!
//! Handlers classify every record into a [`Disposition`]; all three
//! dispositions acknowledge. A transient handler error (database briefly
//! down) retries the same record in place, which both preserves partition
//! order and keeps the uncommitted offset from being overtaken. Only
//! [`ConsumerError::Fatal`] stops the runtime, surfacing as an unhealthy
//! service.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::types::RDKafkaErrorCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

pub mod config;

pub use config::{KafkaConfig, TopicsConfig};

/// One record as seen by a handler.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl InboundRecord {
    fn from_message(message: &BorrowedMessage<'_>) -> Self {
        let mut headers = HashMap::new();
        if let Some(borrowed) = message.headers() {
            for header in borrowed.iter() {
                if let Some(value) = header.value {
                    if let Ok(value) = std::str::from_utf8(value) {
                        headers.insert(header.key.to_string(), value.to_string());
                    }
                }
            }
        }

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .and_then(|k| std::str::from_utf8(k).ok())
                .map(String::from),
            payload: message.payload().unwrap_or_default().to_vec(),
            headers,
        }
    }

    /// Parse the payload as the platform event envelope.
    pub fn envelope(&self) -> Result<event_schema::EventEnvelope, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// What the handler did with a record. All three acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Effect applied and (possibly) a follow-up event written to the
    /// outbox.
    Applied,
    /// The idempotency ledger already had the key; no effect.
    Duplicate,
    /// Not for this consumer, malformed, or illegal in the current state;
    /// logged and dropped.
    Discarded,
}

/// Handler failures.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// Corruption or schema break; stops the partition and the runtime.
    #[error("Fatal consumer error: {0}")]
    Fatal(String),

    /// Transient failure; the record is retried in place.
    #[error("Transient consumer error: {0}")]
    Transient(#[from] anyhow::Error),
}

/// Per-record processing entry point implemented by each service.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, record: &InboundRecord) -> Result<Disposition, ConsumerError>;
}

/// The consumer loop; one instance per subscription set.
pub struct ConsumerRuntime {
    consumer: StreamConsumer,
    commit_interval: Duration,
    retry_backoff: Duration,
}

impl ConsumerRuntime {
    /// Build a consumer from the shared Kafka configuration. Auto-commit
    /// and auto-offset-store are always off; this runtime owns both.
    pub fn new(
        kafka: &KafkaConfig,
        group_id: &str,
        topics: &[&str],
    ) -> Result<Self, KafkaError> {
        let client_config: ClientConfig = kafka.consumer_client_config(group_id);

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(topics)?;

        info!(group_id, ?topics, "Bus consumer subscribed");

        Ok(Self {
            consumer,
            commit_interval: Duration::from_millis(kafka.commit_interval_ms),
            retry_backoff: Duration::from_millis(500),
        })
    }

    /// Run until a fatal error. Spawn with `tokio::spawn`.
    pub async fn run(&self, handler: Arc<dyn EventHandler>) -> Result<(), ConsumerError> {
        let mut commit_tick = tokio::time::interval(self.commit_interval);
        commit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = self.consumer.recv() => {
                    match result {
                        Ok(message) => {
                            let record = InboundRecord::from_message(&message);
                            self.process_record(&record, handler.as_ref()).await?;
                            if let Err(e) = self.consumer.store_offset(
                                &record.topic,
                                record.partition,
                                record.offset,
                            ) {
                                warn!(
                                    topic = %record.topic,
                                    partition = record.partition,
                                    offset = record.offset,
                                    error = %e,
                                    "Failed to store offset"
                                );
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Bus consumer receive error");
                            tokio::time::sleep(self.retry_backoff).await;
                        }
                    }
                }
                _ = commit_tick.tick() => {
                    self.commit().await;
                }
            }
        }
    }

    /// Retry a record in place until it applies or a fatal error surfaces.
    /// Retrying here (instead of skipping) is what keeps the committed
    /// offset behind any record whose effect has not happened yet.
    async fn process_record(
        &self,
        record: &InboundRecord,
        handler: &dyn EventHandler,
    ) -> Result<(), ConsumerError> {
        let mut attempt: u32 = 0;
        loop {
            match handler.handle(record).await {
                Ok(disposition) => {
                    trace!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        ?disposition,
                        "Record acknowledged"
                    );
                    return Ok(());
                }
                Err(ConsumerError::Fatal(reason)) => {
                    error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        reason = %reason,
                        "Fatal error, stopping consumer"
                    );
                    return Err(ConsumerError::Fatal(reason));
                }
                Err(ConsumerError::Transient(e)) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.retry_backoff.saturating_mul(attempt.min(10));
                    warn!(
                        topic = %record.topic,
                        offset = record.offset,
                        attempt,
                        error = ?e,
                        "Transient handler error, retrying record in place"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Flush stored offsets. Also callable on demand (shutdown).
    pub async fn commit(&self) {
        match self.consumer.commit_consumer_state(CommitMode::Async) {
            Ok(()) => debug!("Committed consumer offsets"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                // Nothing stored since the last tick.
            }
            Err(e) => warn!(error = %e, "Failed to commit consumer offsets"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_schema::EventType;
    use serde_json::json;
    use uuid::Uuid;

    fn record_with(payload: serde_json::Value) -> InboundRecord {
        InboundRecord {
            topic: "order.events.v1".to_string(),
            partition: 0,
            offset: 42,
            key: Some("key".to_string()),
            payload: serde_json::to_vec(&payload).unwrap(),
            headers: HashMap::from([
                ("tenantId".to_string(), "acme".to_string()),
                ("correlationId".to_string(), "corr-1".to_string()),
            ]),
        }
    }

    #[test]
    fn envelope_parses_from_payload() {
        let saga_id = Uuid::now_v7();
        let record = record_with(json!({
            "sagaId": saga_id,
            "type": "ORDER_CREATED",
            "tenantId": "acme",
            "ts": "2026-08-01T10:00:00Z",
            "payload": {"orderId": 7}
        }));

        let envelope = record.envelope().unwrap();
        assert_eq!(envelope.saga_id, saga_id);
        assert_eq!(envelope.event_type, EventType::OrderCreated);
        assert_eq!(envelope.payload["orderId"], 7);
        assert_eq!(envelope.reason, None);
    }

    #[test]
    fn malformed_payload_is_an_error_not_a_panic() {
        let record = InboundRecord {
            topic: "order.events.v1".to_string(),
            partition: 0,
            offset: 1,
            key: None,
            payload: b"not json".to_vec(),
            headers: HashMap::new(),
        };
        assert!(record.envelope().is_err());
    }

    #[test]
    fn headers_are_reachable_by_name() {
        let record = record_with(json!({}));
        assert_eq!(record.header("tenantId"), Some("acme"));
        assert_eq!(record.header("correlationId"), Some("corr-1"));
        assert_eq!(record.header("missing"), None);
    }
}
