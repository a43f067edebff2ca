//! Background publisher draining the outbox to the bus.
//!
//! One logical worker per service: each cycle it discovers tenants with
//! eligible rows, leases a batch per tenant, and submits the batch with a
//! bounded fan-out. Rows sharing a partition key (the saga id) are sent
//! strictly serially; distinct keys go out concurrently up to
//! `max_in_flight`. A row is deleted only after the broker acknowledged it;
//! on broker failure the row keeps its lease and retries when the lease
//! expires. Rows that can never publish (unknown event type) and rows past
//! the attempts cap move to the dead-letter table instead of spinning.

use crate::metrics::OutboxMetrics;
use crate::{OutboxError, OutboxKey, OutboxRecord, OutboxResult, OutboxStore};
use async_trait::async_trait;
use event_schema::{headers as bus_headers, EventType};
use futures::stream::{self, StreamExt};
use rand::Rng;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Tuning for the publisher loop.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Rows leased per tenant per cycle
    pub batch_size: i64,
    /// How long a leased row stays invisible to other publishers
    pub lease_duration: Duration,
    /// Sleep between cycles that published something
    pub poll_interval: Duration,
    /// Ceiling for the idle/error backoff
    pub max_backoff: Duration,
    /// Delivery attempts before a row is quarantined
    pub attempts_cap: i32,
    /// Concurrent key-groups in flight per tenant batch
    pub max_in_flight: usize,
    /// Tenants visited per cycle
    pub max_tenants_per_cycle: i64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            attempts_cap: 12,
            max_in_flight: 8,
            max_tenants_per_cycle: 64,
        }
    }
}

/// Broker-facing side of the publisher.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Submit one record and await the broker's acknowledgment.
    async fn publish(&self, record: &OutboxRecord) -> OutboxResult<()>;
}

/// Kafka implementation of [`EventSink`].
///
/// The producer MUST be created with `enable.idempotence=true` and
/// `acks=all`; broker-side idempotence plus the consumer ledger is what
/// keeps redelivery harmless.
pub struct KafkaEventSink {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaEventSink {
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            delivery_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl EventSink for KafkaEventSink {
    async fn publish(&self, record: &OutboxRecord) -> OutboxResult<()> {
        let event_type = EventType::from_str(&record.event_type)
            .map_err(|e| OutboxError::Malformed(e.to_string()))?;
        let topic = event_type.topic();

        let payload = serde_json::to_string(&record.payload)?;
        let key = record.effective_key();

        let mut headers = OwnedHeaders::new()
            .insert(Header {
                key: bus_headers::EVENT_TYPE,
                value: Some(record.event_type.as_bytes()),
            })
            .insert(Header {
                key: bus_headers::TENANT_ID,
                value: Some(record.tenant_id.as_bytes()),
            });
        if let Some(correlation_id) = record.header(bus_headers::CORRELATION_ID) {
            headers = headers.insert(Header {
                key: bus_headers::CORRELATION_ID,
                value: Some(correlation_id.as_bytes()),
            });
        }

        let kafka_record = FutureRecord::to(topic)
            .key(&key)
            .payload(&payload)
            .headers(headers);

        self.producer
            .send(kafka_record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| OutboxError::PublishFailed(format!("Kafka publish failed: {err}")))?;

        debug!(
            saga_id = %record.saga_id,
            event_type = %record.event_type,
            topic,
            "Event published to bus"
        );

        Ok(())
    }
}

/// Truncated exponential backoff with jitter, reset on progress.
#[derive(Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
    }

    fn next(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.failures.min(16));
        let truncated = exp.min(self.max);
        self.failures = self.failures.saturating_add(1);

        // Half fixed, half jittered, so concurrent publishers spread out.
        let half = truncated / 2;
        let jitter_micros = rand::thread_rng().gen_range(0..=half.as_micros().max(1) as u64);
        half + Duration::from_micros(jitter_micros)
    }
}

/// The per-service background loop; see the module docs.
pub struct OutboxPublisher<S: OutboxStore, K: EventSink> {
    store: Arc<S>,
    sink: Arc<K>,
    config: PublisherConfig,
    metrics: Option<OutboxMetrics>,
}

impl<S, K> OutboxPublisher<S, K>
where
    S: OutboxStore + 'static,
    K: EventSink + 'static,
{
    pub fn new(store: Arc<S>, sink: Arc<K>, config: PublisherConfig) -> Self {
        Self {
            store,
            sink,
            config,
            metrics: None,
        }
    }

    /// Attach Prometheus metrics updated once per cycle.
    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until the task is aborted. Spawn with `tokio::spawn`.
    pub async fn run(&self) {
        info!(
            batch_size = self.config.batch_size,
            lease_secs = self.config.lease_duration.as_secs(),
            attempts_cap = self.config.attempts_cap,
            "Outbox publisher starting"
        );

        let mut backoff = Backoff::new(self.config.poll_interval, self.config.max_backoff);

        loop {
            let sleep_for = match self.cycle().await {
                Ok(0) => backoff.next(),
                Ok(published) => {
                    debug!(published, "Outbox cycle published events");
                    backoff.reset();
                    self.config.poll_interval
                }
                Err(e) => {
                    error!(error = ?e, "Outbox cycle failed");
                    backoff.next()
                }
            };

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.store.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }

            tokio::time::sleep(sleep_for).await;
        }
    }

    /// One publishing cycle over all tenants with eligible rows. Returns
    /// the number of records acknowledged and deleted.
    pub async fn cycle(&self) -> OutboxResult<usize> {
        let tenants = self
            .store
            .active_tenants(self.config.max_tenants_per_cycle)
            .await?;

        let mut published = 0;
        for tenant_id in tenants {
            match self.drain_tenant(&tenant_id).await {
                Ok(count) => published += count,
                Err(e) => {
                    // One tenant's failure must not starve the rest.
                    error!(tenant_id = %tenant_id, error = ?e, "Failed to drain tenant");
                }
            }
        }

        Ok(published)
    }

    async fn drain_tenant(&self, tenant_id: &str) -> OutboxResult<usize> {
        let records = self
            .store
            .lease_batch(tenant_id, self.config.batch_size, self.config.lease_duration)
            .await?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut deliverable = Vec::new();
        for record in records {
            if record.attempts > self.config.attempts_cap {
                warn!(
                    outbox_id = record.id,
                    saga_id = %record.saga_id,
                    attempts = record.attempts,
                    "Attempts cap exceeded, quarantining"
                );
                self.store
                    .quarantine(record.key(), "attempts cap exceeded")
                    .await?;
                if let Some(metrics) = &self.metrics {
                    metrics.quarantined.inc();
                }
            } else {
                deliverable.push(record);
            }
        }

        // Rows sharing a key stay in one serial group; groups fan out.
        let groups = group_by_key(deliverable);

        let acked: Vec<Vec<OutboxKey>> = stream::iter(groups)
            .map(|group| {
                let sink = Arc::clone(&self.sink);
                let store = Arc::clone(&self.store);
                let metrics = self.metrics.clone();
                async move { publish_group(sink, store, metrics, group).await }
            })
            .buffer_unordered(self.config.max_in_flight)
            .collect()
            .await;

        let keys: Vec<OutboxKey> = acked.into_iter().flatten().collect();
        let deleted = self.store.delete_by_keys(&keys).await?;

        if let Some(metrics) = &self.metrics {
            metrics.published.inc_by(deleted);
        }

        Ok(deleted as usize)
    }
}

/// Publish one serial key-group; returns the keys the broker acknowledged.
/// Stops at the first transient failure so later rows of the same saga
/// never overtake an unsent predecessor.
async fn publish_group<S: OutboxStore, K: EventSink>(
    sink: Arc<K>,
    store: Arc<S>,
    metrics: Option<OutboxMetrics>,
    group: Vec<OutboxRecord>,
) -> Vec<OutboxKey> {
    let mut acked = Vec::with_capacity(group.len());

    for record in group {
        match sink.publish(&record).await {
            Ok(()) => acked.push(record.key()),
            Err(e) if e.is_malformed() => {
                warn!(
                    outbox_id = record.id,
                    saga_id = %record.saga_id,
                    error = %e,
                    "Malformed record, quarantining"
                );
                if let Err(qe) = store.quarantine(record.key(), &e.to_string()).await {
                    error!(outbox_id = record.id, error = ?qe, "Failed to quarantine record");
                    break;
                }
                if let Some(metrics) = &metrics {
                    metrics.quarantined.inc();
                }
            }
            Err(e) => {
                warn!(
                    outbox_id = record.id,
                    saga_id = %record.saga_id,
                    attempts = record.attempts,
                    error = %e,
                    "Publish failed, will retry after lease expiry"
                );
                break;
            }
        }
    }

    acked
}

fn group_by_key(records: Vec<OutboxRecord>) -> Vec<Vec<OutboxRecord>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<OutboxRecord>> = Vec::new();

    for record in records {
        let key = record.effective_key();
        match index.get(&key) {
            Some(&i) => groups[i].push(record),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![record]);
            }
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use serde_json::json;
    use sqlx::{Postgres, Transaction};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn record(id: i64, saga_id: Uuid, event_type: &str, attempts: i32) -> OutboxRecord {
        OutboxRecord {
            id,
            created_on: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            tenant_id: "acme".to_string(),
            saga_id,
            aggregate_type: "order".to_string(),
            aggregate_id: None,
            event_type: event_type.to_string(),
            event_key: None,
            payload: json!({"n": id}),
            headers: None,
            attempts,
            lease_until: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// In-memory store double; leasing hands out whatever is loaded.
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<OutboxRecord>>,
        quarantined: Mutex<Vec<(OutboxKey, String)>>,
    }

    impl MemoryStore {
        fn load(&self, records: Vec<OutboxRecord>) {
            *self.rows.lock().unwrap() = records;
        }
    }

    #[async_trait]
    impl OutboxStore for MemoryStore {
        async fn save_event(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            _event: crate::NewOutboxEvent,
        ) -> OutboxResult<OutboxRecord> {
            Err(OutboxError::Other(anyhow::anyhow!(
                "not supported by the in-memory store"
            )))
        }

        async fn lease_batch(
            &self,
            tenant_id: &str,
            batch_size: i64,
            _lease_duration: Duration,
        ) -> OutboxResult<Vec<OutboxRecord>> {
            let mut rows = self.rows.lock().unwrap();
            let mut leased = Vec::new();
            for row in rows.iter_mut() {
                if row.tenant_id == tenant_id && leased.len() < batch_size as usize {
                    row.attempts += 1;
                    leased.push(row.clone());
                }
            }
            Ok(leased)
        }

        async fn delete_by_keys(&self, keys: &[OutboxKey]) -> OutboxResult<u64> {
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|r| !keys.contains(&r.key()));
            Ok((before - rows.len()) as u64)
        }

        async fn quarantine(&self, key: OutboxKey, reason: &str) -> OutboxResult<()> {
            let mut rows = self.rows.lock().unwrap();
            rows.retain(|r| r.key() != key);
            self.quarantined
                .lock()
                .unwrap()
                .push((key, reason.to_string()));
            Ok(())
        }

        async fn active_tenants(&self, _limit: i64) -> OutboxResult<Vec<String>> {
            let rows = self.rows.lock().unwrap();
            let mut tenants: Vec<String> = rows.iter().map(|r| r.tenant_id.clone()).collect();
            tenants.dedup();
            Ok(tenants)
        }

        async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
            Ok((self.rows.lock().unwrap().len() as i64, 0))
        }
    }

    /// Sink double: records publish order, optionally failing everything.
    #[derive(Default)]
    struct MemorySink {
        published: Mutex<Vec<(String, i64)>>,
        fail_transient: Mutex<bool>,
    }

    #[async_trait]
    impl EventSink for MemorySink {
        async fn publish(&self, record: &OutboxRecord) -> OutboxResult<()> {
            EventType::from_str(&record.event_type)
                .map_err(|e| OutboxError::Malformed(e.to_string()))?;
            if *self.fail_transient.lock().unwrap() {
                return Err(OutboxError::PublishFailed("broker down".to_string()));
            }
            self.published
                .lock()
                .unwrap()
                .push((record.effective_key(), record.id));
            Ok(())
        }
    }

    fn publisher(
        store: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
    ) -> OutboxPublisher<MemoryStore, MemorySink> {
        OutboxPublisher::new(store, sink, PublisherConfig::default())
    }

    #[tokio::test]
    async fn publishes_acks_and_deletes() {
        let saga = Uuid::now_v7();
        let store = Arc::new(MemoryStore::default());
        store.load(vec![
            record(1, saga, "ORDER_CREATED", 0),
            record(2, saga, "PAYMENT_AUTHORIZED", 0),
            record(3, saga, "INVENTORY_RESERVED", 0),
        ]);
        let sink = Arc::new(MemorySink::default());

        let published = publisher(Arc::clone(&store), Arc::clone(&sink))
            .cycle()
            .await
            .unwrap();

        assert_eq!(published, 3);
        assert!(store.rows.lock().unwrap().is_empty());

        // Same saga, one key group: strict id order.
        let order: Vec<i64> = sink.published.lock().unwrap().iter().map(|p| p.1).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn broker_failure_keeps_rows_for_retry() {
        let saga = Uuid::now_v7();
        let store = Arc::new(MemoryStore::default());
        store.load(vec![record(1, saga, "ORDER_CREATED", 0)]);
        let sink = Arc::new(MemorySink::default());
        *sink.fail_transient.lock().unwrap() = true;

        let published = publisher(Arc::clone(&store), Arc::clone(&sink))
            .cycle()
            .await
            .unwrap();

        assert_eq!(published, 0);
        assert_eq!(store.rows.lock().unwrap().len(), 1);
        assert!(store.quarantined.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_records_are_quarantined_not_retried() {
        let saga = Uuid::now_v7();
        let store = Arc::new(MemoryStore::default());
        store.load(vec![
            record(1, saga, "NOT_A_REAL_EVENT", 0),
            record(2, saga, "ORDER_CREATED", 0),
        ]);
        let sink = Arc::new(MemorySink::default());

        let published = publisher(Arc::clone(&store), Arc::clone(&sink))
            .cycle()
            .await
            .unwrap();

        // The good row still goes out; the poisoned one is dead-lettered.
        assert_eq!(published, 1);
        let quarantined = store.quarantined.lock().unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].0.id, 1);
    }

    #[tokio::test]
    async fn attempts_cap_moves_rows_to_dead_letter() {
        let saga = Uuid::now_v7();
        let store = Arc::new(MemoryStore::default());
        // Lease bumps attempts to 13, over the default cap of 12.
        store.load(vec![record(1, saga, "ORDER_CREATED", 12)]);
        let sink = Arc::new(MemorySink::default());

        let published = publisher(Arc::clone(&store), Arc::clone(&sink))
            .cycle()
            .await
            .unwrap();

        assert_eq!(published, 0);
        assert!(sink.published.lock().unwrap().is_empty());
        assert_eq!(store.quarantined.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn per_key_order_is_preserved_under_fanout() {
        let saga_a = Uuid::now_v7();
        let saga_b = Uuid::now_v7();
        let store = Arc::new(MemoryStore::default());
        store.load(vec![
            record(1, saga_a, "ORDER_CREATED", 0),
            record(2, saga_b, "ORDER_CREATED", 0),
            record(3, saga_a, "PAYMENT_AUTHORIZED", 0),
            record(4, saga_b, "PAYMENT_AUTHORIZED", 0),
        ]);
        let sink = Arc::new(MemorySink::default());

        publisher(Arc::clone(&store), Arc::clone(&sink))
            .cycle()
            .await
            .unwrap();

        let published = sink.published.lock().unwrap();
        let ids_for = |key: &str| -> Vec<i64> {
            published
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, id)| *id)
                .collect()
        };
        assert_eq!(ids_for(&saga_a.to_string()), vec![1, 3]);
        assert_eq!(ids_for(&saga_b.to_string()), vec![2, 4]);
    }

    #[test]
    fn grouping_preserves_first_seen_order() {
        let saga_a = Uuid::now_v7();
        let saga_b = Uuid::now_v7();
        let groups = group_by_key(vec![
            record(1, saga_a, "ORDER_CREATED", 0),
            record(2, saga_b, "ORDER_CREATED", 0),
            record(3, saga_a, "PAYMENT_AUTHORIZED", 0),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(groups[1].iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn backoff_grows_truncates_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));

        let first = backoff.next();
        let second = backoff.next();
        assert!(first >= Duration::from_millis(50));
        assert!(second >= Duration::from_millis(100));

        for _ in 0..20 {
            let d = backoff.next();
            assert!(d <= Duration::from_secs(5));
        }

        backoff.reset();
        assert!(backoff.next() <= Duration::from_millis(200));
    }
}
