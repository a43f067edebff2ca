//! Shared Kafka configuration record.
//!
//! Loaded from `KAFKA_*` environment variables; every knob has a default
//! suitable for local development. Both sides of the bus build their
//! rdkafka `ClientConfig` from here so producer idempotence and manual
//! consumer commits cannot be configured away per service.

use rdkafka::config::ClientConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_bootstrap")]
    pub bootstrap: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_compression_type")]
    pub compression_type: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u32,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    #[serde(default = "default_fetch_max_wait_ms")]
    pub fetch_max_wait_ms: u32,
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,
    #[serde(default)]
    pub topics: TopicsConfig,
}

/// Topic names; defaults are the platform's versioned topics.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_order_create_topic")]
    pub order_create_command: String,
    #[serde(default = "default_order_events_topic")]
    pub order_events: String,
    #[serde(default = "default_payment_events_topic")]
    pub payment_events: String,
    #[serde(default = "default_inventory_events_topic")]
    pub inventory_events: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            order_create_command: default_order_create_topic(),
            order_events: default_order_events_topic(),
            payment_events: default_payment_events_topic(),
            inventory_events: default_inventory_events_topic(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap: default_bootstrap(),
            client_id: default_client_id(),
            acks: default_acks(),
            compression_type: default_compression_type(),
            batch_size: default_batch_size(),
            linger_ms: default_linger_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            fetch_max_wait_ms: default_fetch_max_wait_ms(),
            commit_interval_ms: default_commit_interval_ms(),
            topics: TopicsConfig::default(),
        }
    }
}

impl KafkaConfig {
    /// Load from `KAFKA_*` environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("KAFKA_").from_env()
    }

    /// Consumer settings: manual commits, manual offset store, replay from
    /// the earliest uncommitted offset.
    pub fn consumer_client_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap)
            .set("client.id", &self.client_id)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("fetch.wait.max.ms", self.fetch_max_wait_ms.to_string());
        config
    }

    /// Producer settings: idempotent, full acknowledgment.
    pub fn producer_client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap)
            .set("client.id", &self.client_id)
            .set("enable.idempotence", "true")
            .set("acks", &self.acks)
            .set("max.in.flight.requests.per.connection", "5")
            .set("compression.type", &self.compression_type)
            .set("batch.size", self.batch_size.to_string())
            .set("linger.ms", self.linger_ms.to_string())
            .set("delivery.timeout.ms", self.delivery_timeout_ms.to_string());
        config
    }
}

fn default_bootstrap() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "order-platform".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_compression_type() -> String {
    "lz4".to_string()
}

fn default_batch_size() -> u32 {
    16384
}

fn default_linger_ms() -> u32 {
    5
}

fn default_delivery_timeout_ms() -> u32 {
    120_000
}

fn default_session_timeout_ms() -> u32 {
    30_000
}

fn default_fetch_max_wait_ms() -> u32 {
    500
}

fn default_commit_interval_ms() -> u64 {
    2_000
}

fn default_order_create_topic() -> String {
    event_schema::topics::ORDER_COMMAND_CREATE.to_string()
}

fn default_order_events_topic() -> String {
    event_schema::topics::ORDER_EVENTS.to_string()
}

fn default_payment_events_topic() -> String {
    event_schema::topics::PAYMENT_EVENTS.to_string()
}

fn default_inventory_events_topic() -> String {
    event_schema::topics::INVENTORY_EVENTS.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_local_development() {
        let config = KafkaConfig::default();
        assert_eq!(config.bootstrap, "localhost:9092");
        assert_eq!(config.acks, "all");
        assert_eq!(config.commit_interval_ms, 2_000);
        assert_eq!(config.topics.order_create_command, "order.command.create.v1");
        assert_eq!(config.topics.payment_events, "payment.events.v1");
    }

    #[test]
    fn consumer_config_disables_auto_commit() {
        let config = KafkaConfig::default().consumer_client_config("order-service");
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("group.id"), Some("order-service"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn producer_config_is_idempotent_with_full_acks() {
        let config = KafkaConfig::default().producer_client_config();
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("max.in.flight.requests.per.connection"), Some("5"));
    }
}
