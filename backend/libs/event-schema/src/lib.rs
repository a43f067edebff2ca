//! Event schema shared by every service on the order platform.
//!
//! Defines the wire envelope carried on the bus, the closed set of message
//! types the saga is built from, topic routing and the header names each
//! publisher attaches. Payload structs for the `OrderCreate` command live in
//! [`commands`]; everything downstream is a plain JSON payload interpreted
//! by the owning service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod commands;
pub mod headers;
pub mod reasons;
pub mod topics;

/// Message types carried on the bus.
///
/// `OrderCreate` is the only command; the remaining ten are the canonical
/// saga events. Each service declares the subset it handles and ignores the
/// rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    OrderCreate,
    OrderCreated,
    PaymentAuthorized,
    PaymentFailed,
    InventoryReserved,
    InventoryFailed,
    PaymentCaptured,
    PaymentVoid,
    InventoryRelease,
    OrderCompleted,
    OrderFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreate => "ORDER_CREATE",
            EventType::OrderCreated => "ORDER_CREATED",
            EventType::PaymentAuthorized => "PAYMENT_AUTHORIZED",
            EventType::PaymentFailed => "PAYMENT_FAILED",
            EventType::InventoryReserved => "INVENTORY_RESERVED",
            EventType::InventoryFailed => "INVENTORY_FAILED",
            EventType::PaymentCaptured => "PAYMENT_CAPTURED",
            EventType::PaymentVoid => "PAYMENT_VOID",
            EventType::InventoryRelease => "INVENTORY_RELEASE",
            EventType::OrderCompleted => "ORDER_COMPLETED",
            EventType::OrderFailed => "ORDER_FAILED",
        }
    }

    /// Topic a message of this type is published to.
    ///
    /// Events route by family; the command has its own topic.
    pub fn topic(&self) -> &'static str {
        match self {
            EventType::OrderCreate => topics::ORDER_COMMAND_CREATE,
            EventType::OrderCreated | EventType::OrderCompleted | EventType::OrderFailed => {
                topics::ORDER_EVENTS
            }
            EventType::PaymentAuthorized
            | EventType::PaymentFailed
            | EventType::PaymentCaptured
            | EventType::PaymentVoid => topics::PAYMENT_EVENTS,
            EventType::InventoryReserved
            | EventType::InventoryFailed
            | EventType::InventoryRelease => topics::INVENTORY_EVENTS,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::OrderCompleted | EventType::OrderFailed)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ORDER_CREATE" => Ok(EventType::OrderCreate),
            "ORDER_CREATED" => Ok(EventType::OrderCreated),
            "PAYMENT_AUTHORIZED" => Ok(EventType::PaymentAuthorized),
            "PAYMENT_FAILED" => Ok(EventType::PaymentFailed),
            "INVENTORY_RESERVED" => Ok(EventType::InventoryReserved),
            "INVENTORY_FAILED" => Ok(EventType::InventoryFailed),
            "PAYMENT_CAPTURED" => Ok(EventType::PaymentCaptured),
            "PAYMENT_VOID" => Ok(EventType::PaymentVoid),
            "INVENTORY_RELEASE" => Ok(EventType::InventoryRelease),
            "ORDER_COMPLETED" => Ok(EventType::OrderCompleted),
            "ORDER_FAILED" => Ok(EventType::OrderFailed),
            other => Err(UnknownEventType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

/// Wire envelope for every message on the bus.
///
/// Serialized form:
/// `{"sagaId":"<uuid>","type":"<EVENT_TYPE>","tenantId":"...","ts":"<RFC3339>","payload":{...},"reason":"..."}`
/// with `reason` omitted when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub saga_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub tenant_id: String,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

impl EventEnvelope {
    pub fn new(
        saga_id: Uuid,
        event_type: EventType,
        tenant_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            saga_id,
            event_type,
            tenant_id: tenant_id.into(),
            ts: Utc::now(),
            payload,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Partition key: all messages of one saga share a partition.
    pub fn partition_key(&self) -> String {
        self.saga_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn event_type_round_trips_through_str() {
        let all = [
            EventType::OrderCreate,
            EventType::OrderCreated,
            EventType::PaymentAuthorized,
            EventType::PaymentFailed,
            EventType::InventoryReserved,
            EventType::InventoryFailed,
            EventType::PaymentCaptured,
            EventType::PaymentVoid,
            EventType::InventoryRelease,
            EventType::OrderCompleted,
            EventType::OrderFailed,
        ];
        for ty in all {
            assert_eq!(EventType::from_str(ty.as_str()).unwrap(), ty);
        }
        assert!(EventType::from_str("ORDER_SHIPPED").is_err());
    }

    #[test]
    fn events_route_to_family_topics() {
        assert_eq!(EventType::OrderCreate.topic(), "order.command.create.v1");
        assert_eq!(EventType::OrderCreated.topic(), "order.events.v1");
        assert_eq!(EventType::OrderFailed.topic(), "order.events.v1");
        assert_eq!(EventType::PaymentVoid.topic(), "payment.events.v1");
        assert_eq!(EventType::InventoryRelease.topic(), "inventory.events.v1");
    }

    #[test]
    fn envelope_serializes_to_wire_shape() {
        let saga_id = Uuid::new_v4();
        let envelope = EventEnvelope::new(
            saga_id,
            EventType::PaymentAuthorized,
            "acme",
            json!({"amountMinor": 2000}),
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["sagaId"], json!(saga_id.to_string()));
        assert_eq!(value["type"], json!("PAYMENT_AUTHORIZED"));
        assert_eq!(value["tenantId"], json!("acme"));
        assert_eq!(value["payload"]["amountMinor"], json!(2000));
        assert!(value.get("reason").is_none());
    }

    #[test]
    fn envelope_reason_survives_round_trip() {
        let envelope = EventEnvelope::new(
            Uuid::new_v4(),
            EventType::OrderFailed,
            "acme",
            json!({}),
        )
        .with_reason(reasons::PAYMENT_FAILED);

        let text = serde_json::to_string(&envelope).unwrap();
        let parsed: EventEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.reason.as_deref(), Some("PAYMENT_FAILED"));
    }
}
