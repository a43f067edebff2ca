//! Bus topic names. Versioned; bump the suffix on breaking payload changes.

pub const ORDER_COMMAND_CREATE: &str = "order.command.create.v1";
pub const ORDER_EVENTS: &str = "order.events.v1";
pub const PAYMENT_EVENTS: &str = "payment.events.v1";
pub const INVENTORY_EVENTS: &str = "inventory.events.v1";

/// All event topics, for consumers that track the whole saga.
pub const ALL_EVENTS: [&str; 3] = [ORDER_EVENTS, PAYMENT_EVENTS, INVENTORY_EVENTS];
