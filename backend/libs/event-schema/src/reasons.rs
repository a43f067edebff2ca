//! Failure reasons carried in the envelope's `reason` field.

pub const PAYMENT_FAILED: &str = "PAYMENT_FAILED";
pub const INVENTORY_FAILED: &str = "INVENTORY_FAILED";
pub const CAPTURE_FAILED: &str = "CAPTURE_FAILED";
pub const SHIPPING_FAILED: &str = "SHIPPING_FAILED";
pub const TIMEOUT: &str = "TIMEOUT";
