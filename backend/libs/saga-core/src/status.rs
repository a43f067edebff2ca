//! Aggregate status enums with their stable smallint database form.
//!
//! Ordinals are frozen; append new variants, never reorder.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{type_name} has no variant for db value {value}")]
pub struct StatusFromDbError {
    type_name: &'static str,
    value: i16,
}

impl StatusFromDbError {
    pub(crate) fn new(type_name: &'static str, value: i16) -> Self {
        Self { type_name, value }
    }
}

macro_rules! db_status_enum {
    ($name:ident { $($variant:ident = $ord:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_i16(&self) -> i16 {
                match self {
                    $(Self::$variant => $ord),+
                }
            }

            pub fn from_i16(v: i16) -> Result<Self, StatusFromDbError> {
                match v {
                    $($ord => Ok(Self::$variant),)+
                    other => Err(StatusFromDbError::new(stringify!($name), other)),
                }
            }
        }
    };
}

db_status_enum!(OrderStatus {
    Pending = 0,
    AwaitingPayment = 1,
    Reserved = 2,
    Paid = 3,
    Rejected = 4,
    Cancelled = 5,
});

db_status_enum!(PaymentStatus {
    Pending = 0,
    Authorized = 1,
    Captured = 2,
    Void = 3,
    Failed = 4,
});

db_status_enum!(CaptureStatus {
    Pending = 0,
    Succeeded = 1,
    Failed = 2,
});

db_status_enum!(ReservationStatus {
    Reserved = 0,
    Released = 1,
    Failed = 2,
});

db_status_enum!(ShipmentStatus {
    Scheduled = 0,
    Failed = 1,
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_status_round_trips_through_its_db_form() {
        for s in [
            OrderStatus::Pending,
            OrderStatus::AwaitingPayment,
            OrderStatus::Reserved,
            OrderStatus::Paid,
            OrderStatus::Rejected,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::from_i16(s.as_i16()).unwrap(), s);
        }
        for s in [
            PaymentStatus::Pending,
            PaymentStatus::Authorized,
            PaymentStatus::Captured,
            PaymentStatus::Void,
            PaymentStatus::Failed,
        ] {
            assert_eq!(PaymentStatus::from_i16(s.as_i16()).unwrap(), s);
        }
        for s in [
            CaptureStatus::Pending,
            CaptureStatus::Succeeded,
            CaptureStatus::Failed,
        ] {
            assert_eq!(CaptureStatus::from_i16(s.as_i16()).unwrap(), s);
        }
        for s in [
            ReservationStatus::Reserved,
            ReservationStatus::Released,
            ReservationStatus::Failed,
        ] {
            assert_eq!(ReservationStatus::from_i16(s.as_i16()).unwrap(), s);
        }
        for s in [ShipmentStatus::Scheduled, ShipmentStatus::Failed] {
            assert_eq!(ShipmentStatus::from_i16(s.as_i16()).unwrap(), s);
        }
    }

    #[test]
    fn unknown_ordinals_are_rejected() {
        assert!(OrderStatus::from_i16(99).is_err());
        assert!(PaymentStatus::from_i16(-1).is_err());
    }

    #[test]
    fn status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_value(OrderStatus::AwaitingPayment).unwrap(),
            serde_json::json!("AWAITING_PAYMENT")
        );
    }
}
