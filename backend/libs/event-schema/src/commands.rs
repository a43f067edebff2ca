//! Typed payloads for commands and the events whose shape more than one
//! service depends on. Downstream-only payloads stay untyped JSON in the
//! owning service.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One order line as submitted by the client. `price` is a decimal string
/// ("10.00"); services convert to minor units before arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub sku: String,
    pub qty: u32,
    pub price: String,
}

impl OrderLine {
    /// Line price in minor units, or None when `price` is not a plain
    /// decimal with at most two fraction digits.
    pub fn price_minor(&self) -> Option<i64> {
        parse_price_minor(&self.price)
    }
}

/// Payload of the `ORDER_CREATE` command emitted by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreate {
    pub customer_id: String,
    pub user_id: Uuid,
    pub lines: Vec<OrderLine>,
    pub currency_code: String,
    pub total_amount_minor: i64,
}

impl OrderCreate {
    /// Sum of `qty * price` over the lines, in minor units.
    pub fn total_minor(lines: &[OrderLine]) -> Option<i64> {
        let mut total: i64 = 0;
        for line in lines {
            let unit = line.price_minor()?;
            total = total.checked_add(unit.checked_mul(i64::from(line.qty))?)?;
        }
        Some(total)
    }
}

fn parse_price_minor(price: &str) -> Option<i64> {
    let (units, cents) = match price.split_once('.') {
        Some((units, frac)) => {
            if frac.is_empty() || frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let mut cents: i64 = frac.parse().ok()?;
            if frac.len() == 1 {
                cents *= 10;
            }
            (units, cents)
        }
        None => (price, 0),
    };
    if units.is_empty() || !units.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let units: i64 = units.parse().ok()?;
    units.checked_mul(100)?.checked_add(cents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(sku: &str, qty: u32, price: &str) -> OrderLine {
        OrderLine {
            sku: sku.to_string(),
            qty,
            price: price.to_string(),
        }
    }

    #[test]
    fn price_parses_to_minor_units() {
        assert_eq!(line("A", 1, "10.00").price_minor(), Some(1000));
        assert_eq!(line("A", 1, "10.5").price_minor(), Some(1050));
        assert_eq!(line("A", 1, "10").price_minor(), Some(1000));
        assert_eq!(line("A", 1, "0.99").price_minor(), Some(99));
    }

    #[test]
    fn malformed_prices_are_rejected() {
        for bad in ["", ".", "10.", "10.123", "-1.00", "1,00", "1e3", "10.x"] {
            assert_eq!(line("A", 1, bad).price_minor(), None, "price {bad:?}");
        }
    }

    #[test]
    fn totals_multiply_quantity() {
        let lines = vec![line("A", 2, "10.00"), line("B", 1, "0.50")];
        assert_eq!(OrderCreate::total_minor(&lines), Some(2050));
    }

    #[test]
    fn command_round_trips_as_camel_case() {
        let cmd = OrderCreate {
            customer_id: "c1".to_string(),
            user_id: Uuid::new_v4(),
            lines: vec![line("A", 2, "10.00")],
            currency_code: "EUR".to_string(),
            total_amount_minor: 2000,
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["customerId"], "c1");
        assert_eq!(value["totalAmountMinor"], 2000);
        let parsed: OrderCreate = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, cmd);
    }
}
