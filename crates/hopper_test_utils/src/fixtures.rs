//! Record builders.

use hopper_protocol::types::Record;
use serde_json::{json, Value};

/// Build a record from field/value pairs.
pub fn record(fields: &[(&str, Value)]) -> Record {
    fields.iter().map(|(name, value)| (name.to_string(), value.clone())).collect()
}

/// A transaction-shaped record, as pipeline tests feed them.
pub fn transaction(date: &str, amount: f64, is_revenue: bool) -> Record {
    record(&[
        ("date", json!(date)),
        ("amount", json!(amount)),
        ("is_revenue", json!(is_revenue)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder_keeps_values() {
        let r = record(&[("name", json!("widget")), ("qty", json!(3))]);
        assert_eq!(r.len(), 2);
        assert_eq!(r["name"], json!("widget"));
        assert_eq!(r["qty"], json!(3));
    }

    #[test]
    fn test_transaction_shape() {
        let t = transaction("2024-01-01", 99.5, true);
        assert_eq!(t["date"], json!("2024-01-01"));
        assert_eq!(t["amount"], json!(99.5));
        assert_eq!(t["is_revenue"], json!(true));
    }
}
