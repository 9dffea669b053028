//! Record validators.

use hopper_engine::store::{FieldError, RecordValidator};
use hopper_protocol::types::Record;
use serde_json::Value;

/// Fails records where any required field is absent, JSON null, or an empty
/// string.
#[derive(Debug, Clone)]
pub struct RequiredFieldsValidator {
    required: Vec<String>,
}

impl RequiredFieldsValidator {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { required: required.into_iter().map(Into::into).collect() }
    }
}

impl RecordValidator for RequiredFieldsValidator {
    fn validate(&self, record: &Record) -> Vec<FieldError> {
        let mut failures = Vec::new();
        for field in &self.required {
            let missing = match record.get(field) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            };
            if missing {
                failures.push(FieldError::new(field, "required field is missing"));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::record;
    use serde_json::json;

    #[test]
    fn test_flags_absent_null_and_empty() {
        let validator = RequiredFieldsValidator::new(["amount", "date"]);

        let good = record(&[("amount", json!(10.0)), ("date", json!("2024-01-01"))]);
        assert!(validator.validate(&good).is_empty());

        let missing = record(&[("date", json!("2024-01-01"))]);
        let failures = validator.validate(&missing);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].field, "amount");

        let bad = record(&[("amount", json!(null)), ("date", json!(""))]);
        assert_eq!(validator.validate(&bad).len(), 2);
    }
}
