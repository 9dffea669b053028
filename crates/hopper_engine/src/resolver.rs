//! Batch lookup resolver: one store query per upsert batch.
//!
//! Given a batch of candidate records and the configured unique-field names,
//! the resolver canonicalizes each candidate's key tuple, issues a single
//! `find_by_any` query for all distinct keys, and hands the executor a
//! key → existing-record table. Store round-trips stay constant per batch no
//! matter how many candidates it holds.

use std::collections::{HashMap, HashSet};

use hopper_protocol::types::Record;
use serde_json::Value;
use tracing::debug;

use crate::store::{RecordStore, StoreResult, StoredRecord};

/// Canonical tuple of a record's unique-field values, in field order.
///
/// Tuples are hashable and compare by exact canonical value. A record with
/// any unique field absent, JSON null, or empty string has no key at all and
/// can never match an existing record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyTuple(Vec<String>);

impl KeyTuple {
    /// Extract the key tuple for `record`, or `None` if any unique field
    /// carries no usable value.
    pub fn from_record(record: &Record, fields: &[String]) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            values.push(canonical_value(record.get(field)?)?);
        }
        Some(Self(values))
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }
}

/// Canonical text form of one key component. Integral floats collapse to
/// their integer rendering so `2` and `2.0` form the same key.
fn canonical_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64()?;
                if f.fract() == 0.0 && f.abs() < 9e15 {
                    Some((f as i64).to_string())
                } else {
                    Some(f.to_string())
                }
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Key → existing record table built from one batch lookup.
#[derive(Debug, Default)]
pub struct LookupTable {
    matches: HashMap<KeyTuple, StoredRecord>,
}

impl LookupTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &KeyTuple) -> Option<&StoredRecord> {
        self.matches.get(key)
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Resolve one batch of candidates against the store.
///
/// Issues at most one `find_by_any` call; zero when no candidate produces a
/// key (then every record is a create and there is nothing to look up).
/// Duplicate keys within the batch share one table entry; the executor's
/// document-order application decides who wins.
pub async fn resolve_batch(
    store: &dyn RecordStore,
    fields: &[String],
    batch: &[Record],
) -> StoreResult<LookupTable> {
    let mut keys = Vec::new();
    let mut seen = HashSet::new();
    for record in batch {
        if let Some(key) = KeyTuple::from_record(record, fields) {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
    }

    if keys.is_empty() {
        return Ok(LookupTable::empty());
    }

    let found = store.find_by_any(fields, &keys).await?;
    let mut matches = HashMap::with_capacity(found.len());
    for stored in found {
        if let Some(key) = KeyTuple::from_record(&stored.fields, fields) {
            matches.insert(key, stored);
        }
    }

    debug!(
        candidates = batch.len(),
        distinct_keys = keys.len(),
        matched = matches.len(),
        "Batch lookup resolved"
    );
    Ok(LookupTable { matches })
}
