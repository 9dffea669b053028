//! Shared fixtures and doubles for Hopper tests.
//!
//! Centralizes what engine and integration tests keep re-needing: an
//! in-memory record store with call counting, failure injection and an
//! insert gate; record builders; and a field-presence validator.
//!
//! ```rust,ignore
//! use hopper_test_utils::{record, MemoryRecordStore};
//! use serde_json::json;
//!
//! let store = MemoryRecordStore::new();
//! let id = store.seed(record(&[("sku", json!("a")), ("qty", json!(1))]));
//!
//! store.fail_after_insert_calls(2); // third bulk_insert errors
//! assert_eq!(store.counts().insert_calls, 0);
//! ```
//!
//! This crate is a dev-dependency of the crates it serves; it never ships
//! in a release build.

pub mod fixtures;
pub mod store;
pub mod validators;

pub use fixtures::{record, transaction};
pub use store::{InsertPause, MemoryRecordStore, StoreCallCounts};
pub use validators::RequiredFieldsValidator;
