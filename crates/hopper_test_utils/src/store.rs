//! In-memory [`RecordStore`] double.
//!
//! Sequential numeric ids, per-call counters, injectable call failures, and
//! an insert gate that lets a test hold all inserts at a barrier while it
//! asserts on intermediate state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use hopper_engine::resolver::KeyTuple;
use hopper_engine::store::{RecordStore, RecordUpdate, StoreError, StoreResult, StoredRecord};
use hopper_protocol::types::{Record, RecordId};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

/// Snapshot of how many times each store call ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub insert_calls: usize,
    pub update_calls: usize,
    pub replace_calls: usize,
    pub delete_calls: usize,
    pub lookup_calls: usize,
    pub fetch_calls: usize,
}

/// Guard from [`MemoryRecordStore::pause_inserts`]; every `bulk_insert`
/// blocks at the gate until it drops.
pub struct InsertPause {
    _guard: OwnedRwLockWriteGuard<()>,
}

const NEVER: usize = usize::MAX;

pub struct MemoryRecordStore {
    inner: Mutex<StoreInner>,
    insert_gate: Arc<RwLock<()>>,
    insert_calls: AtomicUsize,
    update_calls: AtomicUsize,
    replace_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    insert_fail_after: AtomicUsize,
    update_fail_after: AtomicUsize,
}

struct StoreInner {
    records: BTreeMap<RecordId, Record>,
    next_id: u64,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner { records: BTreeMap::new(), next_id: 1 }),
            insert_gate: Arc::new(RwLock::new(())),
            insert_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            replace_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            lookup_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            insert_fail_after: AtomicUsize::new(NEVER),
            update_fail_after: AtomicUsize::new(NEVER),
        }
    }

    /// Insert directly, bypassing counters and the gate. For arranging
    /// preconditions.
    pub fn seed(&self, fields: Record) -> RecordId {
        let mut inner = self.lock();
        let id = RecordId::from(inner.next_id);
        inner.next_id += 1;
        inner.records.insert(id.clone(), fields);
        id
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.lock().records.get(id).cloned()
    }

    /// Every stored record, in id order.
    pub fn all(&self) -> Vec<StoredRecord> {
        self.lock()
            .records
            .iter()
            .map(|(id, fields)| StoredRecord::new(id.clone(), fields.clone()))
            .collect()
    }

    pub fn counts(&self) -> StoreCallCounts {
        StoreCallCounts {
            insert_calls: self.insert_calls.load(Ordering::SeqCst),
            update_calls: self.update_calls.load(Ordering::SeqCst),
            replace_calls: self.replace_calls.load(Ordering::SeqCst),
            delete_calls: self.delete_calls.load(Ordering::SeqCst),
            lookup_calls: self.lookup_calls.load(Ordering::SeqCst),
            fetch_calls: self.fetch_calls.load(Ordering::SeqCst),
        }
    }

    /// Let the first `calls` insert calls through, then error every later
    /// one. The failing call still counts.
    pub fn fail_after_insert_calls(&self, calls: usize) {
        self.insert_fail_after.store(calls, Ordering::SeqCst);
    }

    /// Same knob for update and replace calls.
    pub fn fail_after_update_calls(&self, calls: usize) {
        self.update_fail_after.store(calls, Ordering::SeqCst);
    }

    /// Hold every subsequent `bulk_insert` at the gate until the returned
    /// guard drops.
    pub async fn pause_inserts(&self) -> InsertPause {
        InsertPause { _guard: self.insert_gate.clone().write_owned().await }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("record store mutex poisoned")
    }

    fn count(&self, counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn charge(&self, counter: &AtomicUsize, fail_after: &AtomicUsize) -> StoreResult<()> {
        let calls = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if calls > fail_after.load(Ordering::SeqCst) {
            return Err(StoreError::msg("injected record store outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn bulk_insert(&self, records: Vec<Record>) -> StoreResult<Vec<RecordId>> {
        // count on arrival so a paused call is still observable
        self.charge(&self.insert_calls, &self.insert_fail_after)?;
        let _permit = self.insert_gate.read().await;
        let mut inner = self.lock();
        let mut ids = Vec::with_capacity(records.len());
        for fields in records {
            let id = RecordId::from(inner.next_id);
            inner.next_id += 1;
            inner.records.insert(id.clone(), fields);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn bulk_update(&self, updates: Vec<RecordUpdate>) -> StoreResult<Vec<RecordId>> {
        self.charge(&self.update_calls, &self.update_fail_after)?;
        let mut inner = self.lock();
        let mut applied = Vec::new();
        for update in updates {
            if let Some(existing) = inner.records.get_mut(&update.id) {
                for (field, value) in update.fields {
                    existing.insert(field, value);
                }
                applied.push(update.id);
            }
        }
        Ok(applied)
    }

    async fn bulk_replace(&self, updates: Vec<RecordUpdate>) -> StoreResult<Vec<RecordId>> {
        self.charge(&self.replace_calls, &self.update_fail_after)?;
        let mut inner = self.lock();
        let mut applied = Vec::new();
        for update in updates {
            if let Some(existing) = inner.records.get_mut(&update.id) {
                *existing = update.fields;
                applied.push(update.id);
            }
        }
        Ok(applied)
    }

    async fn bulk_delete(&self, ids: Vec<RecordId>) -> StoreResult<Vec<RecordId>> {
        self.count(&self.delete_calls);
        let mut inner = self.lock();
        let mut removed = Vec::new();
        for id in ids {
            if inner.records.remove(&id).is_some() {
                removed.push(id);
            }
        }
        Ok(removed)
    }

    async fn find_by_any(
        &self,
        fields: &[String],
        keys: &[KeyTuple],
    ) -> StoreResult<Vec<StoredRecord>> {
        self.count(&self.lookup_calls);
        let inner = self.lock();
        let mut found = Vec::new();
        for (id, fields_stored) in &inner.records {
            if let Some(key) = KeyTuple::from_record(fields_stored, fields) {
                if keys.contains(&key) {
                    found.push(StoredRecord::new(id.clone(), fields_stored.clone()));
                }
            }
        }
        Ok(found)
    }

    async fn fetch(&self, ids: &[RecordId]) -> StoreResult<Vec<StoredRecord>> {
        self.count(&self.fetch_calls);
        let inner = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                inner.records.get(id).map(|fields| StoredRecord::new(id.clone(), fields.clone()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::record;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sequential_ids_and_write_modes() {
        let store = MemoryRecordStore::new();
        let ids = store
            .bulk_insert(vec![
                record(&[("a", json!(1)), ("b", json!(2))]),
                record(&[("a", json!(3))]),
            ])
            .await
            .unwrap();
        assert_eq!(ids, vec![RecordId::from(1u64), RecordId::from(2u64)]);

        // update merges, replace substitutes
        store
            .bulk_update(vec![RecordUpdate::new(ids[0].clone(), record(&[("a", json!(9))]))])
            .await
            .unwrap();
        assert_eq!(store.get(&ids[0]).unwrap()["b"], json!(2));

        store
            .bulk_replace(vec![RecordUpdate::new(ids[0].clone(), record(&[("a", json!(9))]))])
            .await
            .unwrap();
        assert!(store.get(&ids[0]).unwrap().get("b").is_none());

        let counts = store.counts();
        assert_eq!(counts.insert_calls, 1);
        assert_eq!(counts.update_calls, 1);
        assert_eq!(counts.replace_calls, 1);
    }

    #[tokio::test]
    async fn test_missing_ids_are_absent_from_applied() {
        let store = MemoryRecordStore::new();
        let known = store.seed(record(&[("a", json!(1))]));

        let applied = store
            .bulk_update(vec![
                RecordUpdate::new(RecordId::from("ghost"), record(&[("a", json!(2))])),
                RecordUpdate::new(known.clone(), record(&[("a", json!(2))])),
            ])
            .await
            .unwrap();
        assert_eq!(applied, vec![known.clone()]);

        let removed =
            store.bulk_delete(vec![RecordId::from("ghost"), known.clone()]).await.unwrap();
        assert_eq!(removed, vec![known]);
    }

    #[tokio::test]
    async fn test_fail_after_insert_calls_counts_the_failure() {
        let store = MemoryRecordStore::new();
        store.fail_after_insert_calls(1);

        store.bulk_insert(vec![record(&[("n", json!(1))])]).await.unwrap();
        let err = store.bulk_insert(vec![record(&[("n", json!(2))])]).await.unwrap_err();
        assert!(err.to_string().contains("record store failure"));
        assert_eq!(store.counts().insert_calls, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_pause_inserts_blocks_until_released() {
        let store = Arc::new(MemoryRecordStore::new());
        let pause = store.pause_inserts().await;

        let worker = {
            let store = store.clone();
            tokio::spawn(async move {
                store.bulk_insert(vec![record(&[("n", json!(1))])]).await.unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!worker.is_finished(), "insert must wait at the gate");
        assert_eq!(store.counts().insert_calls, 1, "the waiting call is already counted");
        assert_eq!(store.len(), 0);

        drop(pause);
        worker.await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_find_by_any_matches_canonical_keys() {
        let store = MemoryRecordStore::new();
        let a = store.seed(record(&[("sku", json!("a")), ("qty", json!(1))]));
        store.seed(record(&[("sku", json!("b")), ("qty", json!(2))]));

        let fields = vec!["sku".to_string()];
        let key = KeyTuple::from_record(&record(&[("sku", json!("a"))]), &fields).unwrap();
        let found = store.find_by_any(&fields, &[key]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a);
    }
}
