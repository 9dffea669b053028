//! Bulk executors: the batch loops behind every job type.
//!
//! One routine per operation kind, each slicing the job's input into
//! fixed-size batches and applying every batch as set-based store calls.
//! Per-record problems (validation, missing identifiers, ids that matched
//! nothing) are appended to the job's error log and never stop the run; a
//! store-level failure marks the in-flight records as errors, fails the job,
//! and leaves later batches untouched. Before each batch the executor
//! re-reads job state and stops quietly once the job is no longer
//! IN_PROGRESS, which is what makes abort advisory.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use hopper_protocol::api::UpsertOptions;
use hopper_protocol::config::EngineConfig;
use hopper_protocol::types::{
    ErrorEntry, JobId, JobState, JobType, OutcomeKind, ProgressDelta, Record, RecordId, ResultIds,
};
use hopper_state::{StateStore, Transition};
use tracing::{debug, error, info};

use crate::error::{EngineError, Result};
use crate::resolver::{self, KeyTuple};
use crate::store::{RecordStore, RecordUpdate, RecordValidator, StoreResult};

// ============================================================================
// Progress tracking
// ============================================================================

/// Buffers per-record outcomes and writes them to the state store every
/// `stride` processed items; the batch loop flushes the remainder so the
/// batch-final write always lands.
struct ProgressTracker<'a> {
    state: &'a StateStore,
    job_id: &'a JobId,
    stride: u64,
    pending: ProgressDelta,
}

impl<'a> ProgressTracker<'a> {
    fn new(state: &'a StateStore, job_id: &'a JobId, stride: u64) -> Self {
        Self { state, job_id, stride: stride.max(1), pending: ProgressDelta::default() }
    }

    fn record_error(&mut self, item_index: u64, message: String) {
        self.pending.processed += 1;
        self.pending.failed += 1;
        self.pending.errors.push(ErrorEntry::new(item_index, message));
    }

    fn record_successes(&mut self, count: u64) {
        self.pending.processed += count;
        self.pending.succeeded += count;
    }

    fn push_result(&mut self, kind: OutcomeKind, id: RecordId) {
        self.pending.results.push(kind, id);
    }

    /// Flush if the buffered delta reached the stride.
    async fn checkpoint(&mut self) -> Result<()> {
        if self.pending.processed >= self.stride {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let delta = std::mem::take(&mut self.pending);
        match self.state.record_progress(self.job_id, &delta).await? {
            Transition::Applied => Ok(()),
            Transition::Refused { current } => {
                // The job went terminal under us; its snapshot stays frozen.
                debug!(job_id = %self.job_id, state = %current, "Late progress dropped");
                Ok(())
            }
        }
    }
}

/// Run a store call that covers `covered` item indexes; on failure every
/// covered record gets an error entry before the failure propagates.
async fn guarded<T>(
    call: impl Future<Output = StoreResult<T>>,
    covered: &[u64],
    progress: &mut ProgressTracker<'_>,
) -> Result<T> {
    match call.await {
        Ok(value) => Ok(value),
        Err(err) => {
            let message = err.to_string();
            for &index in covered {
                progress.record_error(index, message.clone());
            }
            Err(err.into())
        }
    }
}

// ============================================================================
// Upsert planning
// ============================================================================

/// Per-job upsert settings, resolved once before batching starts.
struct UpsertPlan {
    unique_fields: Vec<String>,
    update_fields: Vec<String>,
}

impl UpsertPlan {
    fn prepare(
        records: &[Record],
        options: Option<&UpsertOptions>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let options = options
            .ok_or_else(|| EngineError::invalid("upsert requires unique_fields"))?;
        if options.unique_fields.is_empty() {
            return Err(EngineError::invalid("upsert requires a non-empty unique_fields list"));
        }
        let update_fields = match &options.update_fields {
            Some(fields) => fields.clone(),
            None => infer_update_fields(records.first(), &options.unique_fields, &config.id_field),
        };
        Ok(Self { unique_fields: options.unique_fields.clone(), update_fields })
    }
}

/// Absent `update_fields` default to every field present on the first data
/// record, minus the unique fields, minus the identifier, sorted.
fn infer_update_fields(
    first: Option<&Record>,
    unique_fields: &[String],
    id_field: &str,
) -> Vec<String> {
    let Some(record) = first else {
        return Vec::new();
    };
    let mut fields: Vec<String> = record
        .keys()
        .filter(|key| !unique_fields.contains(key) && key.as_str() != id_field)
        .cloned()
        .collect();
    fields.sort();
    fields
}

// ============================================================================
// Executor
// ============================================================================

/// Drives one claimed job's batches against the record store.
pub(crate) struct BulkExecutor {
    state: StateStore,
    store: Arc<dyn RecordStore>,
    validator: Option<Arc<dyn RecordValidator>>,
    config: EngineConfig,
}

impl BulkExecutor {
    pub(crate) fn new(
        state: StateStore,
        store: Arc<dyn RecordStore>,
        validator: Option<Arc<dyn RecordValidator>>,
        config: EngineConfig,
    ) -> Self {
        Self { state, store, validator, config }
    }

    /// Execute `records` as `job_type` under a job that is already
    /// IN_PROGRESS. Transitions the job to JOB_COMPLETE, or to FAILED on a
    /// store-level error; stops quietly if the job leaves IN_PROGRESS
    /// between batches.
    pub(crate) async fn run(
        &self,
        job_id: &JobId,
        job_type: JobType,
        records: Vec<Record>,
        upsert: Option<&UpsertOptions>,
    ) -> Result<()> {
        let plan = match job_type {
            JobType::Upsert => Some(UpsertPlan::prepare(&records, upsert, &self.config)?),
            _ => None,
        };

        let total = records.len();
        let mut base_index = 0u64;
        for (batch_no, batch) in records.chunks(self.config.batch_size.max(1)).enumerate() {
            let current = self.state.get_job_state(job_id).await?;
            if current != JobState::InProgress {
                info!(job_id = %job_id, state = %current, "Job left IN_PROGRESS; stopping");
                return Ok(());
            }

            let mut progress = ProgressTracker::new(&self.state, job_id, self.config.progress_stride);
            let outcome = self
                .apply_batch(job_type, batch, base_index, plan.as_ref(), &mut progress)
                .await;
            // What we know about this batch lands even when it failed.
            progress.flush().await?;

            if let Err(err) = outcome {
                if let EngineError::Store(store_err) = &err {
                    error!(job_id = %job_id, batch = batch_no + 1, error = %store_err, "Batch failed; failing job");
                    let _ = self.state.fail(job_id, &store_err.to_string()).await?;
                }
                return Err(err);
            }
            base_index += batch.len() as u64;
            debug!(job_id = %job_id, batch = batch_no + 1, "Batch complete");
        }

        match self.state.complete(job_id, ResultIds::default()).await? {
            Transition::Applied => {
                info!(job_id = %job_id, total, "Job complete");
            }
            Transition::Refused { current } => {
                debug!(job_id = %job_id, state = %current, "Completion refused; job already terminal");
            }
        }
        Ok(())
    }

    async fn apply_batch(
        &self,
        job_type: JobType,
        batch: &[Record],
        base_index: u64,
        plan: Option<&UpsertPlan>,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<()> {
        match job_type {
            JobType::Create | JobType::Pipeline => {
                self.create_batch(batch, base_index, progress).await
            }
            JobType::Update => {
                self.write_batch(batch, base_index, WriteMode::Update, progress).await
            }
            JobType::Replace => {
                self.write_batch(batch, base_index, WriteMode::Replace, progress).await
            }
            JobType::Delete => self.delete_batch(batch, base_index, progress).await,
            JobType::Upsert => {
                let plan =
                    plan.ok_or_else(|| EngineError::invalid("upsert requires unique_fields"))?;
                self.upsert_batch(batch, base_index, plan, progress).await
            }
        }
    }

    /// One set-based insert of the batch's valid records.
    async fn create_batch(
        &self,
        batch: &[Record],
        base_index: u64,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<()> {
        let mut payloads = Vec::with_capacity(batch.len());
        let mut indexes = Vec::with_capacity(batch.len());
        for (offset, record) in batch.iter().enumerate() {
            let index = base_index + offset as u64;
            if let Some(message) = self.validation_failure(record) {
                progress.record_error(index, message);
                progress.checkpoint().await?;
                continue;
            }
            payloads.push(record.clone());
            indexes.push(index);
        }

        if payloads.is_empty() {
            return Ok(());
        }
        let ids = guarded(self.store.bulk_insert(payloads), &indexes, progress).await?;
        progress.record_successes(indexes.len() as u64);
        for id in ids {
            progress.push_result(OutcomeKind::Created, id);
        }
        Ok(())
    }

    /// One set-based update or replace over the batch's identified records.
    async fn write_batch(
        &self,
        batch: &[Record],
        base_index: u64,
        mode: WriteMode,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<()> {
        let id_field = self.config.id_field.clone();
        let mut updates = Vec::new();
        let mut submitted: Vec<(u64, RecordId)> = Vec::new();
        for (offset, record) in batch.iter().enumerate() {
            let index = base_index + offset as u64;
            match record.get(&id_field).and_then(RecordId::from_value) {
                None => {
                    progress
                        .record_error(index, format!("missing identifier field '{id_field}'"));
                    progress.checkpoint().await?;
                }
                Some(id) => {
                    let mut fields = record.clone();
                    fields.remove(&id_field);
                    submitted.push((index, id.clone()));
                    updates.push(RecordUpdate::new(id, fields));
                }
            }
        }

        if updates.is_empty() {
            return Ok(());
        }
        let covered: Vec<u64> = submitted.iter().map(|(index, _)| *index).collect();
        let applied = match mode {
            WriteMode::Update => {
                guarded(self.store.bulk_update(updates), &covered, progress).await?
            }
            WriteMode::Replace => {
                guarded(self.store.bulk_replace(updates), &covered, progress).await?
            }
        };
        self.settle_writes(submitted, applied, OutcomeKind::Updated, progress).await
    }

    /// One set-based delete of the batch's identifiers.
    async fn delete_batch(
        &self,
        batch: &[Record],
        base_index: u64,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<()> {
        let id_field = self.config.id_field.clone();
        let mut ids = Vec::new();
        let mut submitted: Vec<(u64, RecordId)> = Vec::new();
        for (offset, record) in batch.iter().enumerate() {
            let index = base_index + offset as u64;
            match record.get(&id_field).and_then(RecordId::from_value) {
                None => {
                    progress
                        .record_error(index, format!("missing identifier field '{id_field}'"));
                    progress.checkpoint().await?;
                }
                Some(id) => {
                    submitted.push((index, id.clone()));
                    ids.push(id);
                }
            }
        }

        if ids.is_empty() {
            return Ok(());
        }
        let covered: Vec<u64> = submitted.iter().map(|(index, _)| *index).collect();
        let deleted = guarded(self.store.bulk_delete(ids), &covered, progress).await?;
        self.settle_writes(submitted, deleted, OutcomeKind::Deleted, progress).await
    }

    /// One lookup, one bulk create, one bulk update - regardless of batch
    /// size. Records sharing a key with no existing match coalesce to the
    /// last payload in document order; update-path writes apply in document
    /// order so the last write for a duplicate key wins.
    async fn upsert_batch(
        &self,
        batch: &[Record],
        base_index: u64,
        plan: &UpsertPlan,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<()> {
        let all_indexes: Vec<u64> = (0..batch.len() as u64).map(|o| base_index + o).collect();
        let table = guarded(
            resolver::resolve_batch(self.store.as_ref(), &plan.unique_fields, batch),
            &all_indexes,
            progress,
        )
        .await?;

        struct CreateSlot {
            record: Record,
            indexes: Vec<u64>,
        }
        let mut create_slots: Vec<CreateSlot> = Vec::new();
        let mut slot_by_key: HashMap<KeyTuple, usize> = HashMap::new();
        let mut updates: Vec<RecordUpdate> = Vec::new();
        let mut update_submitted: Vec<(u64, RecordId)> = Vec::new();

        for (offset, record) in batch.iter().enumerate() {
            let index = base_index + offset as u64;
            let key = KeyTuple::from_record(record, &plan.unique_fields);
            match key.as_ref().and_then(|k| table.get(k)) {
                Some(existing) => {
                    let mut fields = Record::new();
                    for field in &plan.update_fields {
                        if let Some(value) = record.get(field) {
                            fields.insert(field.clone(), value.clone());
                        }
                    }
                    update_submitted.push((index, existing.id.clone()));
                    updates.push(RecordUpdate::new(existing.id.clone(), fields));
                }
                None => match key {
                    Some(key) => match slot_by_key.get(&key) {
                        Some(&slot) => {
                            // Duplicate key: the later record is the intended
                            // state; everyone who contributed still counts.
                            create_slots[slot].record = record.clone();
                            create_slots[slot].indexes.push(index);
                        }
                        None => {
                            slot_by_key.insert(key, create_slots.len());
                            create_slots
                                .push(CreateSlot { record: record.clone(), indexes: vec![index] });
                        }
                    },
                    None => {
                        // No usable key: always a create, never coalesced.
                        create_slots
                            .push(CreateSlot { record: record.clone(), indexes: vec![index] });
                    }
                },
            }
        }

        if !create_slots.is_empty() {
            let covered: Vec<u64> =
                create_slots.iter().flat_map(|slot| slot.indexes.iter().copied()).collect();
            let payloads: Vec<Record> =
                create_slots.iter().map(|slot| slot.record.clone()).collect();
            let ids = guarded(self.store.bulk_insert(payloads), &covered, progress).await?;
            for (slot, id) in create_slots.iter().zip(ids) {
                progress.record_successes(slot.indexes.len() as u64);
                progress.push_result(OutcomeKind::Created, id);
            }
            progress.checkpoint().await?;
        }

        if !updates.is_empty() {
            let covered: Vec<u64> = update_submitted.iter().map(|(index, _)| *index).collect();
            let applied = guarded(self.store.bulk_update(updates), &covered, progress).await?;
            self.settle_writes(update_submitted, applied, OutcomeKind::Updated, progress).await?;
        }
        Ok(())
    }

    /// Count each submitted write as a success or a missing-record error.
    /// `applied` carries one id per write that landed, in input order, so a
    /// multiset diff attributes duplicates correctly.
    async fn settle_writes(
        &self,
        submitted: Vec<(u64, RecordId)>,
        applied: Vec<RecordId>,
        kind: OutcomeKind,
        progress: &mut ProgressTracker<'_>,
    ) -> Result<()> {
        let mut remaining: HashMap<&RecordId, usize> = HashMap::new();
        for id in &applied {
            *remaining.entry(id).or_insert(0) += 1;
        }
        for (index, id) in &submitted {
            match remaining.get_mut(id) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    progress.record_successes(1);
                    progress.push_result(kind, id.clone());
                }
                _ => {
                    progress.record_error(*index, format!("no stored record with id '{id}'"));
                }
            }
            progress.checkpoint().await?;
        }
        Ok(())
    }

    /// Joined validation message for a rejected record, if any.
    fn validation_failure(&self, record: &Record) -> Option<String> {
        let validator = self.validator.as_ref()?;
        let failures = validator.validate(record);
        if failures.is_empty() {
            return None;
        }
        Some(failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; "))
    }
}

#[derive(Clone, Copy)]
enum WriteMode {
    Update,
    Replace,
}
