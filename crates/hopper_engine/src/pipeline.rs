//! Multi-stage pipeline jobs: import, aggregate, score, offer.
//!
//! The import stage is a plain create run under the job's batch loop; every
//! later stage is gated on the import having completed and is fed from the
//! job's created-id list, never from the raw submission. The report is
//! stored before `aggregates_completed` flips, so a failure in any stage
//! leaves the flag clear and the aggregate stage re-runnable.

use std::collections::BTreeMap;
use std::sync::Arc;

use hopper_protocol::config::EngineConfig;
use hopper_protocol::pipeline::{
    AggregateConfig, AggregateGroup, CreditModelConfig, Offer, PipelineReport, PipelineSummary,
    ScoreResult,
};
use hopper_protocol::types::{JobId, JobState, JobType, Record};
use hopper_state::{StateStore, Transition};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::executor::BulkExecutor;
use crate::scoring::{OfferModel, ScoreModel, IS_REVENUE_FIELD, REVENUE_TOTAL_FIELD};
use crate::store::{RecordStore, RecordValidator, StoredRecord};

/// Runs one pipeline job end to end, or its aggregate stage on demand.
pub(crate) struct PipelineRunner {
    state: StateStore,
    store: Arc<dyn RecordStore>,
    validator: Option<Arc<dyn RecordValidator>>,
    score_model: Arc<dyn ScoreModel>,
    offer_model: Arc<dyn OfferModel>,
    config: EngineConfig,
}

impl PipelineRunner {
    pub(crate) fn new(
        state: StateStore,
        store: Arc<dyn RecordStore>,
        validator: Option<Arc<dyn RecordValidator>>,
        score_model: Arc<dyn ScoreModel>,
        offer_model: Arc<dyn OfferModel>,
        config: EngineConfig,
    ) -> Self {
        Self { state, store, validator, score_model, offer_model, config }
    }

    /// Execute a claimed pipeline job: import `records`, then aggregate,
    /// score and generate offers over what the import created.
    ///
    /// A stage failure fails the job while it is still non-terminal. Once the
    /// import has completed the fail CAS refuses, the imported records stand,
    /// and `aggregates_completed` stays clear so the aggregate stage can be
    /// re-run.
    pub(crate) async fn run(
        &self,
        job_id: &JobId,
        records: Vec<Record>,
        aggregate: &AggregateConfig,
        model: &CreditModelConfig,
    ) -> Result<()> {
        if let Err(err) = self.run_stages(job_id, records, aggregate, model).await {
            match self.state.fail(job_id, &err.to_string()).await {
                Ok(Transition::Applied) => {}
                Ok(Transition::Refused { current }) => {
                    debug!(job_id = %job_id, state = %current, "Stage failed after import completion");
                }
                Err(state_err) => {
                    error!(job_id = %job_id, error = %state_err, "Could not record stage failure");
                }
            }
            return Err(err);
        }
        Ok(())
    }

    async fn run_stages(
        &self,
        job_id: &JobId,
        records: Vec<Record>,
        aggregate: &AggregateConfig,
        model: &CreditModelConfig,
    ) -> Result<()> {
        let importer = BulkExecutor::new(
            self.state.clone(),
            self.store.clone(),
            self.validator.clone(),
            self.config.clone(),
        );
        importer.run(job_id, JobType::Pipeline, records, None).await?;

        // Later stages run only off a completed import. An abort mid-import
        // or a lost completion race ends the pipeline here, quietly.
        let job = self.state.get_job(job_id).await?;
        if job.state != JobState::JobComplete || !job.aggregates_ready {
            info!(job_id = %job_id, state = %job.state, "Import did not complete; skipping aggregate stages");
            return Ok(());
        }

        let stored = match self.store.fetch(&job.result_ids.created).await {
            Ok(stored) => stored,
            Err(err) => {
                // Import results stand; the aggregate stage stays re-runnable.
                error!(job_id = %job_id, error = %err, "Fetch of imported records failed");
                return Err(err.into());
            }
        };
        let groups = aggregate_records(&stored, aggregate);

        let mut scores: Vec<ScoreResult> = Vec::with_capacity(groups.len());
        for group in &groups {
            scores.push(self.score_model.score(group, model).await?);
        }
        let mut offers: Vec<Offer> = Vec::new();
        for (group, score) in groups.iter().zip(&scores) {
            offers.extend(self.offer_model.offers(group, score, model).await?);
        }

        let report = PipelineReport {
            summary: PipelineSummary {
                transactions_processed: job.success_count,
                aggregates_created: groups.len() as u64,
                offers_generated: offers.len() as u64,
            },
            aggregates: groups,
            scores,
            offers,
        };
        self.state.store_pipeline_report(job_id, &report).await?;

        match self.state.mark_aggregates_completed(job_id).await? {
            Transition::Applied => {
                info!(
                    job_id = %job_id,
                    aggregates = report.summary.aggregates_created,
                    offers = report.summary.offers_generated,
                    "Pipeline complete"
                );
            }
            Transition::Refused { current } => {
                warn!(job_id = %job_id, state = %current, "Aggregate completion refused");
            }
        }
        Ok(())
    }

    /// Re-aggregate a completed import on demand, without scoring. Returns
    /// the stored report unchanged when aggregates already completed; errors
    /// when the import has not finished.
    pub(crate) async fn run_aggregates(
        &self,
        job_id: &JobId,
        aggregate: &AggregateConfig,
    ) -> Result<PipelineReport> {
        let job = self.state.get_job(job_id).await?;
        if job.aggregates_completed {
            return match self.state.get_pipeline_report(job_id).await? {
                Some(report) => Ok(report),
                None => Err(EngineError::not_found(format!(
                    "no pipeline report stored for job {job_id}"
                ))),
            };
        }
        if job.state != JobState::JobComplete || !job.aggregates_ready {
            return Err(EngineError::conflict(format!(
                "aggregates not ready: job {job_id} is {}",
                job.state
            )));
        }

        let stored = self.store.fetch(&job.result_ids.created).await?;
        let groups = aggregate_records(&stored, aggregate);
        let report = PipelineReport {
            summary: PipelineSummary {
                transactions_processed: job.success_count,
                aggregates_created: groups.len() as u64,
                offers_generated: 0,
            },
            aggregates: groups,
            scores: Vec::new(),
            offers: Vec::new(),
        };
        self.state.store_pipeline_report(job_id, &report).await?;
        match self.state.mark_aggregates_completed(job_id).await? {
            Transition::Applied => {
                info!(job_id = %job_id, aggregates = report.summary.aggregates_created, "Aggregates complete");
            }
            Transition::Refused { current } => {
                warn!(job_id = %job_id, state = %current, "Aggregate completion refused");
            }
        }
        Ok(report)
    }
}

// ============================================================================
// Aggregation
// ============================================================================

/// Group records by the configured field and sum the configured amount
/// fields per group. Revenue-flagged records additionally roll their first
/// amount field into the revenue bucket. Records without a usable group key
/// are skipped; groups come back sorted by key.
fn aggregate_records(records: &[StoredRecord], config: &AggregateConfig) -> Vec<AggregateGroup> {
    let mut groups: BTreeMap<String, AggregateGroup> = BTreeMap::new();
    for stored in records {
        let Some(key) = group_key(stored.fields.get(&config.group_by)) else {
            debug!(record_id = %stored.id, field = %config.group_by, "No group key; record skipped");
            continue;
        };
        let entry = groups.entry(key.clone()).or_insert_with(|| AggregateGroup {
            group: key,
            record_count: 0,
            totals: BTreeMap::new(),
        });
        entry.record_count += 1;
        for field in &config.amount_fields {
            if let Some(amount) = stored.fields.get(field).and_then(Value::as_f64) {
                *entry.totals.entry(field.clone()).or_insert(0.0) += amount;
            }
        }
        if stored.fields.get(IS_REVENUE_FIELD).and_then(Value::as_bool) == Some(true) {
            if let Some(first) = config.amount_fields.first() {
                if let Some(amount) = stored.fields.get(first).and_then(Value::as_f64) {
                    *entry.totals.entry(REVENUE_TOTAL_FIELD.to_string()).or_insert(0.0) += amount;
                }
            }
        }
    }
    groups.into_values().collect()
}

fn group_key(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
