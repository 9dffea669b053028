//! The engine facade: submission surface, builder and lifecycle.
//!
//! Submissions at or under the sync threshold run inline and return a full
//! report; larger ones persist their input, get a durable job row and run on
//! the worker pool. Either way the same batch executors do the work, so the
//! two paths cannot drift.

use std::sync::Arc;

use hopper_protocol::api::{
    status_url, ChunkAck, ChunkSubmission, JobHandle, JobStatusResponse, OperationReport,
    SubmitOutcome, UpsertOptions,
};
use hopper_protocol::config::EngineConfig;
use hopper_protocol::pipeline::{AggregateConfig, CreditModelConfig, Offer, PipelineReport};
use hopper_protocol::types::{Job, JobId, JobType, Record};
use hopper_state::{SessionPurge, StateStore, Transition};
use tracing::{debug, info};

use crate::assembler::{Assembly, ChunkAssembler};
use crate::error::{EngineError, Result};
use crate::executor::BulkExecutor;
use crate::pipeline::PipelineRunner;
use crate::queue::{self, Task, TaskQueue};
use crate::scoring::{OfferModel, ScoreModel, TieredOfferModel, WeightedScoreModel};
use crate::store::{RecordStore, RecordValidator};
use crate::worker::WorkerPool;

// ============================================================================
// Core
// ============================================================================

/// Shared innards: everything a worker needs to run a task.
pub(crate) struct EngineCore {
    pub(crate) state: StateStore,
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) validator: Option<Arc<dyn RecordValidator>>,
    pub(crate) score_model: Arc<dyn ScoreModel>,
    pub(crate) offer_model: Arc<dyn OfferModel>,
    pub(crate) config: EngineConfig,
}

impl EngineCore {
    pub(crate) fn executor(&self) -> BulkExecutor {
        BulkExecutor::new(
            self.state.clone(),
            self.store.clone(),
            self.validator.clone(),
            self.config.clone(),
        )
    }

    pub(crate) fn pipeline(&self) -> PipelineRunner {
        PipelineRunner::new(
            self.state.clone(),
            self.store.clone(),
            self.validator.clone(),
            self.score_model.clone(),
            self.offer_model.clone(),
            self.config.clone(),
        )
    }

    fn assembler(&self) -> ChunkAssembler {
        ChunkAssembler::new(self.state.clone(), self.config.clone())
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles an [`Engine`] from its collaborators. Scoring and offer models
/// default to the bundled reference models.
pub struct EngineBuilder {
    state: StateStore,
    store: Arc<dyn RecordStore>,
    config: EngineConfig,
    validator: Option<Arc<dyn RecordValidator>>,
    score_model: Option<Arc<dyn ScoreModel>>,
    offer_model: Option<Arc<dyn OfferModel>>,
}

impl EngineBuilder {
    pub fn new(state: StateStore, store: Arc<dyn RecordStore>) -> Self {
        Self {
            state,
            store,
            config: EngineConfig::default(),
            validator: None,
            score_model: None,
            offer_model: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate create-path records before they reach the store.
    pub fn validator(mut self, validator: Arc<dyn RecordValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn score_model(mut self, model: Arc<dyn ScoreModel>) -> Self {
        self.score_model = Some(model);
        self
    }

    pub fn offer_model(mut self, model: Arc<dyn OfferModel>) -> Self {
        self.offer_model = Some(model);
        self
    }

    /// Spawn the worker pool and hand back a running engine.
    pub fn start(self) -> Engine {
        let config = self.config.normalized();
        let core = Arc::new(EngineCore {
            state: self.state,
            store: self.store,
            validator: self.validator,
            score_model: self.score_model.unwrap_or_else(|| Arc::new(WeightedScoreModel)),
            offer_model: self.offer_model.unwrap_or_else(|| Arc::new(TieredOfferModel)),
            config: config.clone(),
        });
        let (queue, receiver) = queue::unbounded();
        let workers = WorkerPool::spawn(core.clone(), receiver, config.workers);
        info!(
            workers = config.workers,
            batch_size = config.batch_size,
            sync_threshold = config.sync_threshold,
            "Engine started"
        );
        Engine { core, queue, workers }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// A running bulk-processing engine.
pub struct Engine {
    core: Arc<EngineCore>,
    queue: TaskQueue,
    workers: WorkerPool,
}

impl Engine {
    pub fn builder(state: StateStore, store: Arc<dyn RecordStore>) -> EngineBuilder {
        EngineBuilder::new(state, store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Submit records for bulk execution. At or under the sync threshold the
    /// job runs before this returns and the outcome carries the full report;
    /// above it the input is persisted, a task is queued and the outcome
    /// carries a handle to poll.
    pub async fn submit(
        &self,
        job_type: JobType,
        records: Vec<Record>,
        options: Option<UpsertOptions>,
    ) -> Result<SubmitOutcome> {
        if job_type == JobType::Pipeline {
            return Err(EngineError::invalid("pipeline jobs go through submit_pipeline"));
        }
        self.check_submission_size(records.len())?;
        let upsert = self.upsert_options(job_type, options)?;

        if records.len() <= self.core.config.sync_threshold {
            let report = self.run_inline(job_type, records, upsert).await?;
            return Ok(SubmitOutcome::Completed(report));
        }

        let job = self
            .core
            .state
            .create_job(job_type, 0, self.core.config.job_ttl_secs)
            .await?;
        let total = self.core.state.append_input(&job.job_id, &records).await?;
        self.seal_and_refuse_check(&job.job_id).await?;
        self.queue.enqueue(Task::Execute { job_id: job.job_id, job_type, upsert })?;
        info!(job_id = %job.job_id, job_type = %job_type, total, "Job accepted");
        Ok(SubmitOutcome::Accepted(JobHandle::for_job(job.job_id, total)))
    }

    /// Submit a pipeline job: import, aggregate, score, offer. Always
    /// asynchronous; the stages are not worth blocking a caller on.
    pub async fn submit_pipeline(
        &self,
        records: Vec<Record>,
        aggregate: AggregateConfig,
        model: CreditModelConfig,
    ) -> Result<JobHandle> {
        self.check_submission_size(records.len())?;
        let job = self
            .core
            .state
            .create_job(JobType::Pipeline, 0, self.core.config.job_ttl_secs)
            .await?;
        let total = self.core.state.append_input(&job.job_id, &records).await?;
        self.seal_and_refuse_check(&job.job_id).await?;
        self.queue.enqueue(Task::Pipeline { job_id: job.job_id, aggregate, model })?;
        info!(job_id = %job.job_id, total, "Pipeline job accepted");
        Ok(JobHandle::for_job(job.job_id, total))
    }

    /// Open a job for staged upload: append input over several calls, then
    /// seal it to start execution.
    pub async fn open_job(&self, job_type: JobType) -> Result<Job> {
        if job_type == JobType::Pipeline {
            return Err(EngineError::invalid("pipeline jobs go through submit_pipeline"));
        }
        let job = self
            .core
            .state
            .create_job(job_type, 0, self.core.config.job_ttl_secs)
            .await?;
        info!(job_id = %job.job_id, job_type = %job_type, "Job opened for staged upload");
        Ok(job)
    }

    /// Append records to an OPEN job. Returns the job's new total.
    pub async fn append_input(&self, job_id: &JobId, records: Vec<Record>) -> Result<u64> {
        let job = self.core.state.get_job(job_id).await?;
        let projected = job.total_items as usize + records.len();
        if projected > self.core.config.max_records_per_job {
            return Err(EngineError::invalid(format!(
                "appending {} records would put job {job_id} over the per-job limit of {}",
                records.len(),
                self.core.config.max_records_per_job
            )));
        }
        Ok(self.core.state.append_input(job_id, &records).await?)
    }

    /// Seal a staged upload and queue the job for execution.
    pub async fn seal_upload(
        &self,
        job_id: &JobId,
        options: Option<UpsertOptions>,
    ) -> Result<JobHandle> {
        let job = self.core.state.get_job(job_id).await?;
        let upsert = self.upsert_options(job.job_type, options)?;
        self.seal_and_refuse_check(job_id).await?;
        self.queue
            .enqueue(Task::Execute { job_id: *job_id, job_type: job.job_type, upsert })?;
        info!(job_id = %job_id, total = job.total_items, "Upload sealed; job queued");
        Ok(JobHandle::for_job(*job_id, job.total_items))
    }

    /// Feed one chunk of a chunked submission. The final chunk assembles the
    /// payload, starts a job and acknowledges with its handle.
    pub async fn receive_chunk(&self, submission: ChunkSubmission) -> Result<ChunkAck> {
        match submission.job_type {
            JobType::Create | JobType::Pipeline => {}
            other => {
                return Err(EngineError::invalid(format!(
                    "chunked sessions accept create or pipeline jobs, not {other}"
                )));
            }
        }

        match self.core.assembler().receive(&submission).await? {
            Assembly::Partial(ack) => Ok(ack),
            Assembly::Assembled { records } => {
                self.check_submission_size(records.len())?;
                let job = self
                    .core
                    .state
                    .create_job(submission.job_type, 0, self.core.config.job_ttl_secs)
                    .await?;
                let total = self.core.state.append_input(&job.job_id, &records).await?;
                self.seal_and_refuse_check(&job.job_id).await?;
                let task = match submission.job_type {
                    JobType::Pipeline => Task::Pipeline {
                        job_id: job.job_id,
                        aggregate: submission.aggregate_config.unwrap_or_default(),
                        model: submission.credit_model_config.unwrap_or_default(),
                    },
                    other => {
                        Task::Execute { job_id: job.job_id, job_type: other, upsert: None }
                    }
                };
                self.queue.enqueue(task)?;
                info!(
                    job_id = %job.job_id,
                    session_id = %submission.session_id,
                    total,
                    "Chunked session assembled into job"
                );
                Ok(ChunkAck::Complete {
                    job_id: job.job_id,
                    total_items: total,
                    status_url: status_url(&job.job_id),
                })
            }
        }
    }

    /// Current snapshot of a job, including errors and result ids.
    pub async fn status(&self, job_id: &JobId) -> Result<JobStatusResponse> {
        let job = self.core.state.get_job(job_id).await?;
        Ok(JobStatusResponse::from(&job))
    }

    /// Request an abort. Advisory: in-flight batches finish; later batches
    /// do not start. Aborting a terminal job is a conflict.
    pub async fn abort(&self, job_id: &JobId) -> Result<JobStatusResponse> {
        match self.core.state.abort(job_id).await? {
            Transition::Applied => {
                info!(job_id = %job_id, "Job aborted");
            }
            Transition::Refused { current } => {
                return Err(EngineError::conflict(format!(
                    "cannot abort job in terminal state {current}"
                )));
            }
        }
        self.status(job_id).await
    }

    /// The stored pipeline report for a job, once its aggregate stage ran.
    pub async fn pipeline_report(&self, job_id: &JobId) -> Result<PipelineReport> {
        let job = self.core.state.get_job(job_id).await?;
        match self.core.state.get_pipeline_report(job_id).await? {
            Some(report) => Ok(report),
            None => Err(EngineError::not_found(format!(
                "no pipeline report for job {job_id} (state {})",
                job.state
            ))),
        }
    }

    /// Offers generated for a completed pipeline job.
    pub async fn offers(&self, job_id: &JobId) -> Result<Vec<Offer>> {
        Ok(self.pipeline_report(job_id).await?.offers)
    }

    /// Aggregate a completed import on demand, without scoring. Idempotent:
    /// once aggregates completed, the stored report is returned as is.
    pub async fn run_aggregates(
        &self,
        job_id: &JobId,
        aggregate: &AggregateConfig,
    ) -> Result<PipelineReport> {
        self.core.pipeline().run_aggregates(job_id, aggregate).await
    }

    /// Delete expired job rows and their artifacts. Returns how many went.
    pub async fn purge_expired_jobs(&self) -> Result<u64> {
        Ok(self.core.state.purge_expired_jobs().await?)
    }

    /// Tombstone expired upload sessions and drop tombstones past their
    /// retention window.
    pub async fn purge_expired_sessions(&self) -> Result<SessionPurge> {
        Ok(self
            .core
            .state
            .purge_expired_sessions(self.core.config.session_tombstone_ttl_secs)
            .await?)
    }

    /// Stop accepting work and wait for in-flight tasks to finish.
    pub async fn shutdown(self) {
        drop(self.queue);
        self.workers.shutdown().await;
    }

    // ------------------------------------------------------------------------

    async fn run_inline(
        &self,
        job_type: JobType,
        records: Vec<Record>,
        upsert: Option<UpsertOptions>,
    ) -> Result<OperationReport> {
        // The caller is waiting and the records are in hand, so the input is
        // never persisted; the job row still tracks the run.
        let job = self
            .core
            .state
            .create_job(job_type, records.len() as u64, self.core.config.job_ttl_secs)
            .await?;
        if let Transition::Refused { current } =
            self.core.state.begin_processing(&job.job_id).await?
        {
            return Err(EngineError::conflict(format!(
                "job {} cannot start from {current}",
                job.job_id
            )));
        }
        self.core.executor().run(&job.job_id, job_type, records, upsert.as_ref()).await?;
        let snapshot = self.core.state.get_job(&job.job_id).await?;
        debug!(job_id = %snapshot.job_id, "Synchronous job finished");
        Ok(report_from(&snapshot))
    }

    async fn seal_and_refuse_check(&self, job_id: &JobId) -> Result<()> {
        match self.core.state.seal_upload(job_id).await? {
            Transition::Applied => Ok(()),
            Transition::Refused { current } => Err(EngineError::conflict(format!(
                "job {job_id} cannot seal from {current}"
            ))),
        }
    }

    fn check_submission_size(&self, len: usize) -> Result<()> {
        let max = self.core.config.max_records_per_job;
        if len > max {
            return Err(EngineError::invalid(format!(
                "submission of {len} records exceeds the per-job limit of {max}"
            )));
        }
        Ok(())
    }

    /// Upsert options matter only to upserts; other types ignore them.
    fn upsert_options(
        &self,
        job_type: JobType,
        options: Option<UpsertOptions>,
    ) -> Result<Option<UpsertOptions>> {
        if job_type != JobType::Upsert {
            return Ok(None);
        }
        let options =
            options.ok_or_else(|| EngineError::invalid("upsert requires unique_fields"))?;
        if options.unique_fields.is_empty() {
            return Err(EngineError::invalid("upsert requires a non-empty unique_fields list"));
        }
        Ok(Some(options))
    }
}

fn report_from(job: &Job) -> OperationReport {
    OperationReport {
        total_items: job.total_items,
        success_count: job.success_count,
        error_count: job.error_count,
        errors: job.errors.clone(),
        result_ids: job.result_ids.clone(),
    }
}
