//! Pipeline jobs through the engine facade: the import/aggregate/score/offer
//! flow, the gate between import and the later stages, stage failures, and
//! the on-demand aggregate surface.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{
    init_tracing, start_engine, test_config, wait_for_aggregates, wait_for_terminal, wait_until,
};
use hopper_engine::{Engine, EngineError, ScoreModel, WeightedScoreModel};
use hopper_protocol::api::SubmitOutcome;
use hopper_protocol::pipeline::{AggregateConfig, AggregateGroup, CreditModelConfig, ScoreResult};
use hopper_protocol::types::{JobId, JobState, JobType, Record};
use hopper_state::{StateError, StateStore};
use hopper_test_utils::{transaction, MemoryRecordStore};

fn transactions(n: usize, date: &str, amount: f64, is_revenue: bool) -> Vec<Record> {
    (0..n).map(|_| transaction(date, amount, is_revenue)).collect()
}

/// Delegates to the reference model but counts invocations, so tests can
/// assert when scoring ran (or that it never did).
#[derive(Default)]
struct CountingScoreModel {
    calls: AtomicUsize,
}

#[async_trait]
impl ScoreModel for CountingScoreModel {
    async fn score(
        &self,
        group: &AggregateGroup,
        config: &CreditModelConfig,
    ) -> anyhow::Result<ScoreResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        WeightedScoreModel.score(group, config).await
    }
}

/// Always errors, standing in for an unreachable scoring service.
#[derive(Default)]
struct FailingScoreModel {
    calls: AtomicUsize,
}

#[async_trait]
impl ScoreModel for FailingScoreModel {
    async fn score(
        &self,
        _group: &AggregateGroup,
        _config: &CreditModelConfig,
    ) -> anyhow::Result<ScoreResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("scoring backend offline")
    }
}

async fn engine_with_score_model(
    model: Arc<dyn ScoreModel>,
) -> (Engine, Arc<MemoryRecordStore>) {
    init_tracing();
    let state = StateStore::open_in_memory().await.expect("in-memory state store opens");
    let store = Arc::new(MemoryRecordStore::new());
    let engine = Engine::builder(state, store.clone())
        .config(test_config())
        .score_model(model)
        .start();
    (engine, store)
}

#[tokio::test]
async fn test_pipeline_runs_import_aggregate_score_offer() {
    let t = start_engine(test_config()).await;

    // one strong revenue day and one thin day
    let mut records = transactions(6, "2024-03-01", 2_000.0, true);
    records.push(transaction("2024-03-02", 100.0, false));

    let handle = t
        .engine
        .submit_pipeline(records, AggregateConfig::default(), CreditModelConfig::default())
        .await
        .unwrap();
    assert_eq!(handle.total_items, 7);

    let status = wait_for_aggregates(&t.engine, &handle.job_id).await;
    assert_eq!(status.state, JobState::JobComplete);
    assert!(status.aggregates_ready);
    assert!(status.aggregates_completed);
    assert_eq!(status.success_count, 7);
    assert_eq!(status.percentage, 100.0);
    assert_eq!(status.result_ids.created_count(), 7);
    assert_eq!(t.store.len(), 7);

    let report = t.engine.pipeline_report(&handle.job_id).await.unwrap();
    assert_eq!(report.summary.transactions_processed, 7);
    assert_eq!(report.summary.aggregates_created, 2);
    assert_eq!(report.summary.offers_generated, 2);
    assert_eq!(report.aggregates.len(), 2);
    assert_eq!(report.scores.len(), 2);

    // both products go to the strong day; the thin day is high risk
    let offers = t.engine.offers(&handle.job_id).await.unwrap();
    assert_eq!(offers.len(), 2);
    assert!(offers.iter().all(|o| o.group == "2024-03-01"));
    assert_eq!(offers[0].offer_type, "term_loan");
    assert_eq!(offers[0].amount, 24_000.0);
    assert_eq!(offers[1].offer_type, "line_of_credit");
    assert_eq!(offers[1].amount, 12_000.0);

    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_aggregate_stage_never_starts_before_import_completes() {
    let scores = Arc::new(CountingScoreModel::default());
    let (engine, store) = engine_with_score_model(scores.clone()).await;

    let pause = store.pause_inserts().await;
    let handle = engine
        .submit_pipeline(
            transactions(12, "2024-03-01", 500.0, true),
            AggregateConfig::default(),
            CreditModelConfig::default(),
        )
        .await
        .unwrap();

    // first batch is held at the insert gate: the import cannot finish
    wait_until(|| store.counts().insert_calls >= 1).await;
    let status = engine.status(&handle.job_id).await.unwrap();
    assert_eq!(status.state, JobState::InProgress);
    assert!(!status.aggregates_ready);
    assert_eq!(store.counts().fetch_calls, 0, "no aggregate reads during the import");
    assert_eq!(scores.calls.load(Ordering::SeqCst), 0, "no scoring during the import");

    drop(pause);
    let status = wait_for_aggregates(&engine, &handle.job_id).await;
    assert_eq!(status.state, JobState::JobComplete);
    assert!(status.aggregates_completed);
    assert_eq!(store.counts().fetch_calls, 1);
    assert_eq!(scores.calls.load(Ordering::SeqCst), 1, "single group scored once");

    engine.shutdown().await;
}

#[tokio::test]
async fn test_failed_import_skips_aggregation_and_scoring() {
    let scores = Arc::new(CountingScoreModel::default());
    let (engine, store) = engine_with_score_model(scores.clone()).await;
    store.fail_after_insert_calls(0);

    let handle = engine
        .submit_pipeline(
            transactions(12, "2024-03-01", 500.0, true),
            AggregateConfig::default(),
            CreditModelConfig::default(),
        )
        .await
        .unwrap();

    let status = wait_for_terminal(&engine, &handle.job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert!(!status.aggregates_ready);
    assert!(!status.aggregates_completed);
    assert!(status.fail_reason.as_deref().unwrap_or("").contains("record store failure"));
    assert_eq!(status.error_count, 10, "every record of the failed batch counts");
    assert_eq!(scores.calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.counts().fetch_calls, 0);

    let err = engine.pipeline_report(&handle.job_id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_scoring_failure_leaves_the_import_standing() {
    let scores = Arc::new(FailingScoreModel::default());
    let (engine, store) = engine_with_score_model(scores.clone()).await;

    let handle = engine
        .submit_pipeline(
            transactions(8, "2024-03-01", 2_000.0, true),
            AggregateConfig::default(),
            CreditModelConfig::default(),
        )
        .await
        .unwrap();

    let status = wait_for_terminal(&engine, &handle.job_id).await;
    assert_eq!(status.state, JobState::JobComplete, "the completed import stands");
    assert_eq!(status.success_count, 8);
    wait_until(|| scores.calls.load(Ordering::SeqCst) >= 1).await;

    let status = engine.status(&handle.job_id).await.unwrap();
    assert!(status.aggregates_ready);
    assert!(!status.aggregates_completed, "failed stage must not claim completion");
    assert!(status.fail_reason.is_none(), "terminal snapshot stays frozen");
    let err = engine.pipeline_report(&handle.job_id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    // the aggregate stage stays re-runnable, and needs no scoring
    let report =
        engine.run_aggregates(&handle.job_id, &AggregateConfig::default()).await.unwrap();
    assert_eq!(report.summary.transactions_processed, 8);
    assert_eq!(report.summary.aggregates_created, 1);
    assert_eq!(report.summary.offers_generated, 0);
    assert!(engine.offers(&handle.job_id).await.unwrap().is_empty());
    assert_eq!(store.counts().fetch_calls, 2, "pipeline fetch plus the re-run");

    let status = engine.status(&handle.job_id).await.unwrap();
    assert!(status.aggregates_completed);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_run_aggregates_conflicts_until_the_import_finishes() {
    let t = start_engine(test_config()).await;

    let pause = t.store.pause_inserts().await;
    let handle = t
        .engine
        .submit_pipeline(
            transactions(12, "2024-04-01", 1_500.0, true),
            AggregateConfig::default(),
            CreditModelConfig::default(),
        )
        .await
        .unwrap();
    wait_until(|| t.store.counts().insert_calls >= 1).await;

    let err = t
        .engine
        .run_aggregates(&handle.job_id, &AggregateConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    drop(pause);
    wait_for_aggregates(&t.engine, &handle.job_id).await;

    // once the pipeline finished, the call replays the stored report as is
    let report =
        t.engine.run_aggregates(&handle.job_id, &AggregateConfig::default()).await.unwrap();
    assert_eq!(report.summary.transactions_processed, 12);
    assert_eq!(report.offers.len(), 2, "replay keeps the pipeline's offers");
    assert_eq!(report.summary.offers_generated, 2);

    t.engine.shutdown().await;
}

#[tokio::test]
async fn test_pipeline_report_not_found_for_unknown_or_reportless_jobs() {
    let t = start_engine(test_config()).await;

    // unknown job: the job lookup itself fails
    let err = t.engine.pipeline_report(&JobId::generate()).await.unwrap_err();
    assert!(matches!(err, EngineError::State(StateError::NotFound(_))));

    // a plain create job exists but never produces a report
    let outcome = t
        .engine
        .submit(JobType::Create, transactions(6, "2024-01-01", 10.0, false), None)
        .await
        .unwrap();
    let handle = match outcome {
        SubmitOutcome::Accepted(handle) => handle,
        SubmitOutcome::Completed(_) => panic!("6 records is over the sync threshold"),
    };
    wait_for_terminal(&t.engine, &handle.job_id).await;
    let err = t.engine.pipeline_report(&handle.job_id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    t.engine.shutdown().await;
}
