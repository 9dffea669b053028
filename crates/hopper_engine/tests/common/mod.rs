//! Shared setup for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hopper_engine::Engine;
use hopper_protocol::api::JobStatusResponse;
use hopper_protocol::config::EngineConfig;
use hopper_protocol::types::{JobId, JobState};
use hopper_state::StateStore;
use hopper_test_utils::MemoryRecordStore;

/// Small limits so tests cross the sync threshold and batch boundaries
/// without thousands of records.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        batch_size: 10,
        sync_threshold: 5,
        progress_stride: 4,
        workers: 2,
        ..EngineConfig::default()
    }
}

pub struct TestEngine {
    pub engine: Engine,
    pub state: StateStore,
    pub store: Arc<MemoryRecordStore>,
}

/// Route engine logs through the test harness when RUST_LOG asks for them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub async fn start_engine(config: EngineConfig) -> TestEngine {
    init_tracing();
    let state = StateStore::open_in_memory().await.expect("in-memory state store opens");
    let store = Arc::new(MemoryRecordStore::new());
    let engine = Engine::builder(state.clone(), store.clone()).config(config).start();
    TestEngine { engine, state, store }
}

/// Poll an arbitrary condition; panics after ~5s.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

/// Poll until the job goes terminal; panics after ~5s.
pub async fn wait_for_terminal(engine: &Engine, job_id: &JobId) -> JobStatusResponse {
    for _ in 0..500 {
        let status = engine.status(job_id).await.expect("status poll succeeds");
        if status.state.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

/// Poll until the pipeline's aggregate stage finishes, or the job fails.
pub async fn wait_for_aggregates(engine: &Engine, job_id: &JobId) -> JobStatusResponse {
    for _ in 0..500 {
        let status = engine.status(job_id).await.expect("status poll succeeds");
        if status.aggregates_completed || status.state == JobState::Failed {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never finished its aggregate stage");
}
