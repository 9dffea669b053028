//! Worker pool draining the task queue.
//!
//! Claiming a job (UPLOAD_COMPLETE to IN_PROGRESS) is the dedup point: a
//! task whose claim loses the compare-and-set is a duplicate and is dropped
//! without touching the record store. Task failures are logged, never
//! propagated; the job row carries the outcome.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::EngineCore;
use crate::error::Result;
use crate::queue::{Task, TaskReceiver};

pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    pub(crate) fn spawn(core: Arc<EngineCore>, receiver: TaskReceiver, count: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(count.max(1));
        for worker_no in 0..count.max(1) {
            let core = core.clone();
            let receiver = receiver.clone();
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                debug!(worker_no, "Worker started");
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        task = receiver.next() => {
                            let Some(task) = task else { break };
                            if let Err(err) = run_task(&core, task).await {
                                warn!(worker_no, error = %err, "Task failed");
                            }
                        }
                    }
                }
                debug!(worker_no, "Worker stopped");
            }));
        }
        Self { handles, shutdown_tx }
    }

    /// Signal shutdown and wait for in-flight tasks to wind down.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("Worker pool stopped");
    }
}

async fn run_task(core: &EngineCore, task: Task) -> Result<()> {
    let job_id = *task.job_id();
    if !core.state.begin_processing(&job_id).await?.applied() {
        debug!(job_id = %job_id, "Job already claimed; dropping duplicate task");
        return Ok(());
    }
    let records = core.state.load_input(&job_id).await?;
    match task {
        Task::Execute { job_type, upsert, .. } => {
            core.executor().run(&job_id, job_type, records, upsert.as_ref()).await
        }
        Task::Pipeline { aggregate, model, .. } => {
            core.pipeline().run(&job_id, records, &aggregate, &model).await
        }
    }
}
