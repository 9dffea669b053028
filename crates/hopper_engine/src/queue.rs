//! In-process task queue between submission and the worker pool.
//!
//! Unbounded mpsc: accepting a job already implies its input is durable, so
//! backpressure belongs at submission limits, not here. The receiver half is
//! shared by every worker and hands each task to exactly one of them.

use std::sync::Arc;

use hopper_protocol::api::UpsertOptions;
use hopper_protocol::pipeline::{AggregateConfig, CreditModelConfig};
use hopper_protocol::types::{JobId, JobType};
use tokio::sync::{mpsc, Mutex};

use crate::error::{EngineError, Result};

/// One unit of deferred work. The job's input always lives in the state
/// store by the time its task is queued.
#[derive(Debug)]
pub(crate) enum Task {
    /// Run a bulk job.
    Execute { job_id: JobId, job_type: JobType, upsert: Option<UpsertOptions> },
    /// Run a pipeline job end to end.
    Pipeline { job_id: JobId, aggregate: AggregateConfig, model: CreditModelConfig },
}

impl Task {
    pub(crate) fn job_id(&self) -> &JobId {
        match self {
            Task::Execute { job_id, .. } | Task::Pipeline { job_id, .. } => job_id,
        }
    }
}

/// Sender half; cheap to clone.
#[derive(Clone)]
pub(crate) struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
}

/// Receiver half shared across workers.
#[derive(Clone)]
pub(crate) struct TaskReceiver {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
}

pub(crate) fn unbounded() -> (TaskQueue, TaskReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TaskQueue { tx }, TaskReceiver { rx: Arc::new(Mutex::new(rx)) })
}

impl TaskQueue {
    pub(crate) fn enqueue(&self, task: Task) -> Result<()> {
        self.tx.send(task).map_err(|_| EngineError::conflict("task queue is closed"))
    }
}

impl TaskReceiver {
    /// Next task, or `None` once every sender is gone and the queue drained.
    pub(crate) async fn next(&self) -> Option<Task> {
        self.rx.lock().await.recv().await
    }
}
