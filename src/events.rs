use crate::optimize::model::{BestTrial, JobFailure, JobRecord};
use crate::optimize::space::ParamAssignment;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Scheduling and evaluation events, serialised for SSE-style transports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OptimizerEvent {
    JobQueued {
        job: Box<JobRecord>,
    },
    #[serde(rename_all = "camelCase")]
    Evaluation {
        job_id: String,
        trial: usize,
        params: ParamAssignment,
        score: f64,
        best: BestTrial,
    },
    #[serde(rename_all = "camelCase")]
    JobCompleted { job_id: String, best: BestTrial },
    #[serde(rename_all = "camelCase")]
    JobError { job_id: String, error: JobFailure },
    #[serde(rename_all = "camelCase")]
    JobStopped { job_id: String },
}

impl OptimizerEvent {
    pub fn job_id(&self) -> &str {
        match self {
            OptimizerEvent::JobQueued { job } => &job.id,
            OptimizerEvent::Evaluation { job_id, .. }
            | OptimizerEvent::JobCompleted { job_id, .. }
            | OptimizerEvent::JobError { job_id, .. }
            | OptimizerEvent::JobStopped { job_id } => job_id,
        }
    }
}

/// In-process fan-out. Subscribers only see events published after they
/// subscribe; closed receivers are pruned on the next publish.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<OptimizerEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OptimizerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: OptimizerEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<OptimizerEvent>>> {
        // a poisoned list of senders is still usable
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
