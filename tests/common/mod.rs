#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stratopt::evaluator::{BacktestMetrics, EvalRequest, Evaluator, EvaluatorError};
use stratopt::events::OptimizerEvent;
use stratopt::optimize::model::{JobRecord, JobState};
use stratopt::storage::JobStore;
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};

pub const WAIT: Duration = Duration::from_secs(10);

/// Evaluator whose calls block until the test hands out permits.
///
/// Strategies whose name starts with `fail` return an error. The score is the
/// `x` parameter when present.
pub struct GatedEvaluator {
    gate: Semaphore,
    calls: Mutex<Vec<EvalRequest>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    started: mpsc::UnboundedSender<String>,
}

impl GatedEvaluator {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ev = Arc::new(Self {
            gate: Semaphore::new(0),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: tx,
        });
        (ev, rx)
    }

    /// Lets `n` more evaluator calls complete.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn open(&self) {
        self.gate.add_permits(10_000);
    }

    pub fn calls(&self) -> Vec<EvalRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn strategies(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.strategy_ref).collect()
    }

    pub fn calls_for(&self, strategy: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.strategy_ref == strategy)
            .count()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for GatedEvaluator {
    async fn evaluate(&self, request: &EvalRequest) -> Result<BacktestMetrics, EvaluatorError> {
        self.calls.lock().unwrap().push(request.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _ = self.started.send(request.strategy_ref.clone());

        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| EvaluatorError::Transport(e.to_string()))?;
        permit.forget();
        self.active.fetch_sub(1, Ordering::SeqCst);

        if request.strategy_ref.starts_with("fail") {
            return Err(EvaluatorError::Failed(format!(
                "engine crashed on {}",
                request.strategy_ref
            )));
        }
        let x = request
            .params
            .get("x")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        Ok(BacktestMetrics {
            total_return: x,
            ..Default::default()
        })
    }
}

pub fn sqlite_url(dir: &TempDir) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join("jobs.db").display())
}

pub async fn open_store(dir: &TempDir) -> Arc<JobStore> {
    Arc::new(JobStore::open(&sqlite_url(dir)).await.unwrap())
}

pub async fn next_started(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no evaluator call started in time")
        .expect("evaluator dropped")
}

/// Collects events until `n` of them match `pred`.
pub async fn wait_events<F>(
    rx: &mut mpsc::UnboundedReceiver<OptimizerEvent>,
    n: usize,
    pred: F,
) -> Vec<OptimizerEvent>
where
    F: Fn(&OptimizerEvent) -> bool,
{
    let mut seen = Vec::new();
    let mut matched = 0;
    while matched < n {
        let event = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event bus closed");
        if pred(&event) {
            matched += 1;
        }
        seen.push(event);
    }
    seen
}

pub fn is_finished(e: &OptimizerEvent) -> bool {
    matches!(
        e,
        OptimizerEvent::JobCompleted { .. } | OptimizerEvent::JobError { .. }
    )
}

/// Polls the store until the job reaches `state`.
pub async fn wait_for_state(store: &JobStore, id: &str, state: JobState) -> JobRecord {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(record) = store.get(id).await.unwrap() {
            if record.state == state {
                return record;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} never reached {}",
            id,
            state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
