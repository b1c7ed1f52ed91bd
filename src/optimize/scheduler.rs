use crate::evaluator::Evaluator;
use crate::events::{EventBus, OptimizerEvent};
use crate::optimize::model::{
    now_ms, JobFailure, JobOutput, JobPatch, JobRecord, JobRequest, JobState, JobStatusView,
    SchedulerStatus, ValidationError,
};
use crate::optimize::runner::{RunOutcome, SearchRunner};
use crate::storage::{JobStore, StoreError};
use futures::FutureExt;
use log::{error, info, warn};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub max_queue_depth: usize,
    /// Jobs that waited longer than this are canceled instead of started.
    /// Checked when a job reaches the head of the queue; `None` never expires.
    pub queue_wait_limit: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_queue_depth: 100,
            queue_wait_limit: None,
        }
    }
}

/// What `recover` does with jobs that were `running` when the process died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumePolicy {
    /// Mark them `error`.
    #[default]
    Fail,
    /// Mark them `error` and schedule a fresh copy under a new id.
    Reschedule,
}

impl FromStr for ResumePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(ResumePolicy::Fail),
            "reschedule" => Ok(ResumePolicy::Reschedule),
            other => Err(format!("unknown resume policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub failed: usize,
    /// New ids scheduled in place of interrupted jobs.
    pub rescheduled: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("invalid job: {0}")]
    Validation(#[from] ValidationError),
    #[error("job id already exists: {0}")]
    Duplicate(String),
    #[error("queue is full ({depth} jobs waiting)")]
    QueueFull { depth: usize },
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct QueuedJob {
    seq: u64,
    /// Time of enqueue in this process; recovered jobs start waiting anew.
    enqueued_at: Instant,
    record: JobRecord,
}

struct RunningJob {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct SchedulerState {
    /// Sorted by priority descending, then arrival.
    queue: Vec<QueuedJob>,
    running: HashMap<String, RunningJob>,
    completed: HashMap<String, JobStatusView>,
    /// Ids accepted by `schedule` but not yet persisted.
    reserved: HashSet<String>,
    /// Tasks of stopped jobs still finishing their in-flight evaluator call.
    draining: Vec<JoinHandle<()>>,
    next_seq: u64,
    closed: bool,
}

enum Finish {
    Done(JobOutput),
    Failed(JobFailure),
    /// Cancellation observed without `stop_job`: shutdown.
    Interrupted,
}

struct SchedulerInner {
    config: SchedulerConfig,
    store: Arc<JobStore>,
    evaluator: Arc<dyn Evaluator>,
    bus: EventBus,
    state: Mutex<SchedulerState>,
}

/// Priority queue of jobs feeding at most `max_concurrent` search runners.
///
/// Queue, running set and completed cache sit behind one mutex that is never
/// held across an await, so a completion frees capacity and drains the queue
/// in one step. Durable state lives in the `JobStore`.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<JobStore>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        Self::with_bus(config, store, evaluator, EventBus::new())
    }

    pub fn with_bus(
        mut config: SchedulerConfig,
        store: Arc<JobStore>,
        evaluator: Arc<dyn Evaluator>,
        bus: EventBus,
    ) -> Self {
        if config.max_concurrent == 0 {
            warn!("⚠ max_concurrent of 0 would never start a job, using 1");
            config.max_concurrent = 1;
        }
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                store,
                evaluator,
                bus,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OptimizerEvent> {
        self.inner.bus.subscribe()
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.store
    }

    pub fn config(&self) -> SchedulerConfig {
        self.inner.config
    }

    /// `false` once `shutdown` has begun.
    pub fn is_accepting(&self) -> bool {
        !self.inner.lock().closed
    }

    /// Validates, persists and enqueues a job, then drains the queue.
    /// Returns the job id.
    pub async fn schedule(&self, request: JobRequest) -> Result<String, SchedulerError> {
        request.validate()?;
        let id = request.id.clone();

        {
            let mut st = self.inner.lock();
            if st.closed {
                return Err(SchedulerError::ShuttingDown);
            }
            if st.knows(&id) {
                return Err(SchedulerError::Duplicate(id));
            }
            let depth = st.queue.len() + st.reserved.len();
            if depth >= self.inner.config.max_queue_depth {
                return Err(SchedulerError::QueueFull { depth });
            }
            st.reserved.insert(id.clone());
        }

        let persisted = match self.inner.store.contains(&id).await {
            Ok(true) => Err(SchedulerError::Duplicate(id.clone())),
            Ok(false) => {
                let record = request.into_record(now_ms());
                match self.inner.store.put(record.clone()).await {
                    Ok(()) => Ok(record),
                    Err(e) => {
                        // never durable: drop it so the same id can be retried
                        if let Err(forget) = self.inner.store.forget(&id).await {
                            warn!("⚠ [{}] could not drop failed submission: {}", id, forget);
                        }
                        Err(e.into())
                    }
                }
            }
            Err(e) => Err(e.into()),
        };

        let record = match persisted {
            Ok(record) => record,
            Err(e) => {
                self.inner.lock().reserved.remove(&id);
                return Err(e);
            }
        };

        info!(
            "✓ [{}] job queued: {} {} (priority {}, budget {})",
            id,
            record.kind.as_str(),
            record.strategy_ref,
            record.priority,
            record.budget
        );
        let mut st = self.inner.lock();
        st.reserved.remove(&id);
        self.enqueue_locked(&mut st, record);
        self.drain_locked(&mut st);
        Ok(id)
    }

    /// Starts queued jobs while there is capacity.
    pub fn process_queue(&self) {
        let mut st = self.inner.lock();
        self.drain_locked(&mut st);
    }

    /// Cancels a queued or running job. Returns `false` for ids that are
    /// neither.
    ///
    /// A queued job leaves the queue without ever reaching the evaluator. A
    /// running job has its cancellation flag raised: the in-flight evaluator
    /// call completes, no further trial starts, and the job ends `canceled`.
    pub async fn stop_job(&self, id: &str) -> Result<bool, SchedulerError> {
        let was_running = {
            let mut st = self.inner.lock();
            let was_running = if let Some(pos) = st.queue.iter().position(|q| q.record.id == id) {
                st.queue.remove(pos);
                false
            } else if let Some(mut job) = st.running.remove(id) {
                job.cancel.store(true, Ordering::SeqCst);
                st.draining.retain(|h| !h.is_finished());
                if let Some(handle) = job.handle.take() {
                    st.draining.push(handle);
                }
                true
            } else {
                return Ok(false);
            };
            st.completed.insert(
                id.to_string(),
                JobStatusView {
                    status: JobState::Canceled,
                    result: None,
                    error: None,
                },
            );
            self.inner.bus.publish(OptimizerEvent::JobStopped {
                job_id: id.to_string(),
            });
            was_running
        };

        info!(
            "■ [{}] job stopped ({})",
            id,
            if was_running { "running" } else { "queued" }
        );
        let persisted = self
            .inner
            .store
            .update(id, JobPatch::state(JobState::Canceled))
            .await;
        self.process_queue();
        persisted?;
        Ok(true)
    }

    pub fn get_status(&self) -> SchedulerStatus {
        let st = self.inner.lock();
        SchedulerStatus {
            queue_depth: st.queue.len(),
            running_count: st.running.len(),
            completed_count: st.completed.len(),
            max_concurrent: self.inner.config.max_concurrent,
        }
    }

    /// Answers from scheduler memory only; `None` for ids it has never seen.
    pub fn get_job_status(&self, id: &str) -> Option<JobStatusView> {
        let st = self.inner.lock();
        if st.running.contains_key(id) {
            return Some(JobStatusView {
                status: JobState::Running,
                result: None,
                error: None,
            });
        }
        if let Some(view) = st.completed.get(id) {
            return Some(view.clone());
        }
        if st.reserved.contains(id) || st.queue.iter().any(|q| q.record.id == id) {
            return Some(JobStatusView {
                status: JobState::Queued,
                result: None,
                error: None,
            });
        }
        None
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<JobRecord>, SchedulerError> {
        Ok(self.inner.store.get(id).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>, SchedulerError> {
        Ok(self.inner.store.list().await?)
    }

    /// Deletes expired terminal records and forgets them.
    pub async fn cleanup(&self, max_age_ms: i64) -> Result<usize, SchedulerError> {
        let removed = self.inner.store.cleanup(max_age_ms).await?;
        if removed > 0 {
            let cached: Vec<String> = self.inner.lock().completed.keys().cloned().collect();
            let mut gone = Vec::new();
            for id in cached {
                if !self.inner.store.contains(&id).await? {
                    gone.push(id);
                }
            }
            let mut st = self.inner.lock();
            for id in gone {
                st.completed.remove(&id);
            }
        }
        Ok(removed)
    }

    /// Restores persisted work after a restart: `queued` records go back on
    /// the queue, `running` ones are handled per `policy`.
    pub async fn recover(&self, policy: ResumePolicy) -> Result<RecoveryReport, SchedulerError> {
        let mut report = RecoveryReport::default();

        let queued = self.inner.store.list_by_state(JobState::Queued).await?;
        {
            let mut st = self.inner.lock();
            if st.closed {
                return Err(SchedulerError::ShuttingDown);
            }
            for record in queued {
                if st.knows(&record.id) {
                    continue;
                }
                self.enqueue_locked(&mut st, record);
                report.requeued += 1;
            }
        }

        for record in self.inner.store.resume_candidates().await? {
            let live = self.inner.lock().running.contains_key(&record.id);
            if live {
                continue;
            }
            self.inner
                .store
                .update(
                    &record.id,
                    JobPatch::failed(JobFailure::message("interrupted by restart")),
                )
                .await?;
            report.failed += 1;
            warn!("⚠ [{}] was running at shutdown, marked error", record.id);

            if policy == ResumePolicy::Reschedule {
                match self.schedule(JobRequest::from_record(&record)).await {
                    Ok(new_id) => {
                        info!("✓ [{}] rescheduled as {}", record.id, new_id);
                        report.rescheduled.push(new_id);
                    }
                    Err(e) => warn!("⚠ [{}] could not be rescheduled: {}", record.id, e),
                }
            }
        }

        if report.requeued > 0 || report.failed > 0 {
            info!(
                "✓ recovery: {} requeued, {} interrupted, {} rescheduled",
                report.requeued,
                report.failed,
                report.rescheduled.len()
            );
        } else {
            info!("no jobs to recover");
        }
        self.process_queue();
        Ok(report)
    }

    /// Stops accepting work, raises every running job's cancellation flag and
    /// waits for all runner tasks. Interrupted jobs stay `running` in the
    /// store so the next start sees them as resume candidates; queued jobs
    /// stay `queued`.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut st = self.inner.lock();
            st.closed = true;
            st.queue.clear();
            let mut handles: Vec<JoinHandle<()>> = st.draining.drain(..).collect();
            for job in st.running.values_mut() {
                job.cancel.store(true, Ordering::SeqCst);
                if let Some(handle) = job.handle.take() {
                    handles.push(handle);
                }
            }
            handles
        };

        info!("waiting for {} runner tasks to stop", handles.len());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("✗ runner task failed to join: {}", e);
            }
        }
    }

    fn enqueue_locked(&self, st: &mut SchedulerState, record: JobRecord) {
        let seq = st.next_seq;
        st.next_seq += 1;
        let pos = queue_position(&st.queue, record.priority);
        self.inner.bus.publish(OptimizerEvent::JobQueued {
            job: Box::new(record.clone()),
        });
        st.queue.insert(
            pos,
            QueuedJob {
                seq,
                enqueued_at: Instant::now(),
                record,
            },
        );
    }

    fn drain_locked(&self, st: &mut SchedulerState) {
        while !st.closed
            && !st.queue.is_empty()
            && st.running.len() < self.inner.config.max_concurrent
        {
            let next = st.queue.remove(0);
            match self.inner.config.queue_wait_limit {
                Some(limit) if next.enqueued_at.elapsed() > limit => {
                    self.expire_locked(st, next, limit)
                }
                _ => self.start_locked(st, next),
            }
        }
    }

    /// Cancels a job that waited past `queue_wait_limit` without starting it.
    fn expire_locked(&self, st: &mut SchedulerState, job: QueuedJob, limit: Duration) {
        let id = job.record.id;
        warn!(
            "⚠ [{}] waited {:?} in queue (limit {:?}), canceled",
            id,
            job.enqueued_at.elapsed(),
            limit
        );
        st.completed.insert(
            id.clone(),
            JobStatusView {
                status: JobState::Canceled,
                result: None,
                error: None,
            },
        );
        self.inner.bus.publish(OptimizerEvent::JobStopped {
            job_id: id.clone(),
        });

        let store = self.inner.store.clone();
        st.draining.retain(|h| !h.is_finished());
        st.draining.push(tokio::spawn(async move {
            if let Err(e) = store.update(&id, JobPatch::state(JobState::Canceled)).await {
                error!("✗ [{}] could not persist queue expiry: {}", id, e);
            }
        }));
    }

    fn start_locked(&self, st: &mut SchedulerState, job: QueuedJob) {
        assert!(
            st.running.len() < self.inner.config.max_concurrent,
            "start_job called with {} jobs running (max {})",
            st.running.len(),
            self.inner.config.max_concurrent
        );
        let id = job.record.id.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_job(self.clone(), job.record, cancel.clone()));
        info!("🚀 [{}] job started (arrival #{})", id, job.seq);
        st.running.insert(
            id,
            RunningJob {
                cancel,
                handle: Some(handle),
            },
        );
    }

    /// Records the end of a job the scheduler still owns.
    ///
    /// Events go out before the job leaves `running`, and the store write
    /// happens after, so whoever removed the job from `running` (this or
    /// `stop_job`) is the only writer of its terminal state.
    async fn finish_job(&self, id: &str, finish: Finish) {
        let owned = {
            let mut st = self.inner.lock();
            if !st.running.contains_key(id) {
                false
            } else {
                let view = match &finish {
                    Finish::Done(output) => {
                        self.inner.bus.publish(OptimizerEvent::JobCompleted {
                            job_id: id.to_string(),
                            best: output.best.clone(),
                        });
                        Some(JobStatusView {
                            status: JobState::Done,
                            result: Some(output.clone()),
                            error: None,
                        })
                    }
                    Finish::Failed(failure) => {
                        self.inner.bus.publish(OptimizerEvent::JobError {
                            job_id: id.to_string(),
                            error: failure.clone(),
                        });
                        Some(JobStatusView {
                            status: JobState::Error,
                            result: None,
                            error: Some(failure.clone()),
                        })
                    }
                    Finish::Interrupted => None,
                };
                st.running.remove(id);
                if let Some(view) = view {
                    st.completed.insert(id.to_string(), view);
                }
                true
            }
        };

        if owned {
            let patch = match finish {
                Finish::Done(output) => {
                    info!(
                        "✓ [{}] job done, best score {:.4}",
                        id, output.best.score
                    );
                    Some(JobPatch::done(output))
                }
                Finish::Failed(failure) => {
                    warn!("✗ [{}] job failed: {}", id, failure.message);
                    Some(JobPatch::failed(failure))
                }
                Finish::Interrupted => {
                    info!("■ [{}] job interrupted, left running for resume", id);
                    None
                }
            };
            if let Some(patch) = patch {
                if let Err(e) = self.inner.store.update(id, patch).await {
                    error!("✗ [{}] could not persist final state: {}", id, e);
                }
            }
        }

        self.process_queue();
    }
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SchedulerState {
    fn knows(&self, id: &str) -> bool {
        self.reserved.contains(id)
            || self.running.contains_key(id)
            || self.completed.contains_key(id)
            || self.queue.iter().any(|q| q.record.id == id)
    }
}

/// Insertion point keeping the queue sorted by priority descending; a new
/// job goes behind every job of equal priority.
fn queue_position(queue: &[QueuedJob], priority: i32) -> usize {
    queue
        .iter()
        .position(|q| q.record.priority < priority)
        .unwrap_or(queue.len())
}

async fn run_job(scheduler: JobScheduler, record: JobRecord, cancel: Arc<AtomicBool>) {
    let id = record.id.clone();

    if cancel.load(Ordering::SeqCst) {
        scheduler.finish_job(&id, Finish::Interrupted).await;
        return;
    }

    match scheduler
        .inner
        .store
        .update(&id, JobPatch::state(JobState::Running))
        .await
    {
        Ok(_) => {}
        Err(e @ StoreError::IllegalTransition { .. }) => {
            warn!("⚠ [{}] not started: {}", id, e);
            scheduler.finish_job(&id, Finish::Interrupted).await;
            return;
        }
        Err(e) => warn!("⚠ [{}] could not persist running state: {}", id, e),
    }

    let runner = SearchRunner::for_job(&record);
    let evaluator = scheduler.inner.evaluator.clone();
    let bus = scheduler.inner.bus.clone();
    let outcome = AssertUnwindSafe(runner.run(evaluator.as_ref(), &bus, &cancel))
        .catch_unwind()
        .await;

    let finish = match outcome {
        Ok(Ok(RunOutcome::Finished(output))) => Finish::Done(output),
        Ok(Ok(RunOutcome::Canceled { .. })) => Finish::Interrupted,
        Ok(Err(e)) => Finish::Failed(JobFailure::from_error(&e)),
        Err(_) => Finish::Failed(JobFailure::message("search runner panicked")),
    };
    scheduler.finish_job(&id, finish).await;
}
