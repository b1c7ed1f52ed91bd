use crate::evaluator::BacktestMetrics;
use crate::optimize::scoring::ScoreWeights;
use crate::optimize::space::{ParamAssignment, ParamSpace};
use crate::optimize::walk_forward::{WalkForwardConfig, WalkForwardReport};
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backtest,
    Optimize,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backtest => "backtest",
            JobKind::Optimize => "optimize",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backtest" => Ok(JobKind::Backtest),
            "optimize" => Ok(JobKind::Optimize),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

/// queued -> running -> done | error | canceled; queued -> canceled | error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Error => "error",
            JobState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Error | JobState::Canceled)
    }

    /// Terminal states accept nothing; non-terminal states may stay put.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (JobState::Queued, JobState::Queued) => true,
            (JobState::Queued, JobState::Running | JobState::Canceled | JobState::Error) => true,
            (JobState::Running, JobState::Running) => true,
            (JobState::Running, JobState::Done | JobState::Error | JobState::Canceled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "done" => Ok(JobState::Done),
            "error" => Ok(JobState::Error),
            "canceled" => Ok(JobState::Canceled),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// Failure stored on a job in `error` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    /// Rendered `source()` chain of the error.
    pub stack: String,
}

impl JobFailure {
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = Vec::new();
        let mut current = err.source();
        while let Some(cause) = current {
            stack.push(format!("caused by: {}", cause));
            current = cause.source();
        }
        Self {
            message: err.to_string(),
            stack: stack.join("\n"),
        }
    }

    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            stack: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trial {
    pub index: usize,
    pub params: ParamAssignment,
    pub metrics: BacktestMetrics,
    pub score: f64,
    /// Profit factor term came from the trade-count proxy.
    pub pf_approximated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestTrial {
    pub params: ParamAssignment,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// Every grid combination was evaluated.
    Exhausted,
    /// `maxEvaluations` trials were consumed.
    Budget,
    /// Early stop after a run of trials without improvement.
    Plateau,
}

/// Best-trial summary stored on a `done` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutput {
    pub best: BestTrial,
    pub trials_run: usize,
    pub stop_reason: StopReason,
    pub leaderboard: Vec<Trial>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<WalkForwardReport>,
    pub elapsed_ms: u64,
}

/// Search knobs persisted with the job so it can be re-run after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub early_stop_plateau: Option<usize>,
    pub weights: ScoreWeights,
    pub seed: Option<u64>,
    pub walk_forward: Option<WalkForwardConfig>,
}

/// Durable projection of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub kind: JobKind,
    pub strategy_ref: String,
    pub param_space: ParamSpace,
    pub budget: usize,
    pub priority: i32,
    pub state: JobState,
    /// Unix millis.
    pub created_at: i64,
    /// Unix millis, rewritten on every state or output change.
    pub updated_at: i64,
    #[serde(default)]
    pub options: SearchOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JobOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

/// Partial update merged over an existing record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub output: Option<JobOutput>,
    pub error: Option<JobFailure>,
}

impl JobPatch {
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn done(output: JobOutput) -> Self {
        Self {
            state: Some(JobState::Done),
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: JobFailure) -> Self {
        Self {
            state: Some(JobState::Error),
            output: None,
            error: Some(error),
        }
    }
}

/// Input to `JobScheduler::schedule`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub id: String,
    pub kind: JobKind,
    pub strategy_ref: String,
    pub param_space: ParamSpace,
    pub budget: usize,
    pub priority: i32,
    pub options: SearchOptions,
}

impl JobRequest {
    pub fn optimize(strategy_ref: impl Into<String>, param_space: ParamSpace, budget: usize) -> Self {
        Self {
            id: new_job_id(),
            kind: JobKind::Optimize,
            strategy_ref: strategy_ref.into(),
            param_space,
            budget,
            priority: 0,
            options: SearchOptions::default(),
        }
    }

    pub fn backtest(strategy_ref: impl Into<String>, param_space: ParamSpace) -> Self {
        Self {
            kind: JobKind::Backtest,
            ..Self::optimize(strategy_ref, param_space, 1)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn early_stop_plateau(mut self, plateau: usize) -> Self {
        self.options.early_stop_plateau = Some(plateau);
        self
    }

    pub fn weights(mut self, weights: ScoreWeights) -> Self {
        self.options.weights = weights;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.options.seed = Some(seed);
        self
    }

    pub fn walk_forward(mut self, config: WalkForwardConfig) -> Self {
        self.options.walk_forward = Some(config);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.strategy_ref.trim().is_empty() {
            return Err(ValidationError::EmptyStrategy);
        }
        if self.budget == 0 {
            return Err(ValidationError::ZeroBudget);
        }
        self.param_space.validate()?;
        if self.options.early_stop_plateau == Some(0) {
            return Err(ValidationError::ZeroPlateau);
        }
        if let Some(wf) = &self.options.walk_forward {
            wf.validate()?;
        }
        Ok(())
    }

    pub fn into_record(self, now_ms: i64) -> JobRecord {
        JobRecord {
            id: self.id,
            kind: self.kind,
            strategy_ref: self.strategy_ref,
            param_space: self.param_space,
            budget: self.budget,
            priority: self.priority,
            state: JobState::Queued,
            created_at: now_ms,
            updated_at: now_ms,
            options: self.options,
            output: None,
            error: None,
        }
    }

    /// Fresh request carrying the same search definition as `record`.
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            id: new_job_id(),
            kind: record.kind,
            strategy_ref: record.strategy_ref.clone(),
            param_space: record.param_space.clone(),
            budget: record.budget,
            priority: record.priority,
            options: record.options.clone(),
        }
    }
}

/// `job-<millis>-<6 random chars>`
pub fn new_job_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("job-{}-{}", Utc::now().timestamp_millis(), suffix)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Whole milliseconds in `d`, saturating at `i64::MAX`.
pub fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Rejected before the job ever reaches the queue.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("job id must not be empty")]
    EmptyId,
    #[error("strategy reference must not be empty")]
    EmptyStrategy,
    #[error("budget must be greater than zero")]
    ZeroBudget,
    #[error("parameter space is empty")]
    EmptySpace,
    #[error("parameter {param} has no candidate values")]
    EmptyValues { param: String },
    #[error("parameter {param} has invalid range [{min}, {max}]")]
    InvalidRange { param: String, min: f64, max: f64 },
    #[error("early-stop plateau must be greater than zero")]
    ZeroPlateau,
    #[error("invalid walk-forward config: {0}")]
    InvalidWalkForward(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub queue_depth: usize,
    pub running_count: usize,
    pub completed_count: usize,
    pub max_concurrent: usize,
}

/// Answer of `JobScheduler::get_job_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub status: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}
