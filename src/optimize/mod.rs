pub mod model;
pub mod runner;
pub mod scheduler;
pub mod scoring;
pub mod space;
pub mod walk_forward;

pub use model::{
    JobFailure, JobKind, JobOutput, JobPatch, JobRecord, JobRequest, JobState, JobStatusView,
    SchedulerStatus, SearchOptions, ValidationError,
};
pub use runner::{RunOutcome, RunnerError, RunnerOptions, SearchRunner};
pub use scheduler::{JobScheduler, ResumePolicy, SchedulerConfig, SchedulerError};
pub use scoring::{score, ScoreWeights};
pub use space::{ParamAssignment, ParamRange, ParamSpace};
pub use walk_forward::{WalkForwardConfig, WalkForwardReport};
