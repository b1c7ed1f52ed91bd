pub mod app_service;
pub mod commands;
pub mod config;
pub mod evaluator;
pub mod events;
pub mod optimize;
pub mod storage;

pub use config::{ConfigError, OptimizerConfig};
pub use evaluator::{BacktestMetrics, EvalRequest, Evaluator, EvaluatorError, HttpEvaluator};
pub use events::{EventBus, OptimizerEvent};
pub use optimize::{JobRequest, JobScheduler, ParamSpace, ResumePolicy, SchedulerConfig};
pub use storage::JobStore;
