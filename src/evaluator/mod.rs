pub mod http;

pub use http::HttpEvaluator;

use crate::optimize::space::ParamAssignment;
use crate::optimize::walk_forward::Window;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Metrics returned by the simulation engine for one parameter assignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestMetrics {
    pub total_return: f64,
    pub sharpe_ratio: f64,
    /// Drawdown magnitude; the sign is ignored when scoring.
    pub max_drawdown: f64,
    #[serde(default)]
    pub trades: u64,
    /// Fraction in `[0, 1]`; percentages above 1 are normalised when scoring.
    #[serde(default)]
    pub win_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gross_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gross_loss: Option<f64>,
}

/// What the evaluator is asked to simulate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalRequest {
    pub strategy_ref: String,
    pub params: ParamAssignment,
    /// Timeline slice for walk-forward folds; `None` means the full history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<Window>,
}

/// Only infrastructure failures are errors. A losing strategy is a normal result.
#[derive(thiserror::Error, Debug)]
pub enum EvaluatorError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("evaluator unavailable ({status})")]
    Unavailable { status: u16 },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("evaluation failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: &EvalRequest) -> Result<BacktestMetrics, EvaluatorError>;
}

/// Adapts a blocking closure to the evaluator contract.
pub struct FnEvaluator<F> {
    f: F,
}

impl<F> FnEvaluator<F>
where
    F: Fn(&EvalRequest) -> Result<BacktestMetrics, EvaluatorError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Evaluator for FnEvaluator<F>
where
    F: Fn(&EvalRequest) -> Result<BacktestMetrics, EvaluatorError> + Send + Sync,
{
    async fn evaluate(&self, request: &EvalRequest) -> Result<BacktestMetrics, EvaluatorError> {
        (self.f)(request)
    }
}
