//! Composite score of a trial:
//!
//! `score = wPnL*totalReturn + wSharpe*sharpeRatio - wMaxDD*|maxDrawdown| + wPF*profitFactor`

use crate::evaluator::BacktestMetrics;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreWeights {
    pub w_pnl: f64,
    pub w_sharpe: f64,
    pub w_max_dd: f64,
    pub w_pf: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            w_pnl: 1.0,
            w_sharpe: 1.0,
            w_max_dd: 1.0,
            w_pf: 1.0,
        }
    }
}

/// Profit factor plus whether it came from the trade-count proxy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfitFactor {
    pub value: f64,
    pub approximated: bool,
}

/// Uses real gross profit / gross loss when the evaluator reports both.
///
/// Otherwise falls back to an APPROXIMATION from trade count and win rate:
/// `grossProfit ≈ max(1, trades*2)`, `grossLoss ≈ max(1, trades*(1-winRate))`.
/// The proxy is not trade accounting; callers can tell via `approximated`.
pub fn profit_factor(metrics: &BacktestMetrics) -> ProfitFactor {
    if let (Some(gp), Some(gl)) = (metrics.gross_profit, metrics.gross_loss) {
        if gl > 0.0 && gp.is_finite() && gl.is_finite() {
            return ProfitFactor {
                value: gp / gl,
                approximated: false,
            };
        }
    }

    let trades = metrics.trades as f64;
    let win_rate = normalized_win_rate(metrics.win_rate);
    let gross_profit = (trades * 2.0).max(1.0);
    let gross_loss = (trades * (1.0 - win_rate)).max(1.0);
    ProfitFactor {
        value: gross_profit / gross_loss,
        approximated: true,
    }
}

/// Engines that report percentages (52 instead of 0.52) are scaled down.
fn normalized_win_rate(raw: f64) -> f64 {
    let rate = if raw > 1.0 { raw / 100.0 } else { raw };
    rate.clamp(0.0, 1.0)
}

/// Scores are clamped to `±SCORE_LIMIT`.
pub const SCORE_LIMIT: f64 = 1e300;

/// Score given to trials whose metrics do not add up to a finite number.
pub const WORST_SCORE: f64 = -SCORE_LIMIT;

/// Always finite and within `±SCORE_LIMIT`: overflowing or NaN results score
/// as `WORST_SCORE`, so a broken evaluator payload never wins a search or
/// reaches storage as `null`.
pub fn score(metrics: &BacktestMetrics, weights: &ScoreWeights) -> f64 {
    let pf = profit_factor(metrics);
    let raw = weights.w_pnl * metrics.total_return + weights.w_sharpe * metrics.sharpe_ratio
        - weights.w_max_dd * metrics.max_drawdown.abs()
        + weights.w_pf * pf.value;
    if raw.is_finite() {
        raw.clamp(WORST_SCORE, SCORE_LIMIT)
    } else {
        WORST_SCORE
    }
}
