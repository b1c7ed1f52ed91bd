//! Walk-forward validation: expanding train windows, fixed-size test windows.
//!
//! The timeline is cut into `folds + 1` equal segments. Fold `i` trains on
//! every segment before `i + 1` and tests on segment `i + 1`, so test windows
//! are chronological and never overlap.

use crate::optimize::model::ValidationError;
use serde::{Deserialize, Serialize};

/// Half-open index range `[start, end)` over the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: usize,
    pub end: usize,
}

impl Window {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    pub index: usize,
    pub train: Window,
    pub test: Window,
}

fn default_threshold() -> f64 {
    0.6
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkForwardConfig {
    pub total_length: usize,
    pub folds: usize,
    /// Minimum acceptable out-of-sample / in-sample ratio.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

impl WalkForwardConfig {
    pub fn new(total_length: usize, folds: usize) -> Self {
        Self {
            total_length,
            folds,
            threshold: default_threshold(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.folds == 0 {
            return Err(ValidationError::InvalidWalkForward(
                "folds must be at least 1".to_string(),
            ));
        }
        if self.total_length < self.folds + 1 {
            return Err(ValidationError::InvalidWalkForward(format!(
                "timeline of {} points cannot hold {} folds",
                self.total_length, self.folds
            )));
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ValidationError::InvalidWalkForward(format!(
                "threshold {} out of range",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Scores of the winning parameters on one fold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoldScore {
    pub fold: Fold,
    pub train_score: f64,
    pub test_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkForwardReport {
    pub folds: Vec<FoldScore>,
    pub in_sample: f64,
    pub out_sample: f64,
    pub overfit_score: f64,
    pub overfit_detected: bool,
    pub threshold: f64,
}

/// Chronological folds; empty when the timeline is too short for one segment.
pub fn splits(total_length: usize, folds: usize) -> Vec<Fold> {
    let seg = total_length / (folds + 1);
    if seg == 0 {
        return Vec::new();
    }
    (0..folds)
        .map(|i| {
            let boundary = seg * (i + 1);
            Fold {
                index: i,
                train: Window::new(0, boundary),
                test: Window::new(boundary, boundary + seg),
            }
        })
        .collect()
}

/// 0 means no out-of-sample degradation, 1 means the edge does not transfer.
/// A non-positive in-sample score is treated as maximally overfit.
pub fn overfit_score(in_sample: f64, out_sample: f64) -> f64 {
    if in_sample <= 0.0 {
        return 1.0;
    }
    // out/in overflows for tiny in-sample scores; keep the result finite
    (1.0 - out_sample / in_sample).max(0.0).min(f64::MAX)
}

pub fn summarize(config: &WalkForwardConfig, folds: Vec<FoldScore>) -> WalkForwardReport {
    let n = folds.len().max(1) as f64;
    // divide first so scores near f64::MIN cannot overflow the sum
    let in_sample = folds.iter().map(|f| f.train_score / n).sum::<f64>();
    let out_sample = folds.iter().map(|f| f.test_score / n).sum::<f64>();
    let overfit = overfit_score(in_sample, out_sample);
    WalkForwardReport {
        folds,
        in_sample,
        out_sample,
        overfit_score: overfit,
        overfit_detected: overfit > 1.0 - config.threshold,
        threshold: config.threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_expand_train_and_slide_test() {
        let folds = splits(100, 3);
        assert_eq!(folds.len(), 3);
        assert_eq!(folds[0].train, Window::new(0, 25));
        assert_eq!(folds[0].test, Window::new(25, 50));
        assert_eq!(folds[1].train, Window::new(0, 50));
        assert_eq!(folds[1].test, Window::new(50, 75));
        assert_eq!(folds[2].train, Window::new(0, 75));
        assert_eq!(folds[2].test, Window::new(75, 100));
    }

    #[test]
    fn test_windows_never_overlap() {
        let folds = splits(1003, 7);
        for pair in folds.windows(2) {
            assert!(pair[0].test.end <= pair[1].test.start);
            assert!(pair[0].test.start < pair[1].test.start);
        }
        assert!(folds.iter().all(|f| f.test.end <= 1003));
        assert!(folds.iter().all(|f| f.train.end == f.test.start));
    }

    #[test]
    fn too_short_timeline_yields_no_folds() {
        assert!(splits(3, 5).is_empty());
        assert!(splits(0, 1).is_empty());
    }

    #[test]
    fn overfit_score_boundaries() {
        assert_eq!(overfit_score(2.0, 1.0), 0.5);
        assert_eq!(overfit_score(0.0, 5.0), 1.0);
        assert_eq!(overfit_score(0.0, -5.0), 1.0);
        assert_eq!(overfit_score(-1.0, 3.0), 1.0);
        assert_eq!(overfit_score(1.0, 1.0), 0.0);
        // better out-of-sample clamps to zero
        assert_eq!(overfit_score(1.0, 3.0), 0.0);
    }

    #[test]
    fn summarize_flags_weak_transfer() {
        let cfg = WalkForwardConfig::new(100, 1);
        let fold = splits(100, 1)[0];
        let weak = summarize(
            &cfg,
            vec![FoldScore {
                fold,
                train_score: 2.0,
                test_score: 1.0,
            }],
        );
        assert_eq!(weak.overfit_score, 0.5);
        assert!(weak.overfit_detected);

        let ok = summarize(
            &cfg,
            vec![FoldScore {
                fold,
                train_score: 2.0,
                test_score: 1.8,
            }],
        );
        assert!(!ok.overfit_detected);
    }

    #[test]
    fn extreme_fold_scores_stay_finite() {
        let cfg = WalkForwardConfig::new(100, 2);
        let folds = splits(100, 2);
        let report = summarize(
            &cfg,
            folds
                .into_iter()
                .map(|fold| FoldScore {
                    fold,
                    train_score: 1e-300,
                    test_score: f64::MIN,
                })
                .collect(),
        );
        assert_eq!(report.out_sample, f64::MIN);
        assert!(report.overfit_score.is_finite());
        assert!(report.overfit_detected);
        assert!(serde_json::to_string(&report).unwrap().contains("overfitScore"));
    }

    #[test]
    fn config_validation() {
        assert!(WalkForwardConfig::new(100, 0).validate().is_err());
        assert!(WalkForwardConfig::new(2, 2).validate().is_err());
        assert!(WalkForwardConfig::new(3, 2).validate().is_ok());
    }
}
