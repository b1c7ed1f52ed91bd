use crate::evaluator::{EvalRequest, Evaluator, EvaluatorError};
use crate::events::{EventBus, OptimizerEvent};
use crate::optimize::model::{BestTrial, JobKind, JobOutput, JobRecord, StopReason, Trial};
use crate::optimize::scoring::{profit_factor, score, ScoreWeights};
use crate::optimize::space::{GridIter, ParamAssignment, ParamSpace};
use crate::optimize::walk_forward::{self, FoldScore, WalkForwardConfig, WalkForwardReport, Window};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

const LEADERBOARD_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerOptions {
    pub max_evaluations: usize,
    pub early_stop_plateau: Option<usize>,
    pub weights: ScoreWeights,
    pub seed: Option<u64>,
    pub walk_forward: Option<WalkForwardConfig>,
}

impl RunnerOptions {
    pub fn new(max_evaluations: usize) -> Self {
        Self {
            max_evaluations,
            early_stop_plateau: None,
            weights: ScoreWeights::default(),
            seed: None,
            walk_forward: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Finished(JobOutput),
    /// Cancellation flag observed between trials.
    Canceled { trials_run: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("evaluator failed on trial {trial}")]
    Evaluator {
        trial: usize,
        #[source]
        source: EvaluatorError,
    },
    #[error("evaluator failed during walk-forward fold {fold}")]
    WalkForward {
        fold: usize,
        #[source]
        source: EvaluatorError,
    },
}

enum TrialSource {
    Grid(GridIter),
    /// Uniform random draws over range bounds. This is the "bayes" mode of
    /// the original tooling: a baseline with no surrogate model.
    Sampled { space: ParamSpace, rng: StdRng },
}

impl TrialSource {
    fn new(space: &ParamSpace, seed: Option<u64>) -> Self {
        match space {
            ParamSpace::Grid { .. } => TrialSource::Grid(space.grid_iter()),
            ParamSpace::Range { .. } => TrialSource::Sampled {
                space: space.clone(),
                rng: match seed {
                    Some(s) => StdRng::seed_from_u64(s),
                    None => StdRng::from_entropy(),
                },
            },
        }
    }

    fn next(&mut self) -> Option<ParamAssignment> {
        match self {
            TrialSource::Grid(iter) => iter.next(),
            TrialSource::Sampled { space, rng } => space.sample(rng),
        }
    }
}

/// Drives the trials of one job.
///
/// The only suspension points are evaluator calls. The cancellation flag is
/// checked before every trial, so an in-flight call always completes and no
/// further trial starts once the flag is raised.
pub struct SearchRunner {
    job_id: String,
    strategy_ref: String,
    space: ParamSpace,
    options: RunnerOptions,
}

impl SearchRunner {
    pub fn new(
        job_id: impl Into<String>,
        strategy_ref: impl Into<String>,
        space: ParamSpace,
        options: RunnerOptions,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            strategy_ref: strategy_ref.into(),
            space,
            options,
        }
    }

    /// Backtest jobs evaluate the baseline point once; optimize jobs search
    /// the whole space within budget.
    pub fn for_job(record: &JobRecord) -> Self {
        let (space, max_evaluations) = match record.kind {
            JobKind::Backtest => (record.param_space.baseline(), 1),
            JobKind::Optimize => (record.param_space.clone(), record.budget),
        };
        let options = RunnerOptions {
            max_evaluations,
            early_stop_plateau: record.options.early_stop_plateau,
            weights: record.options.weights,
            seed: record.options.seed,
            walk_forward: record.options.walk_forward,
        };
        Self::new(record.id.clone(), record.strategy_ref.clone(), space, options)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn run(
        &self,
        evaluator: &dyn Evaluator,
        bus: &EventBus,
        cancel: &AtomicBool,
    ) -> Result<RunOutcome, RunnerError> {
        let started = Instant::now();
        let mut source = TrialSource::new(&self.space, self.options.seed);
        let mut best: Option<BestTrial> = None;
        let mut leaderboard: Vec<Trial> = Vec::new();
        let mut since_improvement = 0usize;
        let mut trials_run = 0usize;

        let stop_reason = loop {
            if cancel.load(Ordering::SeqCst) {
                info!("■ [{}] canceled after {} trials", self.job_id, trials_run);
                return Ok(RunOutcome::Canceled { trials_run });
            }
            if trials_run >= self.options.max_evaluations {
                // a grid that ran out exactly at the budget counts as exhausted
                break match source.next() {
                    Some(_) => StopReason::Budget,
                    None => StopReason::Exhausted,
                };
            }
            let Some(params) = source.next() else {
                break StopReason::Exhausted;
            };

            let index = trials_run;
            let request = EvalRequest {
                strategy_ref: self.strategy_ref.clone(),
                params,
                window: None,
            };
            let metrics = evaluator
                .evaluate(&request)
                .await
                .map_err(|source| RunnerError::Evaluator {
                    trial: index,
                    source,
                })?;
            trials_run += 1;

            let trial_score = score(&metrics, &self.options.weights);
            let improved = match &best {
                None => true,
                Some(b) => trial_score > b.score || (b.score.is_nan() && !trial_score.is_nan()),
            };
            if improved {
                best = Some(BestTrial {
                    params: request.params.clone(),
                    score: trial_score,
                });
                since_improvement = 0;
            } else {
                since_improvement += 1;
            }

            let incumbent = best.clone().unwrap_or_else(|| BestTrial {
                params: request.params.clone(),
                score: trial_score,
            });
            bus.publish(OptimizerEvent::Evaluation {
                job_id: self.job_id.clone(),
                trial: index,
                params: request.params.clone(),
                score: trial_score,
                best: incumbent,
            });

            insert_ranked(
                &mut leaderboard,
                Trial {
                    index,
                    pf_approximated: profit_factor(&metrics).approximated,
                    params: request.params,
                    metrics,
                    score: trial_score,
                },
            );

            if let Some(plateau) = self.options.early_stop_plateau {
                if since_improvement >= plateau {
                    info!(
                        "⏹ [{}] plateau of {} trials reached, stopping early",
                        self.job_id, plateau
                    );
                    break StopReason::Plateau;
                }
            }
        };

        // budget > 0 and a validated space always yield at least one trial
        let Some(best) = best else {
            return Ok(RunOutcome::Canceled { trials_run });
        };

        let validation = match &self.options.walk_forward {
            Some(cfg) => {
                match self.validate_best(evaluator, &best, cfg, cancel).await? {
                    Some(report) => Some(report),
                    None if cancel.load(Ordering::SeqCst) => {
                        return Ok(RunOutcome::Canceled { trials_run });
                    }
                    None => None,
                }
            }
            None => None,
        };

        info!(
            "✓ [{}] search finished ({:?}) after {} trials, best score {:.4}",
            self.job_id, stop_reason, trials_run, best.score
        );

        Ok(RunOutcome::Finished(JobOutput {
            best,
            trials_run,
            stop_reason,
            leaderboard,
            validation,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }))
    }

    /// Scores the winner on every fold's train and test window.
    async fn validate_best(
        &self,
        evaluator: &dyn Evaluator,
        best: &BestTrial,
        cfg: &WalkForwardConfig,
        cancel: &AtomicBool,
    ) -> Result<Option<WalkForwardReport>, RunnerError> {
        let folds = walk_forward::splits(cfg.total_length, cfg.folds);
        if folds.is_empty() {
            warn!(
                "⚠ [{}] timeline of {} points too short for {} folds, skipping validation",
                self.job_id, cfg.total_length, cfg.folds
            );
            return Ok(None);
        }

        let mut scores = Vec::with_capacity(folds.len());
        for fold in folds {
            if cancel.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let train_score = self
                .score_window(evaluator, &best.params, fold.train)
                .await
                .map_err(|source| RunnerError::WalkForward {
                    fold: fold.index,
                    source,
                })?;
            let test_score = self
                .score_window(evaluator, &best.params, fold.test)
                .await
                .map_err(|source| RunnerError::WalkForward {
                    fold: fold.index,
                    source,
                })?;
            scores.push(FoldScore {
                fold,
                train_score,
                test_score,
            });
        }

        let report = walk_forward::summarize(cfg, scores);
        if report.overfit_detected {
            warn!(
                "⚠ [{}] overfit detected: in-sample {:.4}, out-of-sample {:.4}, score {:.2}",
                self.job_id, report.in_sample, report.out_sample, report.overfit_score
            );
        }
        Ok(Some(report))
    }

    async fn score_window(
        &self,
        evaluator: &dyn Evaluator,
        params: &ParamAssignment,
        window: Window,
    ) -> Result<f64, EvaluatorError> {
        let request = EvalRequest {
            strategy_ref: self.strategy_ref.clone(),
            params: params.clone(),
            window: Some(window),
        };
        let metrics = evaluator.evaluate(&request).await?;
        Ok(score(&metrics, &self.options.weights))
    }
}

/// Keeps the top trials by score; ties keep arrival order.
fn insert_ranked(board: &mut Vec<Trial>, trial: Trial) {
    let pos = board
        .iter()
        .position(|t| trial.score > t.score)
        .unwrap_or(board.len());
    if pos < LEADERBOARD_SIZE {
        board.insert(pos, trial);
        board.truncate(LEADERBOARD_SIZE);
    }
}
