use crate::core::EvaluationError;
use rayon::prelude::*;
use tracing::debug;

/// Scores at or above this value mean "evaluation failed".
pub const FAILURE_THRESHOLD: f64 = 1e9;

/// Sentinel an evaluator returns when it cannot produce a score
pub const FAILED: f64 = FAILURE_THRESHOLD;

/// True for the failure sentinel and for anything that is not a usable score.
#[inline]
pub fn is_failure(score: f64) -> bool {
    !score.is_finite() || score >= FAILURE_THRESHOLD
}

/// The black box being calibrated.
///
/// `evaluate` runs the simulation for `params` and returns a non-negative
/// error, or [`FAILED`] when the simulation produced nothing usable. Repeated
/// calls with the same input may return different values. `tag` identifies
/// the call for the evaluator's own logging and is never interpreted here.
///
/// Returning `Err` is reserved for unexpected failures and aborts the run.
pub trait Evaluator: Sync {
    fn evaluate(&self, params: &[f64], tag: &str) -> Result<f64, EvaluationError>;
}

impl<F> Evaluator for F
where
    F: Fn(&[f64], &str) -> f64 + Sync,
{
    fn evaluate(&self, params: &[f64], tag: &str) -> Result<f64, EvaluationError> {
        Ok(self(params, tag))
    }
}

/// Adapter for closures that can raise.
pub struct FallibleFn<F>(pub F);

impl<F> Evaluator for FallibleFn<F>
where
    F: Fn(&[f64], &str) -> Result<f64, EvaluationError> + Sync,
{
    fn evaluate(&self, params: &[f64], tag: &str) -> Result<f64, EvaluationError> {
        (self.0)(params, tag)
    }
}

/// Averages several noisy evaluations of the same point.
///
/// Failed repeats are left out of the mean; the point only fails when every
/// repeat fails. Each repeat gets the tag `"{tag}_rep{i}"`.
pub struct AveragedEvaluator<E> {
    inner: E,
    repeats: usize,
    parallel: bool,
}

impl<E: Evaluator> AveragedEvaluator<E> {
    pub fn new(inner: E, repeats: usize) -> Self {
        Self {
            inner,
            repeats: repeats.max(1),
            parallel: false,
        }
    }

    /// Evaluate the repeats on the rayon pool
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn repeats(&self) -> usize {
        self.repeats
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: Evaluator> Evaluator for AveragedEvaluator<E> {
    fn evaluate(&self, params: &[f64], tag: &str) -> Result<f64, EvaluationError> {
        let run_one = |i: usize| self.inner.evaluate(params, &format!("{}_rep{}", tag, i + 1));

        let scores: Vec<f64> = if self.parallel {
            (0..self.repeats)
                .into_par_iter()
                .map(run_one)
                .collect::<Result<_, _>>()?
        } else {
            (0..self.repeats).map(run_one).collect::<Result<_, _>>()?
        };

        let valid: Vec<f64> = scores.into_iter().filter(|&s| !is_failure(s)).collect();
        if valid.is_empty() {
            debug!(tag, repeats = self.repeats, "all repeats failed");
            return Ok(FAILED);
        }
        if valid.len() < self.repeats {
            debug!(
                tag,
                valid = valid.len(),
                repeats = self.repeats,
                "averaging over partial repeats"
            );
        }
        Ok(valid.iter().sum::<f64>() / valid.len() as f64)
    }
}
