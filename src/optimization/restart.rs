use super::callback::OptimizationCallback;
use super::evaluator::Evaluator;
use super::spsa::{SpsaOptimizer, rng_for};
use crate::core::{Bounds, CalibrationError, CalibrationResult, RunError, RunRecord, Solution};
use tracing::{error, info, warn};

/// Name of run `index` (0-based): `"Run 1"`, then `"Restart 1"`, `"Restart 2"`, ...
pub fn run_name(index: usize) -> String {
    if index == 0 {
        "Run 1".to_string()
    } else {
        format!("Restart {}", index)
    }
}

/// Chains several SPSA runs.
///
/// Each restart continues from the previous run's *final* vector, not from
/// its best one. The global best and the cumulative trace span all runs.
#[derive(Clone, Debug)]
pub struct RestartOrchestrator {
    optimizer: SpsaOptimizer,
    num_runs: usize,
    seeds: Option<Vec<u64>>,
}

impl RestartOrchestrator {
    pub fn new(optimizer: SpsaOptimizer, num_runs: usize) -> Self {
        Self {
            optimizer,
            num_runs,
            seeds: None,
        }
    }

    /// One seed per run; run `i` draws its perturbations from `seeds[i]`
    pub fn with_seeds(mut self, seeds: Vec<u64>) -> Self {
        self.seeds = Some(seeds);
        self
    }

    pub fn optimizer(&self) -> &SpsaOptimizer {
        &self.optimizer
    }

    pub fn num_runs(&self) -> usize {
        self.num_runs
    }

    fn validate(&self, initial: &[f64], bounds: &Bounds) -> Result<(), CalibrationError> {
        bounds.check_initial(initial)?;
        self.optimizer.hyperparameters().validate()?;
        if self.optimizer.iterations() == 0 {
            return Err(CalibrationError::InvalidConfig(
                "iterations_per_run must be positive".into(),
            ));
        }
        if self.num_runs == 0 {
            return Err(CalibrationError::InvalidConfig(
                "num_runs must be positive".into(),
            ));
        }
        if let Some(seeds) = &self.seeds {
            if seeds.len() != self.num_runs {
                return Err(CalibrationError::InvalidConfig(format!(
                    "expected {} seeds, got {}",
                    self.num_runs,
                    seeds.len()
                )));
            }
        }
        Ok(())
    }

    /// Run the whole restart session.
    ///
    /// Configuration problems are returned before the first evaluation. A
    /// run aborted by the evaluator is logged and kept for the iterations it
    /// completed; the next restart starts from the same point it did. When
    /// no run produces a finite error, `best` is `None`.
    pub fn calibrate(
        &self,
        evaluator: &dyn Evaluator,
        initial: &[f64],
        bounds: &Bounds,
        callback: &mut dyn OptimizationCallback,
    ) -> Result<CalibrationResult, CalibrationError> {
        self.validate(initial, bounds)?;

        let mut result = CalibrationResult {
            runs: Vec::with_capacity(self.num_runs),
            cumulative_trace: Vec::with_capacity(self.num_runs * self.optimizer.iterations()),
            ..Default::default()
        };
        let mut current_initial = bounds.clipped(initial);

        for run_index in 0..self.num_runs {
            let name = run_name(run_index);
            let seed = self.seeds.as_ref().map(|s| s[run_index]);
            let mut rng = rng_for(seed);

            let record = match self.optimizer.run(
                evaluator,
                &current_initial,
                bounds,
                &name,
                &mut rng,
                callback,
            ) {
                Ok(record) => {
                    current_initial = record.final_params.clone();
                    record
                }
                Err(RunError::Aborted {
                    completed,
                    partial,
                    source,
                    ..
                }) => {
                    error!(run = %name, completed, "SPSA run failed: {}", source);
                    *partial
                }
                Err(RunError::Config(e)) => return Err(e),
            };

            Self::absorb(&mut result, record, run_index);

            if callback.should_stop() {
                warn!(after_run = %name, "calibration cancelled");
                result.cancelled = true;
                break;
            }
        }

        match &result.best {
            Some(best) => info!(
                runs = result.runs.len(),
                failed = result.failed_runs(),
                total_iterations = result.total_iterations(),
                "calibration finished, best error = {:.4} (found in {})",
                best.error,
                run_name(best.run_index)
            ),
            None => warn!(
                runs = result.runs.len(),
                "calibration finished without a valid result"
            ),
        }

        Ok(result)
    }

    /// Fold one run into the session result
    fn absorb(result: &mut CalibrationResult, record: RunRecord, run_index: usize) {
        let improves = record.has_valid_best()
            && result
                .best
                .as_ref()
                .is_none_or(|best| record.best_error < best.error);
        if improves {
            result.best = Some(Solution {
                params: record.best_params.clone(),
                error: record.best_error,
                run_index,
            });
        }

        for &entry in &record.trace {
            let next = match result.cumulative_trace.last() {
                Some(&prev) => prev.min(entry),
                None => entry,
            };
            result.cumulative_trace.push(next);
        }

        result.runs.push(record);
    }
}
