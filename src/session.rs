//! One calibration session driven by a [`CalibrationConfig`].

use crate::config::CalibrationConfig;
use crate::core::{CalibrationError, CalibrationResult, EvaluationError, Parameter, Solution};
use crate::optimization::{Evaluator, OptimizationCallback, is_failure};
use crate::report;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Tag used for the re-evaluation of the best vector
pub const VERIFICATION_TAG: &str = "final_verification";

/// Validate `config` and run the restart session it describes.
pub fn calibrate_with_config(
    config: &CalibrationConfig,
    evaluator: &dyn Evaluator,
    callback: &mut dyn OptimizationCallback,
) -> Result<CalibrationResult, CalibrationError> {
    config.validate()?;
    let bounds = config.bounds()?;
    let initial = config.initial_vector(&bounds)?;

    info!(
        params = bounds.len(),
        runs = config.num_runs,
        iterations_per_run = config.iterations_per_run,
        "starting SPSA calibration with restarts, parameters: {:?}",
        config.param_names()
    );

    config
        .orchestrator()
        .calibrate(evaluator, &initial, &bounds, callback)
}

/// Outcome of re-evaluating the best vector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verification {
    /// No run produced a best vector, nothing was evaluated
    NoResult,
    /// The evaluator returned a failure score
    Failed(f64),
    Score(f64),
}

impl Verification {
    pub fn score(&self) -> Option<f64> {
        match self {
            Self::Score(score) => Some(*score),
            _ => None,
        }
    }
}

/// Finished session: result plus timing, ready to be reported.
pub struct CalibrationSession {
    pub config: CalibrationConfig,
    pub result: CalibrationResult,
    pub elapsed: Duration,
}

impl CalibrationSession {
    pub fn run(
        config: CalibrationConfig,
        evaluator: &dyn Evaluator,
        callback: &mut dyn OptimizationCallback,
    ) -> Result<Self, CalibrationError> {
        let start = Instant::now();
        let result = calibrate_with_config(&config, evaluator, callback)?;
        let elapsed = start.elapsed();
        Ok(Self {
            config,
            result,
            elapsed,
        })
    }

    pub fn param_names(&self) -> Vec<String> {
        self.config.param_names()
    }

    pub fn best(&self) -> Option<&Solution> {
        self.result.best.as_ref()
    }

    /// Best vector as named parameters carrying their configured bounds
    pub fn best_parameters(&self) -> Option<Vec<Parameter>> {
        let best = self.best()?;
        Some(
            self.config
                .parameters
                .iter()
                .zip(&best.params)
                .map(|((name, &(lower, upper)), &value)| {
                    Parameter::new(name.clone(), value, lower, upper)
                })
                .collect(),
        )
    }

    /// Evaluate the best vector once more under [`VERIFICATION_TAG`].
    pub fn verify(&self, evaluator: &dyn Evaluator) -> Result<Verification, EvaluationError> {
        let Some(best) = self.best() else {
            info!("no best parameters, skipping final verification");
            return Ok(Verification::NoResult);
        };
        let score = evaluator.evaluate(&best.params, VERIFICATION_TAG)?;
        if is_failure(score) {
            warn!(score, "final verification evaluation failed");
            return Ok(Verification::Failed(score));
        }
        info!("error from final verification run: {:.4}", score);
        Ok(Verification::Score(score))
    }

    pub fn log_summary(&self) {
        report::log_summary(&self.param_names(), &self.result, self.elapsed);
    }

    /// Write `best_calibrated_parameters_spsa.txt` and `spsa_convergence.json`
    /// into `dir`. The parameter file is skipped when there is no result.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<(), CalibrationError> {
        let dir = dir.as_ref();
        let names = self.param_names();
        if let Some(best) = self.best() {
            report::write_best_parameters(
                dir.join("best_calibrated_parameters_spsa.txt"),
                &names,
                best,
            )?;
        }
        report::write_convergence_json(dir.join("spsa_convergence.json"), &names, &self.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::{FAILED, NoopCallback};

    fn config() -> CalibrationConfig {
        CalibrationConfig::from_json_str(
            r#"{
                "parameters": {"accel": [1.0, 4.0], "tau": [0.5, 2.0]},
                "hyperparameters": {"a": 0.2, "c": 0.2, "A": 5, "alpha": 0.602, "gamma": 0.101},
                "iterations_per_run": 10,
                "num_runs": 2,
                "seeds": [3, 4]
            }"#,
        )
        .unwrap()
    }

    fn target(x: &[f64], _: &str) -> f64 {
        ((x[0] - 3.0).powi(2) + (x[1] - 1.0).powi(2)).sqrt()
    }

    #[test]
    fn test_session_runs_and_saves() {
        let session = CalibrationSession::run(config(), &target, &mut NoopCallback).unwrap();
        assert_eq!(session.result.runs.len(), 2);
        assert_eq!(session.result.total_iterations(), 20);
        let best = session.best().unwrap();
        // midpoint start (2.5, 1.25) has error ~0.559
        assert!(best.error < 0.56);

        let verified = session.verify(&target).unwrap();
        assert_eq!(verified, Verification::Score(target(&best.params, "")));

        let params = session.best_parameters().unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!((params[0].name.as_str(), params[0].min_val, params[0].max_val), ("accel", 1.0, 4.0));
        assert_eq!((params[1].name.as_str(), params[1].min_val, params[1].max_val), ("tau", 0.5, 2.0));
        assert!(params.iter().all(|p| p.is_within_bounds()));
        assert_eq!(params[0].value, best.params[0]);

        // a best vector exists but the simulator now fails on it
        let broken = |_: &[f64], _: &str| FAILED;
        assert_eq!(session.verify(&broken).unwrap(), Verification::Failed(FAILED));
        assert_eq!(Verification::Failed(FAILED).score(), None);

        let dir = tempfile::tempdir().unwrap();
        session.save(dir.path()).unwrap();
        assert!(dir.path().join("best_calibrated_parameters_spsa.txt").exists());
        assert!(dir.path().join("spsa_convergence.json").exists());
        session.log_summary();
    }

    #[test]
    fn test_session_without_result() {
        let failing = |_: &[f64], _: &str| FAILED;
        let session = CalibrationSession::run(config(), &failing, &mut NoopCallback).unwrap();
        assert!(session.best().is_none());
        assert!(session.best_parameters().is_none());
        let never = |_: &[f64], _: &str| -> f64 { panic!("nothing to verify") };
        assert_eq!(session.verify(&never).unwrap(), Verification::NoResult);

        let dir = tempfile::tempdir().unwrap();
        session.save(dir.path()).unwrap();
        assert!(!dir.path().join("best_calibrated_parameters_spsa.txt").exists());
        assert!(dir.path().join("spsa_convergence.json").exists());
    }

    #[test]
    fn test_invalid_config_is_rejected_before_evaluating() {
        let mut bad = config();
        bad.num_runs = 0;
        let never = |_: &[f64], _: &str| -> f64 { panic!("must not evaluate") };
        assert!(calibrate_with_config(&bad, &never, &mut NoopCallback).is_err());
    }
}
