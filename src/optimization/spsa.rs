use super::callback::{IterationProgress, OptimizationCallback};
use super::evaluator::{Evaluator, is_failure};
use crate::core::{Bounds, EvaluationError, RunError, RunRecord, RunStatus, SpsaHyperparameters};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

/// Smallest magnitude allowed in the gradient denominator
const MIN_DENOMINATOR: f64 = 1e-9;

/// Seeded generator when `seed` is given, entropy-seeded otherwise
pub fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// Perturbation direction with independent ±1 entries, each with probability 1/2
pub fn rademacher<R: Rng + ?Sized>(rng: &mut R, n: usize) -> Vec<f64> {
    (0..n)
        .map(|_| if rng.gen_bool(0.5) { 1.0 } else { -1.0 })
        .collect()
}

/// Simultaneous Perturbation Stochastic Approximation over a box.
///
/// Every iteration estimates the gradient from two evaluations at
/// `theta ± c_k * delta` and steps by `a_k` against it. The optimizer holds
/// no state between runs.
#[derive(Clone, Debug)]
pub struct SpsaOptimizer {
    hyperparameters: SpsaHyperparameters,
    iterations: usize,
    parallel_probes: bool,
}

impl SpsaOptimizer {
    pub fn new(hyperparameters: SpsaHyperparameters, iterations: usize) -> Self {
        Self {
            hyperparameters,
            iterations,
            parallel_probes: false,
        }
    }

    /// Evaluate the two probes of an iteration concurrently
    pub fn with_parallel_probes(mut self, parallel: bool) -> Self {
        self.parallel_probes = parallel;
        self
    }

    pub fn hyperparameters(&self) -> &SpsaHyperparameters {
        &self.hyperparameters
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Same as [`run`](Self::run) with a generator built from `seed`.
    pub fn run_seeded(
        &self,
        evaluator: &dyn Evaluator,
        initial: &[f64],
        bounds: &Bounds,
        run_name: &str,
        seed: Option<u64>,
        callback: &mut dyn OptimizationCallback,
    ) -> Result<RunRecord, RunError> {
        let mut rng = rng_for(seed);
        self.run(evaluator, initial, bounds, run_name, &mut rng, callback)
    }

    /// Execute one bounded SPSA search from `initial`.
    ///
    /// A failed evaluation (see [`is_failure`]) skips the update for that
    /// iteration but still appends the previous best to the trace. An `Err`
    /// from the evaluator ends the run with [`RunError::Aborted`], carrying
    /// what was accumulated so far.
    pub fn run<R: Rng + ?Sized>(
        &self,
        evaluator: &dyn Evaluator,
        initial: &[f64],
        bounds: &Bounds,
        run_name: &str,
        rng: &mut R,
        callback: &mut dyn OptimizationCallback,
    ) -> Result<RunRecord, RunError> {
        bounds.check_initial(initial)?;
        self.hyperparameters.validate()?;

        let n = initial.len();
        let hp = &self.hyperparameters;

        let mut theta = bounds.clipped(initial);
        let mut record = RunRecord::start(run_name, theta.clone(), self.iterations);
        callback.on_run_start(run_name, &theta);

        let mut theta_plus = vec![0.0; n];
        let mut theta_minus = vec![0.0; n];

        for k in 0..self.iterations {
            let a_k = hp.step_gain(k);
            let c_k = hp.perturbation_gain(k);
            let delta = rademacher(rng, n);

            for i in 0..n {
                theta_plus[i] = theta[i] + c_k * delta[i];
                theta_minus[i] = theta[i] - c_k * delta[i];
            }
            bounds.clip(&mut theta_plus);
            bounds.clip(&mut theta_minus);

            let tag_plus = format!("{}_iter{}_p", run_name, k + 1);
            let tag_minus = format!("{}_iter{}_m", run_name, k + 1);

            let (y_plus, y_minus) =
                match self.evaluate_pair(evaluator, &theta_plus, &theta_minus, &tag_plus, &tag_minus) {
                    Ok(pair) => pair,
                    Err(source) => {
                        record.final_params = theta;
                        record.status = RunStatus::Aborted(source.to_string());
                        return Err(RunError::Aborted {
                            run: run_name.to_string(),
                            completed: k,
                            partial: Box::new(record),
                            source,
                        });
                    }
                };
            record.evaluations += 2;
            debug!(run = run_name, iteration = k + 1, y_plus, y_minus, "probes evaluated");

            if is_failure(y_plus) || is_failure(y_minus) {
                record.skipped_iterations += 1;
                record.trace.push(record.best_error);
                callback.on_iteration(&IterationProgress {
                    run_name,
                    iteration: k + 1,
                    total_iterations: self.iterations,
                    y_plus,
                    y_minus,
                    iteration_best: None,
                    best_error: record.best_error,
                    params: &theta,
                });
                if callback.should_stop() {
                    record.status = RunStatus::Cancelled;
                    break;
                }
                continue;
            }

            let diff = y_plus - y_minus;
            for i in 0..n {
                let mut denominator = 2.0 * c_k * delta[i];
                if denominator.abs() < MIN_DENOMINATOR {
                    denominator = MIN_DENOMINATOR.copysign(denominator);
                }
                theta[i] -= a_k * (diff / denominator);
            }
            bounds.clip(&mut theta);

            let candidate = y_plus.min(y_minus);
            if candidate < record.best_error {
                record.best_error = candidate;
                record.best_params = if y_plus < y_minus {
                    theta_plus.clone()
                } else {
                    theta_minus.clone()
                };
            }
            record.trace.push(record.best_error);

            callback.on_iteration(&IterationProgress {
                run_name,
                iteration: k + 1,
                total_iterations: self.iterations,
                y_plus,
                y_minus,
                iteration_best: Some(candidate),
                best_error: record.best_error,
                params: &theta,
            });

            if callback.should_stop() {
                record.status = RunStatus::Cancelled;
                break;
            }
        }

        if record.status == RunStatus::Cancelled {
            warn!(
                run = run_name,
                completed = record.trace.len(),
                "run cancelled between iterations"
            );
        }

        record.final_params = theta;
        callback.on_run_end(&record);
        Ok(record)
    }

    fn evaluate_pair(
        &self,
        evaluator: &dyn Evaluator,
        plus: &[f64],
        minus: &[f64],
        tag_plus: &str,
        tag_minus: &str,
    ) -> Result<(f64, f64), EvaluationError> {
        if self.parallel_probes {
            let (y_plus, y_minus) = rayon::join(
                || evaluator.evaluate(plus, tag_plus),
                || evaluator.evaluate(minus, tag_minus),
            );
            Ok((y_plus?, y_minus?))
        } else {
            let y_plus = evaluator.evaluate(plus, tag_plus)?;
            let y_minus = evaluator.evaluate(minus, tag_minus)?;
            Ok((y_plus, y_minus))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CalibrationError;
    use crate::optimization::callback::NoopCallback;
    use crate::optimization::evaluator::{FAILED, FallibleFn};
    use approx::assert_relative_eq;
    use std::sync::Mutex;

    fn scenario_optimizer() -> SpsaOptimizer {
        SpsaOptimizer::new(SpsaHyperparameters::new(1.0, 1.0, 1.0, 0.6, 0.1), 5)
    }

    fn quadratic(x: &[f64], _tag: &str) -> f64 {
        (x[0] - 7.0).powi(2)
    }

    #[test]
    fn test_convex_scenario_improves_on_initial() {
        let bounds = Bounds::new(vec![(0.0, 10.0)]).unwrap();
        let initial = [2.0];
        let initial_error = quadratic(&initial, "");

        for seed in 0..20 {
            let record = scenario_optimizer()
                .run_seeded(&quadratic, &initial, &bounds, "Run 1", Some(seed), &mut NoopCallback)
                .unwrap();
            assert_eq!(record.trace.len(), 5);
            assert!(record.best_error < initial_error);
            assert_relative_eq!(record.best_error, quadratic(&record.best_params, ""));
            assert!(bounds.contains(&record.final_params));
        }
    }

    #[test]
    fn test_trace_is_non_increasing() {
        let bounds = Bounds::new(vec![(-5.0, 5.0), (-5.0, 5.0), (-5.0, 5.0)]).unwrap();
        let sphere = |x: &[f64], _: &str| x.iter().map(|v| (v - 1.0).powi(2)).sum::<f64>();
        let optimizer = SpsaOptimizer::new(SpsaHyperparameters::new(0.2, 0.5, 10.0, 0.602, 0.101), 60);

        let record = optimizer
            .run_seeded(&sphere, &[4.0, -4.0, 0.0], &bounds, "Run 1", Some(7), &mut NoopCallback)
            .unwrap();
        assert_eq!(record.trace.len(), 60);
        assert!(record.trace.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(record.best_error, *record.trace.last().unwrap());
        assert_eq!(record.evaluations, 120);
    }

    #[test]
    fn test_constant_evaluator_keeps_point() {
        let bounds = Bounds::new(vec![(0.0, 1.0), (10.0, 20.0)]).unwrap();
        let constant = |_: &[f64], _: &str| 3.5;
        let visited = Mutex::new(Vec::new());
        let recording = |x: &[f64], tag: &str| {
            visited.lock().unwrap().push(x.to_vec());
            constant(x, tag)
        };

        let optimizer = SpsaOptimizer::new(SpsaHyperparameters::new(5.0, 2.0, 0.0, 0.602, 0.101), 30);
        let record = optimizer
            .run_seeded(&recording, &[0.5, 15.0], &bounds, "Run 1", Some(1), &mut NoopCallback)
            .unwrap();

        assert_eq!(record.best_error, 3.5);
        assert!(record.trace.iter().all(|&e| e == 3.5));
        assert_eq!(record.final_params, vec![0.5, 15.0]);
        for point in visited.into_inner().unwrap() {
            assert!(bounds.contains(&point), "probe left bounds: {:?}", point);
        }
    }

    #[test]
    fn test_bound_pinned_point_stays_on_bound() {
        // slope pushes towards +inf, point starts on the upper bound
        let bounds = Bounds::new(vec![(0.0, 1.0)]).unwrap();
        let downhill = |x: &[f64], _: &str| 10.0 - x[0];
        let optimizer = SpsaOptimizer::new(SpsaHyperparameters::new(1.0, 0.1, 0.0, 0.602, 0.101), 10);

        let record = optimizer
            .run_seeded(&downhill, &[1.0], &bounds, "Run 1", Some(3), &mut NoopCallback)
            .unwrap();
        assert_eq!(record.final_params, vec![1.0]);
        assert_eq!(record.best_params, vec![1.0]);
    }

    #[test]
    fn test_initial_outside_bounds_is_clipped() {
        let bounds = Bounds::new(vec![(0.0, 1.0)]).unwrap();
        let optimizer = SpsaOptimizer::new(SpsaHyperparameters::default(), 0);
        let record = optimizer
            .run_seeded(&quadratic, &[4.0], &bounds, "Run 1", Some(0), &mut NoopCallback)
            .unwrap();
        assert_eq!(record.initial_params, vec![1.0]);
        assert_eq!(record.final_params, vec![1.0]);
        assert!(record.trace.is_empty());
        assert!(!record.has_valid_best());
    }

    #[test]
    fn test_always_failing_evaluator() {
        let bounds = Bounds::new(vec![(0.0, 1.0), (0.0, 1.0)]).unwrap();
        let failing = |_: &[f64], _: &str| FAILED;
        let record = SpsaOptimizer::new(SpsaHyperparameters::default(), 12)
            .run_seeded(&failing, &[0.2, 0.8], &bounds, "Run 1", Some(5), &mut NoopCallback)
            .unwrap();

        assert_eq!(record.best_error, f64::INFINITY);
        assert_eq!(record.trace.len(), 12);
        assert!(record.trace.iter().all(|e| e.is_infinite()));
        assert_eq!(record.skipped_iterations, 12);
        assert_eq!(record.final_params, vec![0.2, 0.8]);
        assert_eq!(record.status, RunStatus::Completed);
    }

    #[test]
    fn test_single_failed_iteration_keeps_trace_in_lockstep() {
        let bounds = Bounds::new(vec![(0.0, 10.0)]).unwrap();
        let flaky = |x: &[f64], tag: &str| {
            if tag.starts_with("Run 1_iter3_") { FAILED } else { quadratic(x, tag) }
        };
        let record = scenario_optimizer()
            .run_seeded(&flaky, &[2.0], &bounds, "Run 1", Some(11), &mut NoopCallback)
            .unwrap();
        assert_eq!(record.trace.len(), 5);
        assert_eq!(record.skipped_iterations, 1);
        assert_eq!(record.trace[2], record.trace[1]);
    }

    #[test]
    fn test_tags_passed_through() {
        let bounds = Bounds::new(vec![(0.0, 10.0)]).unwrap();
        let tags = Mutex::new(Vec::new());
        let recorder = |x: &[f64], tag: &str| {
            tags.lock().unwrap().push(tag.to_string());
            quadratic(x, tag)
        };
        let optimizer = SpsaOptimizer::new(SpsaHyperparameters::default(), 2);
        optimizer
            .run_seeded(&recorder, &[5.0], &bounds, "Restart 1", Some(2), &mut NoopCallback)
            .unwrap();
        assert_eq!(
            tags.into_inner().unwrap(),
            vec![
                "Restart 1_iter1_p",
                "Restart 1_iter1_m",
                "Restart 1_iter2_p",
                "Restart 1_iter2_m"
            ]
        );
    }

    #[test]
    fn test_seed_reproducibility() {
        let bounds = Bounds::new(vec![(0.0, 10.0), (0.0, 10.0)]).unwrap();
        let f = |x: &[f64], _: &str| (x[0] - 3.0).powi(2) + (x[1] - 6.0).powi(2);
        let optimizer = SpsaOptimizer::new(SpsaHyperparameters::new(0.5, 0.5, 5.0, 0.602, 0.101), 25);
        let a = optimizer
            .run_seeded(&f, &[1.0, 1.0], &bounds, "Run 1", Some(42), &mut NoopCallback)
            .unwrap();
        let b = optimizer
            .with_parallel_probes(true)
            .run_seeded(&f, &[1.0, 1.0], &bounds, "Run 1", Some(42), &mut NoopCallback)
            .unwrap();
        assert_eq!(a.final_params, b.final_params);
        assert_eq!(a.trace, b.trace);
    }

    #[test]
    fn test_rademacher_is_balanced() {
        let mut rng = rng_for(Some(2024));
        let n = 4;
        let draws = 20_000;
        let mut positives = vec![0usize; n];
        for _ in 0..draws {
            let delta = rademacher(&mut rng, n);
            for (count, &d) in positives.iter_mut().zip(&delta) {
                assert!(d == 1.0 || d == -1.0);
                if d > 0.0 {
                    *count += 1;
                }
            }
        }
        for count in positives {
            let freq = count as f64 / draws as f64;
            assert!((freq - 0.5).abs() < 0.02, "frequency of +1 was {}", freq);
        }
    }

    #[test]
    fn test_evaluator_error_aborts_with_partial_record() {
        let bounds = Bounds::new(vec![(0.0, 10.0)]).unwrap();
        let raising = FallibleFn(|x: &[f64], tag: &str| {
            if tag == "Run 1_iter4_m" {
                Err(EvaluationError::Failed("simulator crashed".into()))
            } else {
                Ok(quadratic(x, tag))
            }
        });
        let err = scenario_optimizer()
            .run_seeded(&raising, &[2.0], &bounds, "Run 1", Some(9), &mut NoopCallback)
            .unwrap_err();
        match err {
            RunError::Aborted {
                completed, partial, ..
            } => {
                assert_eq!(completed, 3);
                assert_eq!(partial.trace.len(), 3);
                assert!(partial.has_valid_best());
                assert!(matches!(partial.status, RunStatus::Aborted(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dimension_mismatch_is_fatal_before_evaluating() {
        let bounds = Bounds::new(vec![(0.0, 1.0)]).unwrap();
        let never = |_: &[f64], _: &str| -> f64 { panic!("must not evaluate") };
        let err = SpsaOptimizer::new(SpsaHyperparameters::default(), 3)
            .run_seeded(&never, &[0.5, 0.5], &bounds, "Run 1", None, &mut NoopCallback)
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::Config(CalibrationError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_non_finite_initial_is_fatal_before_evaluating() {
        let bounds = Bounds::new(vec![(0.0, 10.0)]).unwrap();
        let never = |_: &[f64], _: &str| -> f64 { panic!("must not evaluate") };
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = SpsaOptimizer::new(SpsaHyperparameters::default(), 3)
                .run_seeded(&never, &[bad], &bounds, "Run 1", Some(1), &mut NoopCallback)
                .unwrap_err();
            assert!(matches!(
                err,
                RunError::Config(CalibrationError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_vanishing_perturbation_keeps_theta_finite() {
        // c_k is subnormal, so both probes collapse onto theta
        let hp = SpsaHyperparameters::new(1e-3, 1e-320, 1.0, 0.602, 0.101);
        let bounds = Bounds::new(vec![(0.0, 10.0)]).unwrap();
        let record = SpsaOptimizer::new(hp, 5)
            .run_seeded(&quadratic, &[2.0], &bounds, "Run 1", Some(3), &mut NoopCallback)
            .unwrap();
        assert_eq!(record.final_params, vec![2.0]);
        assert!(record.final_params.iter().all(|v| v.is_finite()));
        assert!(bounds.contains(&record.final_params));
        assert_eq!(record.trace, vec![25.0; 5]);
    }

    #[test]
    fn test_guarded_denominator_steps_away_from_worse_side() {
        let hp = SpsaHyperparameters::new(1e-3, 1e-320, 1.0, 0.602, 0.101);
        let bounds = Bounds::new(vec![(0.0, 10.0)]).unwrap();
        // the plus side always scores worse than the minus side
        let tagged = |_: &[f64], tag: &str| if tag.ends_with("_p") { 1.0 } else { 0.0 };

        for seed in 0..8 {
            let delta = rademacher(&mut rng_for(Some(seed)), 1)[0];
            let record = SpsaOptimizer::new(hp, 1)
                .run_seeded(&tagged, &[2.0], &bounds, "Run 1", Some(seed), &mut NoopCallback)
                .unwrap();
            let theta = record.final_params[0];
            assert!(theta.is_finite());
            // step is a_0 * 1 / (±1e-9), far past the bound on the minus side
            let expected = if delta > 0.0 { 0.0 } else { 10.0 };
            assert_eq!(theta, expected);
            assert_eq!(record.best_error, 0.0);
        }
    }

    struct StopAfter(usize, usize);

    impl OptimizationCallback for StopAfter {
        fn on_iteration(&mut self, _p: &IterationProgress<'_>) {
            self.1 += 1;
        }
        fn should_stop(&self) -> bool {
            self.1 >= self.0
        }
    }

    #[test]
    fn test_cancellation_between_iterations() {
        let bounds = Bounds::new(vec![(0.0, 10.0)]).unwrap();
        let mut stop = StopAfter(2, 0);
        let record = scenario_optimizer()
            .run_seeded(&quadratic, &[2.0], &bounds, "Run 1", Some(1), &mut stop)
            .unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
        assert_eq!(record.trace.len(), 2);
        assert_eq!(record.evaluations, 4);
    }
}
