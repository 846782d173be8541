use crate::core::RunRecord;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Snapshot handed to callbacks after every completed iteration.
#[derive(Debug, Clone, Copy)]
pub struct IterationProgress<'a> {
    pub run_name: &'a str,
    /// 1-based
    pub iteration: usize,
    pub total_iterations: usize,
    pub y_plus: f64,
    pub y_minus: f64,
    /// `min(y_plus, y_minus)`; `None` when the iteration was skipped
    pub iteration_best: Option<f64>,
    pub best_error: f64,
    pub params: &'a [f64],
}

impl IterationProgress<'_> {
    pub fn skipped(&self) -> bool {
        self.iteration_best.is_none()
    }
}

/// Callback interface for optimization progress
pub trait OptimizationCallback {
    fn on_run_start(&mut self, _run_name: &str, _initial: &[f64]) {}

    /// Called once the plus/minus pair of an iteration has been processed
    fn on_iteration(&mut self, _progress: &IterationProgress<'_>) {}

    fn on_run_end(&mut self, _record: &RunRecord) {}

    /// Checked between iterations; `true` ends the session early
    fn should_stop(&self) -> bool {
        false
    }
}

/// Callback that does nothing.
pub struct NoopCallback;

impl OptimizationCallback for NoopCallback {}

/// Emits progress through `tracing` and honours an external stop flag.
///
/// Progress is reported on the first iteration, every `log_every`
/// iterations, and on the last one. Skipped iterations are always reported.
pub struct LoggingCallback {
    log_every: usize,
    param_names: Vec<String>,
    stop: Option<Arc<AtomicBool>>,
}

impl Default for LoggingCallback {
    fn default() -> Self {
        Self {
            log_every: 10,
            param_names: Vec::new(),
            stop: None,
        }
    }
}

impl LoggingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_every(mut self, every: usize) -> Self {
        self.log_every = every.max(1);
        self
    }

    /// Names used when printing initial parameter values
    pub fn with_param_names(mut self, names: Vec<String>) -> Self {
        self.param_names = names;
        self
    }

    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    fn should_report(&self, iteration: usize, total: usize) -> bool {
        iteration == 1 || iteration % self.log_every == 0 || iteration == total
    }

    fn describe(&self, values: &[f64]) -> String {
        if self.param_names.len() != values.len() {
            return format!("{:?}", values);
        }
        self.param_names
            .iter()
            .zip(values)
            .map(|(name, v)| format!("{}={:.4}", name, v))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl OptimizationCallback for LoggingCallback {
    fn on_run_start(&mut self, run_name: &str, initial: &[f64]) {
        info!(run = run_name, "starting SPSA run, initial params: {}", self.describe(initial));
    }

    fn on_iteration(&mut self, p: &IterationProgress<'_>) {
        match p.iteration_best {
            None => warn!(
                run = p.run_name,
                "iteration {}/{}: evaluation failed, skipping update",
                p.iteration,
                p.total_iterations
            ),
            Some(eval_best) if self.should_report(p.iteration, p.total_iterations) => info!(
                run = p.run_name,
                "iteration {}/{}: best eval error = {:.4}, best so far = {:.4}",
                p.iteration,
                p.total_iterations,
                eval_best,
                p.best_error
            ),
            Some(_) => {}
        }
    }

    fn on_run_end(&mut self, record: &RunRecord) {
        info!(
            run = %record.name,
            iterations = record.iterations(),
            skipped = record.skipped_iterations,
            "SPSA run finished, best error = {:.4}",
            record.best_error
        );
    }

    fn should_stop(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_cadence() {
        let cb = LoggingCallback::new();
        let reported: Vec<usize> = (1..=25).filter(|&i| cb.should_report(i, 25)).collect();
        assert_eq!(reported, vec![1, 10, 20, 25]);
    }

    #[test]
    fn test_stop_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let cb = LoggingCallback::new().with_stop_flag(flag.clone());
        assert!(!cb.should_stop());
        flag.store(true, Ordering::Relaxed);
        assert!(cb.should_stop());
        assert!(!NoopCallback.should_stop());
    }

    #[test]
    fn test_describe_uses_names() {
        let cb = LoggingCallback::new().with_param_names(vec!["accel".into(), "tau".into()]);
        assert_eq!(cb.describe(&[2.5, 1.0]), "accel=2.5000, tau=1.0000");
        // mismatched lengths fall back to the raw vector
        assert_eq!(cb.describe(&[1.0]), "[1.0]");
    }
}
