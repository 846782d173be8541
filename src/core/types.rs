use super::error::CalibrationError;
use serde::{Deserialize, Serialize};

// ===== PARAMETERS =====

/// A named calibration parameter with its box constraint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: f64,
    pub min_val: f64,
    pub max_val: f64,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: f64, min_val: f64, max_val: f64) -> Self {
        Self {
            name: name.into(),
            value,
            min_val,
            max_val,
        }
    }

    pub fn clamp(&mut self) {
        self.value = self.value.clamp(self.min_val, self.max_val);
    }

    pub fn is_within_bounds(&self) -> bool {
        self.value >= self.min_val && self.value <= self.max_val
    }
}

// ===== HYPERPARAMETERS =====

/// SPSA gain-sequence coefficients.
///
/// `a_k = a / (k + 1 + A)^alpha` and `c_k = c / (k + 1)^gamma`, with `k`
/// counted from zero.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpsaHyperparameters {
    pub a: f64,
    pub c: f64,
    #[serde(rename = "A", alias = "stability")]
    pub stability: f64,
    pub alpha: f64,
    pub gamma: f64,
}

impl Default for SpsaHyperparameters {
    fn default() -> Self {
        Self {
            a: 0.1,
            c: 0.1,
            stability: 100.0,
            alpha: 0.602,
            gamma: 0.101,
        }
    }
}

impl SpsaHyperparameters {
    pub fn new(a: f64, c: f64, stability: f64, alpha: f64, gamma: f64) -> Self {
        Self {
            a,
            c,
            stability,
            alpha,
            gamma,
        }
    }

    /// Step gain `a_k` for zero-based iteration `k`
    #[inline]
    pub fn step_gain(&self, k: usize) -> f64 {
        self.a / (k as f64 + 1.0 + self.stability).powf(self.alpha)
    }

    /// Perturbation gain `c_k` for zero-based iteration `k`
    #[inline]
    pub fn perturbation_gain(&self, k: usize) -> f64 {
        self.c / (k as f64 + 1.0).powf(self.gamma)
    }

    /// Both gains must be positive and strictly decaying.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        let checks = [
            ("a", self.a, self.a > 0.0),
            ("c", self.c, self.c > 0.0),
            ("A", self.stability, self.stability >= 0.0),
            ("alpha", self.alpha, self.alpha > 0.0),
            ("gamma", self.gamma, self.gamma > 0.0),
        ];
        for (name, value, ok) in checks {
            if !value.is_finite() || !ok {
                return Err(CalibrationError::InvalidHyperparameter { name, value });
            }
        }
        Ok(())
    }
}

// ===== RUN OUTPUT =====

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Stopped between iterations at the caller's request
    Cancelled,
    /// Evaluator raised; only completed iterations are recorded
    Aborted(String),
}

/// Everything one SPSA run produced.
#[derive(Clone, Debug, Serialize)]
pub struct RunRecord {
    pub name: String,
    pub initial_params: Vec<f64>,
    pub final_params: Vec<f64>,
    pub best_params: Vec<f64>,
    /// `f64::INFINITY` until a valid evaluation is seen
    pub best_error: f64,
    /// Best-so-far error after each executed iteration
    pub trace: Vec<f64>,
    pub evaluations: usize,
    pub skipped_iterations: usize,
    pub status: RunStatus,
}

impl RunRecord {
    pub(crate) fn start(name: &str, initial: Vec<f64>, budget: usize) -> Self {
        Self {
            name: name.to_string(),
            final_params: initial.clone(),
            best_params: initial.clone(),
            initial_params: initial,
            best_error: f64::INFINITY,
            trace: Vec::with_capacity(budget),
            evaluations: 0,
            skipped_iterations: 0,
            status: RunStatus::Completed,
        }
    }

    pub fn iterations(&self) -> usize {
        self.trace.len()
    }

    pub fn has_valid_best(&self) -> bool {
        self.best_error.is_finite()
    }
}

/// Best parameter vector and the run that found it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Solution {
    pub params: Vec<f64>,
    pub error: f64,
    pub run_index: usize,
}

/// Terminal artifact of a restart session.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CalibrationResult {
    /// `None` when no run ever produced a finite error
    pub best: Option<Solution>,
    pub runs: Vec<RunRecord>,
    /// Global best-so-far after each iteration of every run, in order
    pub cumulative_trace: Vec<f64>,
    pub cancelled: bool,
}

impl CalibrationResult {
    pub fn has_result(&self) -> bool {
        self.best.is_some()
    }

    pub fn best_error(&self) -> Option<f64> {
        self.best.as_ref().map(|s| s.error)
    }

    pub fn total_iterations(&self) -> usize {
        self.cumulative_trace.len()
    }

    pub fn failed_runs(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| matches!(r.status, RunStatus::Aborted(_)))
            .count()
    }

    /// `(global iteration, best error)` pairs, iterations counted from 1
    pub fn cumulative_points(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.cumulative_trace
            .iter()
            .enumerate()
            .map(|(i, &e)| (i + 1, e))
    }

    pub fn into_best(self) -> Result<Solution, CalibrationError> {
        self.best.ok_or(CalibrationError::NoValidResult)
    }
}
