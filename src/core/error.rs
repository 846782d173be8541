//! Calibration errors.

use super::types::RunRecord;
use thiserror::Error;

/// Fatal errors surfaced to the caller.
///
/// Configuration variants are returned before any evaluation is attempted.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// Parameter vector and bounds disagree in length
    #[error("Dimension mismatch: {params} parameters but {bounds} bounds")]
    DimensionMismatch { params: usize, bounds: usize },

    /// Lower bound above upper bound, or a non-finite bound
    #[error("Invalid bounds for parameter {index}: ({lower}, {upper})")]
    InvalidBounds { index: usize, lower: f64, upper: f64 },

    /// Hyperparameter outside its admissible range
    #[error("Invalid hyperparameter '{name}': {value}")]
    InvalidHyperparameter { name: &'static str, value: f64 },

    /// Any other configuration problem (counts, seeds, names)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Every run failed, no best solution was ever recorded
    #[error("No valid result: every run failed to produce a finite error")]
    NoValidResult,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Unexpected failure at the evaluator boundary.
///
/// Recoverable failures are signalled with the `FAILED` sentinel instead;
/// this error aborts the current run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Evaluator failed: {0}")]
    Failed(String),

    #[error("Interrupted by user")]
    Interrupted,
}

/// Outcome of a run that did not complete normally.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] CalibrationError),

    /// The evaluator raised; `partial` holds every completed iteration
    #[error("Run '{run}' aborted after {completed} iterations: {source}")]
    Aborted {
        run: String,
        completed: usize,
        partial: Box<RunRecord>,
        #[source]
        source: EvaluationError,
    },
}
