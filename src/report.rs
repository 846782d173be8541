//! Persisted calibration output: best parameters and convergence history.

use crate::core::{CalibrationError, CalibrationResult, RunStatus, Solution};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Format duration in seconds to human-readable string (e.g., "2m 30s", "1h 15m")
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 60.0 {
        format!("{:.0}s", secs)
    } else if secs < 3600.0 {
        let mins = (secs / 60.0).floor();
        let secs_remaining = secs % 60.0;
        format!("{}m {:.0}s", mins, secs_remaining)
    } else {
        let hours = (secs / 3600.0).floor();
        let mins_remaining = ((secs % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours, mins_remaining)
    }
}

/// `name: value` lines for a solution, one per parameter.
pub struct ParameterReport<'a> {
    names: &'a [String],
    values: &'a [f64],
}

impl<'a> ParameterReport<'a> {
    pub fn new(names: &'a [String], solution: &'a Solution) -> Result<Self, CalibrationError> {
        if names.len() != solution.params.len() {
            return Err(CalibrationError::DimensionMismatch {
                params: solution.params.len(),
                bounds: names.len(),
            });
        }
        Ok(Self {
            names,
            values: &solution.params,
        })
    }
}

impl fmt::Display for ParameterReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.names.iter().zip(self.values) {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

/// Write the best parameters as `name: value` lines
pub fn write_best_parameters(
    path: impl AsRef<Path>,
    names: &[String],
    solution: &Solution,
) -> Result<(), CalibrationError> {
    let report = ParameterReport::new(names, solution)?;
    let mut file = std::fs::File::create(path.as_ref())?;
    write!(file, "{}", report)?;
    info!(path = %path.as_ref().display(), "best parameters saved");
    Ok(())
}

#[derive(Serialize)]
struct RunTrace<'a> {
    name: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    best_error: Option<f64>,
    /// `None` entries mean no valid evaluation yet
    trace: Vec<Option<f64>>,
}

#[derive(Serialize)]
struct ConvergenceDocument<'a> {
    param_names: &'a [String],
    best_error: Option<f64>,
    best_params: Option<&'a [f64]>,
    runs: Vec<RunTrace<'a>>,
    cumulative_iterations: Vec<usize>,
    cumulative_trace: Vec<Option<f64>>,
}

fn status_label(status: &RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "completed",
        RunStatus::Cancelled => "cancelled",
        RunStatus::Aborted(_) => "aborted",
    }
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

/// Per-run and cumulative convergence traces as a JSON string
pub fn convergence_json(
    names: &[String],
    result: &CalibrationResult,
) -> Result<String, CalibrationError> {
    let doc = ConvergenceDocument {
        param_names: names,
        best_error: result.best_error(),
        best_params: result.best.as_ref().map(|s| s.params.as_slice()),
        runs: result
            .runs
            .iter()
            .map(|r| RunTrace {
                name: &r.name,
                status: status_label(&r.status),
                reason: match &r.status {
                    RunStatus::Aborted(reason) => Some(reason.as_str()),
                    _ => None,
                },
                best_error: finite(r.best_error),
                trace: r.trace.iter().copied().map(finite).collect(),
            })
            .collect(),
        cumulative_iterations: result.cumulative_points().map(|(i, _)| i).collect(),
        cumulative_trace: result.cumulative_trace.iter().copied().map(finite).collect(),
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

pub fn write_convergence_json(
    path: impl AsRef<Path>,
    names: &[String],
    result: &CalibrationResult,
) -> Result<(), CalibrationError> {
    let json = convergence_json(names, result)?;
    std::fs::write(path.as_ref(), json)?;
    info!(path = %path.as_ref().display(), "convergence history saved");
    Ok(())
}

/// Emit the end-of-session summary through `tracing`
pub fn log_summary(names: &[String], result: &CalibrationResult, elapsed: Duration) {
    info!("=== Overall SPSA calibration results ===");
    match &result.best {
        Some(best) => {
            info!(
                "total cumulative iterations: {}, runs: {} ({} failed)",
                result.total_iterations(),
                result.runs.len(),
                result.failed_runs()
            );
            info!("best error across all runs: {:.4}", best.error);
            for (name, value) in names.iter().zip(&best.params) {
                info!("  {}: {:.4}", name, value);
            }
        }
        None => info!("calibration found no valid parameters"),
    }
    if result.cancelled {
        info!("session was cancelled before all runs completed");
    }
    info!("calibration took {}", format_duration(elapsed));
}
