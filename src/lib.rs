//! SPSA calibration with restarts for noisy black-box objectives.
//!
//! The evaluator is any function mapping a parameter vector (plus a probe
//! tag) to a scalar error. [`RestartOrchestrator`] chains several
//! [`SpsaOptimizer`] runs and keeps the best vector seen across all of them.

pub mod config;
mod core;
pub mod logging;
pub mod optimization;
#[cfg(feature = "python")]
mod python;
pub mod report;
pub mod session;

pub use crate::core::*;
pub use config::{CalibrationConfig, InitialGuess, InitialKeyword};
pub use logging::init_tracing;
pub use optimization::*;
pub use session::{CalibrationSession, VERIFICATION_TAG, Verification, calibrate_with_config};

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn spsacalibrator(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<python::PyParameter>()?;
    m.add_class::<python::Calibrator>()?;
    m.add_class::<python::PyCalibrationResult>()?;
    Ok(())
}
