use crate::config::CalibrationConfig;
use crate::core::{CalibrationResult, EvaluationError, Parameter, RunRecord, SpsaHyperparameters};
use crate::logging::init_tracing;
use crate::optimization::{Evaluator, IterationProgress, LoggingCallback, OptimizationCallback};
use crate::report;
use crate::session::CalibrationSession;
use pyo3::exceptions::{PyKeyboardInterrupt, PyValueError};
use pyo3::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// ===== PARAMETERS =====

#[pyclass(name = "Parameter")]
#[derive(Clone, Debug)]
pub struct PyParameter {
    inner: Parameter,
}

#[pymethods]
impl PyParameter {
    #[new]
    fn new(name: String, value: f64, min_val: f64, max_val: f64) -> Self {
        Self {
            inner: Parameter::new(name, value, min_val, max_val),
        }
    }

    #[getter]
    fn name(&self) -> String {
        self.inner.name.clone()
    }

    #[setter]
    fn set_name(&mut self, name: String) {
        self.inner.name = name;
    }

    #[getter]
    fn value(&self) -> f64 {
        self.inner.value
    }

    #[setter]
    fn set_value(&mut self, value: f64) {
        self.inner.value = value;
    }

    #[getter]
    fn min_val(&self) -> f64 {
        self.inner.min_val
    }

    #[setter]
    fn set_min_val(&mut self, min_val: f64) {
        self.inner.min_val = min_val;
    }

    #[getter]
    fn max_val(&self) -> f64 {
        self.inner.max_val
    }

    #[setter]
    fn set_max_val(&mut self, max_val: f64) {
        self.inner.max_val = max_val;
    }

    fn clamp(&mut self) {
        self.inner.clamp();
    }

    fn is_within_bounds(&self) -> bool {
        self.inner.is_within_bounds()
    }

    fn __repr__(&self) -> String {
        let p = &self.inner;
        format!("Parameter({}={}, [{}, {}])", p.name, p.value, p.min_val, p.max_val)
    }
}

impl From<Parameter> for PyParameter {
    fn from(inner: Parameter) -> Self {
        Self { inner }
    }
}

// ===== EVALUATOR BRIDGE =====

/// Calls a Python `evaluate(params: list[float], tag: str) -> float`
struct PyEvaluator {
    callable: Py<PyAny>,
    interrupted: Arc<AtomicBool>,
}

impl Evaluator for PyEvaluator {
    fn evaluate(&self, params: &[f64], tag: &str) -> Result<f64, EvaluationError> {
        Python::with_gil(|py| {
            let score = self
                .callable
                .call1(py, (params.to_vec(), tag))
                .and_then(|out| out.extract::<f64>(py));
            score.map_err(|e| {
                if e.is_instance_of::<PyKeyboardInterrupt>(py) {
                    self.interrupted.store(true, Ordering::Relaxed);
                    EvaluationError::Interrupted
                } else {
                    EvaluationError::Failed(e.to_string())
                }
            })
        })
    }
}

/// Logs progress and turns Ctrl+C into a stop between iterations
struct SignalCallback {
    inner: LoggingCallback,
    interrupted: Arc<AtomicBool>,
}

impl OptimizationCallback for SignalCallback {
    fn on_run_start(&mut self, run_name: &str, initial: &[f64]) {
        self.inner.on_run_start(run_name, initial);
    }

    fn on_iteration(&mut self, progress: &IterationProgress<'_>) {
        Python::with_gil(|py| {
            if py.check_signals().is_err() {
                self.interrupted.store(true, Ordering::Relaxed);
            }
        });
        self.inner.on_iteration(progress);
    }

    fn on_run_end(&mut self, record: &RunRecord) {
        self.inner.on_run_end(record);
    }

    fn should_stop(&self) -> bool {
        self.inner.should_stop()
    }
}

// ===== RESULT =====

#[pyclass(name = "CalibrationResult")]
pub struct PyCalibrationResult {
    inner: CalibrationResult,
    names: Vec<String>,
    /// Best values with their configured bounds; empty without a result
    best_parameters: Vec<Parameter>,
    #[pyo3(get)]
    elapsed_secs: f64,
}

#[pymethods]
impl PyCalibrationResult {
    #[getter]
    fn success(&self) -> bool {
        self.inner.has_result()
    }

    #[getter]
    fn cancelled(&self) -> bool {
        self.inner.cancelled
    }

    #[getter]
    fn best_error(&self) -> Option<f64> {
        self.inner.best_error()
    }

    /// Best values as `Parameter` objects (empty when there is no result)
    #[getter]
    fn parameters(&self) -> Vec<PyParameter> {
        self.best_parameters
            .iter()
            .cloned()
            .map(PyParameter::from)
            .collect()
    }

    #[getter]
    fn cumulative_trace(&self) -> Vec<f64> {
        self.inner.cumulative_trace.clone()
    }

    #[getter]
    fn run_traces(&self) -> Vec<(String, Vec<f64>)> {
        self.inner
            .runs
            .iter()
            .map(|r| (r.name.clone(), r.trace.clone()))
            .collect()
    }

    #[getter]
    fn final_params(&self) -> Vec<Vec<f64>> {
        self.inner
            .runs
            .iter()
            .map(|r| r.final_params.clone())
            .collect()
    }

    fn get_parameter(&self, name: &str) -> Option<f64> {
        self.best_parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
    }

    fn to_json(&self) -> PyResult<String> {
        report::convergence_json(&self.names, &self.inner)
            .map_err(|e| PyValueError::new_err(e.to_string()))
    }

    fn __repr__(&self) -> String {
        match self.inner.best_error() {
            Some(err) => format!(
                "CalibrationResult(best_error={:.4}, runs={})",
                err,
                self.inner.runs.len()
            ),
            None => format!("CalibrationResult(no result, runs={})", self.inner.runs.len()),
        }
    }
}

// ===== CALIBRATOR =====

#[pyclass]
pub struct Calibrator {
    config: CalibrationConfig,
    #[pyo3(get, set)]
    pub verbose: bool,
}

#[pymethods]
impl Calibrator {
    #[new]
    #[pyo3(signature = (a=0.1, c=0.1, stability=100.0, alpha=0.602, gamma=0.101, iterations_per_run=150, num_runs=3, seeds=None, parallel_probes=false, verbose=false))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        a: f64,
        c: f64,
        stability: f64,
        alpha: f64,
        gamma: f64,
        iterations_per_run: usize,
        num_runs: usize,
        seeds: Option<Vec<u64>>,
        parallel_probes: bool,
        verbose: bool,
    ) -> Self {
        let mut config = CalibrationConfig::new(Default::default());
        config.hyperparameters = SpsaHyperparameters::new(a, c, stability, alpha, gamma);
        config.iterations_per_run = iterations_per_run;
        config.num_runs = num_runs;
        config.seeds = seeds;
        config.parallel_probes = parallel_probes;
        Self { config, verbose }
    }

    /// Load a JSON session configuration (parameters included)
    #[staticmethod]
    #[pyo3(signature = (path, verbose=false))]
    fn from_json(path: &str, verbose: bool) -> PyResult<Self> {
        let config = CalibrationConfig::from_path(path)
            .map_err(|e| PyValueError::new_err(format!("Invalid configuration: {}", e)))?;
        Ok(Self { config, verbose })
    }

    /// Run the restart session.
    ///
    /// `parameters` overrides the configured parameter table; their current
    /// values become the initial guess.
    #[pyo3(signature = (evaluate, parameters=None))]
    fn calibrate(
        &self,
        py: Python<'_>,
        evaluate: PyObject,
        parameters: Option<Vec<Py<PyParameter>>>,
    ) -> PyResult<PyCalibrationResult> {
        let _ = init_tracing(self.verbose);

        let config = match parameters {
            Some(params) => {
                let native: Vec<Parameter> =
                    params.iter().map(|p| p.borrow(py).inner.clone()).collect();
                let mut config = CalibrationConfig::from_parameters(&native);
                config.hyperparameters = self.config.hyperparameters;
                config.iterations_per_run = self.config.iterations_per_run;
                config.num_runs = self.config.num_runs;
                config.seeds = self.config.seeds.clone();
                config.parallel_probes = self.config.parallel_probes;
                config
            }
            None => self.config.clone(),
        };
        config
            .validate()
            .map_err(|e| PyValueError::new_err(format!("Validation failed: {}", e)))?;

        let interrupted = Arc::new(AtomicBool::new(false));
        let evaluator = PyEvaluator {
            callable: evaluate,
            interrupted: interrupted.clone(),
        };
        let mut callback = SignalCallback {
            inner: LoggingCallback::new()
                .with_param_names(config.param_names())
                .with_stop_flag(interrupted.clone()),
            interrupted,
        };

        let session = py
            .allow_threads(|| CalibrationSession::run(config, &evaluator, &mut callback))
            .map_err(|e| PyValueError::new_err(format!("Calibration failed: {}", e)))?;
        session.log_summary();

        Ok(PyCalibrationResult {
            names: session.param_names(),
            best_parameters: session.best_parameters().unwrap_or_default(),
            elapsed_secs: session.elapsed.as_secs_f64(),
            inner: session.result,
        })
    }
}
