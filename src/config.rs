//! Calibration session configuration, loaded from JSON.

use crate::core::{Bounds, CalibrationError, Parameter, SpsaHyperparameters};
use crate::optimization::{RestartOrchestrator, SpsaOptimizer};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

fn default_iterations_per_run() -> usize {
    150
}

fn default_num_runs() -> usize {
    3
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialKeyword {
    Midpoint,
}

/// Starting point of the first run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitialGuess {
    /// One value per parameter, in declaration order
    Values(Vec<f64>),
    /// Values by name; missing names start at their bound midpoint
    Named(IndexMap<String, f64>),
    Keyword(InitialKeyword),
}

impl Default for InitialGuess {
    fn default() -> Self {
        Self::Keyword(InitialKeyword::Midpoint)
    }
}

/// Everything a restart session needs, in one immutable value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationConfig {
    /// Ordered name -> (lower, upper)
    pub parameters: IndexMap<String, (f64, f64)>,
    #[serde(default)]
    pub initial: InitialGuess,
    #[serde(default)]
    pub hyperparameters: SpsaHyperparameters,
    #[serde(default = "default_iterations_per_run")]
    pub iterations_per_run: usize,
    #[serde(default = "default_num_runs")]
    pub num_runs: usize,
    /// One seed per run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seeds: Option<Vec<u64>>,
    #[serde(default)]
    pub parallel_probes: bool,
}

impl CalibrationConfig {
    pub fn new(parameters: IndexMap<String, (f64, f64)>) -> Self {
        Self {
            parameters,
            initial: InitialGuess::default(),
            hyperparameters: SpsaHyperparameters::default(),
            iterations_per_run: default_iterations_per_run(),
            num_runs: default_num_runs(),
            seeds: None,
            parallel_probes: false,
        }
    }

    /// Build from parameter definitions; their `value`s become the initial guess
    pub fn from_parameters(params: &[Parameter]) -> Self {
        for p in params.iter().filter(|p| !p.is_within_bounds()) {
            warn!(
                parameter = %p.name,
                value = p.value,
                "initial value outside [{}, {}], it will be clipped",
                p.min_val,
                p.max_val
            );
        }
        let mut config = Self::new(
            params
                .iter()
                .map(|p| (p.name.clone(), (p.min_val, p.max_val)))
                .collect(),
        );
        config.initial = InitialGuess::Values(params.iter().map(|p| p.value).collect());
        config
    }

    pub fn from_json_str(json: &str) -> Result<Self, CalibrationError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String, CalibrationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn param_names(&self) -> Vec<String> {
        self.parameters.keys().cloned().collect()
    }

    pub fn bounds(&self) -> Result<Bounds, CalibrationError> {
        Bounds::new(self.parameters.values().copied().collect())
    }

    /// Resolve the initial guess against the bounds and clip it
    pub fn initial_vector(&self, bounds: &Bounds) -> Result<Vec<f64>, CalibrationError> {
        let raw = match &self.initial {
            InitialGuess::Keyword(InitialKeyword::Midpoint) => bounds.midpoint(),
            InitialGuess::Values(values) => {
                bounds.check_dimension(values)?;
                values.clone()
            }
            InitialGuess::Named(named) => {
                if let Some(unknown) = named.keys().find(|k| !self.parameters.contains_key(*k)) {
                    return Err(CalibrationError::InvalidConfig(format!(
                        "initial value given for unknown parameter '{}'",
                        unknown
                    )));
                }
                self.parameters
                    .iter()
                    .zip(bounds.midpoint())
                    .map(|((name, _), mid)| named.get(name).copied().unwrap_or(mid))
                    .collect()
            }
        };
        if let Some(bad) = raw.iter().position(|v| !v.is_finite()) {
            return Err(CalibrationError::InvalidConfig(format!(
                "initial value for '{}' is not finite",
                self.parameters
                    .get_index(bad)
                    .map(|(n, _)| n.as_str())
                    .unwrap_or("?")
            )));
        }
        Ok(bounds.clipped(&raw))
    }

    /// Every fatal check, before any evaluation happens
    pub fn validate(&self) -> Result<(), CalibrationError> {
        let bounds = self.bounds().map_err(|e| match e {
            CalibrationError::InvalidBounds { index, lower, upper } => {
                let name = self
                    .parameters
                    .get_index(index)
                    .map(|(n, _)| n.as_str())
                    .unwrap_or("?");
                CalibrationError::InvalidConfig(format!(
                    "parameter '{}' has invalid bounds ({}, {})",
                    name, lower, upper
                ))
            }
            other => other,
        })?;
        self.initial_vector(&bounds)?;
        self.hyperparameters.validate()?;
        if self.iterations_per_run == 0 {
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

    pub fn optimizer(&self) -> SpsaOptimizer {
        SpsaOptimizer::new(self.hyperparameters, self.iterations_per_run)
            .with_parallel_probes(self.parallel_probes)
    }

    pub fn orchestrator(&self) -> RestartOrchestrator {
        let orchestrator = RestartOrchestrator::new(self.optimizer(), self.num_runs);
        match &self.seeds {
            Some(seeds) => orchestrator.with_seeds(seeds.clone()),
            None => orchestrator,
        }
    }
}
