use super::error::CalibrationError;
use super::types::Parameter;

/// Validated box constraints, index-aligned with the parameter vector.
#[derive(Clone, Debug, PartialEq)]
pub struct Bounds {
    limits: Vec<(f64, f64)>,
}

impl Bounds {
    /// Check every `(lower, upper)` pair and take ownership.
    ///
    /// Rejects empty sets, non-finite limits and inverted pairs.
    pub fn new(limits: Vec<(f64, f64)>) -> Result<Self, CalibrationError> {
        if limits.is_empty() {
            return Err(CalibrationError::InvalidConfig(
                "at least one parameter is required".into(),
            ));
        }
        for (index, &(lower, upper)) in limits.iter().enumerate() {
            if !lower.is_finite() || !upper.is_finite() || lower > upper {
                return Err(CalibrationError::InvalidBounds {
                    index,
                    lower,
                    upper,
                });
            }
        }
        Ok(Self { limits })
    }

    pub fn from_parameters(params: &[Parameter]) -> Result<Self, CalibrationError> {
        Self::new(params.iter().map(|p| (p.min_val, p.max_val)).collect())
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    pub fn as_slice(&self) -> &[(f64, f64)] {
        &self.limits
    }

    /// Fatal when `params` does not match the bound count
    pub fn check_dimension(&self, params: &[f64]) -> Result<(), CalibrationError> {
        if params.len() != self.limits.len() {
            return Err(CalibrationError::DimensionMismatch {
                params: params.len(),
                bounds: self.limits.len(),
            });
        }
        Ok(())
    }

    /// Starting points must match the bound count and be finite; a NaN
    /// coordinate would survive clipping.
    pub fn check_initial(&self, params: &[f64]) -> Result<(), CalibrationError> {
        self.check_dimension(params)?;
        if let Some(index) = params.iter().position(|v| !v.is_finite()) {
            return Err(CalibrationError::InvalidConfig(format!(
                "initial value for parameter {} is not finite ({})",
                index, params[index]
            )));
        }
        Ok(())
    }

    /// Clip in place, componentwise
    #[inline]
    pub fn clip(&self, params: &mut [f64]) {
        for (value, &(min, max)) in params.iter_mut().zip(&self.limits) {
            *value = value.clamp(min, max);
        }
    }

    pub fn clipped(&self, params: &[f64]) -> Vec<f64> {
        let mut out = params.to_vec();
        self.clip(&mut out);
        out
    }

    pub fn contains(&self, params: &[f64]) -> bool {
        params.len() == self.limits.len()
            && params
                .iter()
                .zip(&self.limits)
                .all(|(&v, &(min, max))| v >= min && v <= max)
    }

    pub fn midpoint(&self) -> Vec<f64> {
        self.limits
            .iter()
            .map(|&(min, max)| 0.5 * (min + max))
            .collect()
    }
}
