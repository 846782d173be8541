pub mod bounds;
pub mod error;
pub mod types;

pub use bounds::Bounds;
pub use error::{CalibrationError, EvaluationError, RunError};
pub use types::*;
