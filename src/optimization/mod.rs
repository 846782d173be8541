pub mod callback;
pub mod evaluator;
pub mod objective;
pub mod restart;
pub mod spsa;

pub use callback::{IterationProgress, LoggingCallback, NoopCallback, OptimizationCallback};
pub use evaluator::{AveragedEvaluator, Evaluator, FAILED, FAILURE_THRESHOLD, FallibleFn, is_failure};
pub use restart::{RestartOrchestrator, run_name};
pub use spsa::{SpsaOptimizer, rademacher, rng_for};
