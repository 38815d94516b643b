// * Evaluation Engine
// * Drives rules through predicates and the distributed state primitives

pub mod evaluator;

// * Re-exports for convenient access
pub use evaluator::{Decision, EvaluationError, EvaluationReport, RuleEvaluator};
