// * Core Data Model
// * Labels, typed numeric values and per-label evaluation verdicts

pub mod label;
pub mod number;
pub mod output;

// * Re-exports for convenient access
pub use label::{Label, LabelBuilder};
pub use number::{parse_decimal, parse_human_readable, parse_threshold_text, Number, NumericKind};
pub use output::{EvaluationOutput, EvaluationOutputs};
