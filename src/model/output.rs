// * Evaluation Output - Per-label Verdict of One Predicate Evaluation

use super::label::Label;
use serde::{Deserialize, Serialize};

/// Result of evaluating a predicate for one label
///
/// `current` is `None` when the series had no value this cycle and `delta` is
/// `None` whenever no difference can be computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutput {
    pub matched: bool,
    pub label: Label,
    pub current: Option<String>,
    pub threshold: String,
    pub delta: Option<String>,
}

impl EvaluationOutput {
    pub fn new(matched: bool, label: Label, threshold: impl Into<String>) -> Self {
        Self {
            matched,
            label,
            current: None,
            threshold: threshold.into(),
            delta: None,
        }
    }

    pub fn with_current(mut self, current: impl Into<String>) -> Self {
        self.current = Some(current.into());
        self
    }

    pub fn with_delta(mut self, delta: impl Into<String>) -> Self {
        self.delta = Some(delta.into());
        self
    }
}

/// Collection of outputs produced by one rule evaluation
pub type EvaluationOutputs = Vec<EvaluationOutput>;
