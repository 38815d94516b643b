// * Alert Predicates
// * Turn a metric query result into per-label match verdicts

pub mod baseline;
pub mod threshold;

// * Re-exports for convenient access
pub use baseline::{baseline_index, baseline_window, compute_delta, DayOverDayPredicate, Trend};
pub use threshold::{
    evaluate_absolute, label_of, parse_expected, AbsolutePredicate, Comparator, IsNullPredicate,
    ThresholdPredicate,
};

use crate::baseline::BaselineCacheManager;
use crate::model::{EvaluationOutputs, Number};
use crate::query::{MetricField, QueryApi, QueryError, TimeSpan};
use chrono::{DateTime, FixedOffset, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::Span;

#[derive(Debug, Error)]
pub enum PredicateError {
    #[error("percentage must be in (0, 100], got {0}")]
    InvalidPercentage(f64),

    #[error("day_before must be at least 1, got {0}")]
    InvalidDayBefore(i64),

    #[error("threshold '{0}' is not a number")]
    UnparsableThreshold(String),

    #[error("threshold must be a number or a string, got {0}")]
    WrongThresholdType(String),

    #[error("unknown comparator '{0}'")]
    UnknownComparator(String),

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Per-cycle evaluation context; build a fresh one for every cycle
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub alert_id: String,
    pub interval: TimeSpan,
    /// Logical "now" of the cycle
    pub interval_end: DateTime<Utc>,
    /// Zone used to find calendar days for baselines
    pub timezone: FixedOffset,
    /// Logging sink for this cycle
    pub span: Span,
}

impl EvaluationContext {
    pub fn new(alert_id: impl Into<String>, interval: TimeSpan, interval_end: DateTime<Utc>) -> Self {
        let alert_id = alert_id.into();
        let span = tracing::info_span!(
            "alert_evaluation",
            alert_id = %alert_id,
            start = %interval.start,
            end = %interval.end
        );
        Self {
            alert_id,
            interval,
            interval_end,
            timezone: *Local::now().offset(),
            span,
        }
    }

    pub fn with_timezone(mut self, timezone: FixedOffset) -> Self {
        self.timezone = timezone;
        self
    }
}

/// What a predicate queries
#[derive(Debug, Clone, Copy)]
pub struct QueryTarget<'a> {
    pub data_source: &'a str,
    pub metric: &'a MetricField,
    pub filter: Option<&'a str>,
    pub group_by: &'a [String],
}

/// Collaborators wired once at startup and shared by all evaluations
#[derive(Clone)]
pub struct EvaluationSources {
    pub query: Arc<dyn QueryApi>,
    pub baseline: Arc<BaselineCacheManager>,
}

impl EvaluationSources {
    pub fn new(query: Arc<dyn QueryApi>, baseline: Arc<BaselineCacheManager>) -> Self {
        Self { query, baseline }
    }
}

/// The closed set of rule conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PredicateSpec", into = "PredicateSpec")]
pub enum Predicate {
    Threshold(ThresholdPredicate),
    IsNull(IsNullPredicate),
    DayOverDay(DayOverDayPredicate),
}

impl Predicate {
    pub fn name(&self) -> &'static str {
        match self {
            Predicate::Threshold(p) => p.name(),
            Predicate::IsNull(p) => p.name(),
            Predicate::DayOverDay(_) => "day_over_day",
        }
    }

    /// Evaluates the predicate over `interval`; an empty result means inconclusive
    pub async fn evaluate(
        &self,
        sources: &EvaluationSources,
        target: &QueryTarget<'_>,
        interval: &TimeSpan,
        ctx: &EvaluationContext,
    ) -> Result<EvaluationOutputs, PredicateError> {
        let query = sources.query.as_ref();
        match self {
            Predicate::Threshold(p) => evaluate_absolute(p, query, target, interval, ctx).await,
            Predicate::IsNull(p) => evaluate_absolute(p, query, target, interval, ctx).await,
            Predicate::DayOverDay(p) => {
                p.evaluate(query, &sources.baseline, target, interval, ctx)
                    .await
            }
        }
    }
}

/// Serialized form of [`Predicate`]; validated on conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PredicateSpec {
    Threshold {
        comparator: String,
        expected: Value,
    },
    IsNull,
    DayOverDay {
        day_before: i64,
        percentage: f64,
        #[serde(default)]
        trend: Trend,
    },
}

impl TryFrom<PredicateSpec> for Predicate {
    type Error = PredicateError;

    fn try_from(spec: PredicateSpec) -> Result<Self, Self::Error> {
        match spec {
            PredicateSpec::Threshold {
                comparator,
                expected,
            } => Ok(Predicate::Threshold(ThresholdPredicate::from_value(
                comparator.parse()?,
                &expected,
            )?)),
            PredicateSpec::IsNull => Ok(Predicate::IsNull(IsNullPredicate)),
            PredicateSpec::DayOverDay {
                day_before,
                percentage,
                trend,
            } => Ok(Predicate::DayOverDay(DayOverDayPredicate::new(
                day_before, percentage, trend,
            )?)),
        }
    }
}

impl From<Predicate> for PredicateSpec {
    fn from(predicate: Predicate) -> Self {
        match predicate {
            Predicate::Threshold(p) => PredicateSpec::Threshold {
                comparator: p.comparator().name().to_string(),
                expected: match p.expected() {
                    Number::Integer(v) => Value::from(v),
                    Number::Float(v) => Value::from(v),
                },
            },
            Predicate::IsNull(_) => PredicateSpec::IsNull,
            Predicate::DayOverDay(p) => PredicateSpec::DayOverDay {
                day_before: i64::from(p.day_before()),
                percentage: rust_decimal::prelude::ToPrimitive::to_f64(&p.percentage())
                    .unwrap_or_default(),
                trend: p.trend(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_predicate_from_json() {
        let p: Predicate =
            serde_json::from_value(json!({"type": "threshold", "comparator": ">", "expected": "10k"}))
                .unwrap();
        assert_eq!(
            p,
            Predicate::Threshold(ThresholdPredicate::greater_than(Number::Integer(10_000)))
        );

        let p: Predicate = serde_json::from_value(json!({"type": "is_null"})).unwrap();
        assert_eq!(p.name(), "is_null");

        let p: Predicate = serde_json::from_value(
            json!({"type": "day_over_day", "day_before": 7, "percentage": 30, "trend": "decrease"}),
        )
        .unwrap();
        match p {
            Predicate::DayOverDay(dod) => {
                assert_eq!(dod.day_before(), 7);
                assert_eq!(dod.trend(), Trend::Decrease);
            }
            other => panic!("unexpected predicate {:?}", other),
        }
    }

    #[test]
    fn test_invalid_predicates_fail_at_construction() {
        let bad = [
            json!({"type": "day_over_day", "day_before": 0, "percentage": 30}),
            json!({"type": "day_over_day", "day_before": 1, "percentage": 130}),
            json!({"type": "threshold", "comparator": ">", "expected": "lots"}),
            json!({"type": "threshold", "comparator": ">", "expected": {"v": 1}}),
            json!({"type": "threshold", "comparator": "~", "expected": 1}),
        ];
        for value in bad {
            assert!(
                serde_json::from_value::<Predicate>(value.clone()).is_err(),
                "accepted {}",
                value
            );
        }
    }

    #[test]
    fn test_predicate_serializes_back() {
        let p = Predicate::Threshold(ThresholdPredicate::less_than(Number::Float(0.5)));
        let value = serde_json::to_value(&p).unwrap();
        assert_eq!(value, json!({"type": "threshold", "comparator": "lt", "expected": 0.5}));
        let back: Predicate = serde_json::from_value(value).unwrap();
        assert_eq!(back, p);
    }
}
