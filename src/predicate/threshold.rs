// * Absolute Threshold Predicates
// * Compare each group-by row's current value against a fixed expected value

use super::{EvaluationContext, PredicateError, QueryTarget};
use crate::model::{
    parse_threshold_text, EvaluationOutput, EvaluationOutputs, Label, Number, NumericKind,
};
use crate::ops::telemetry;
use crate::query::{GroupByQuery, QueryApi, Row, TimeSpan};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::debug;

// * Rendered in place of a threshold for null checks
const NULL_TEXT: &str = "null";

/// Strict and non-strict comparisons against a fixed threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Equal,
    NotEqual,
}

impl Comparator {
    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            Comparator::GreaterThan => ordering == Ordering::Greater,
            Comparator::GreaterOrEqual => ordering != Ordering::Less,
            Comparator::LessThan => ordering == Ordering::Less,
            Comparator::LessOrEqual => ordering != Ordering::Greater,
            Comparator::Equal => ordering == Ordering::Equal,
            Comparator::NotEqual => ordering != Ordering::Equal,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Comparator::GreaterThan => "gt",
            Comparator::GreaterOrEqual => "gte",
            Comparator::LessThan => "lt",
            Comparator::LessOrEqual => "lte",
            Comparator::Equal => "eq",
            Comparator::NotEqual => "ne",
        }
    }
}

impl FromStr for Comparator {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" | "gt" | "greater_than" => Ok(Self::GreaterThan),
            ">=" | "gte" | "greater_or_equal" => Ok(Self::GreaterOrEqual),
            "<" | "lt" | "less_than" => Ok(Self::LessThan),
            "<=" | "lte" | "less_or_equal" => Ok(Self::LessOrEqual),
            "=" | "==" | "eq" | "equal" => Ok(Self::Equal),
            "!=" | "<>" | "ne" | "not_equal" => Ok(Self::NotEqual),
            other => Err(PredicateError::UnknownComparator(other.to_string())),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Comparator::GreaterThan => ">",
            Comparator::GreaterOrEqual => ">=",
            Comparator::LessThan => "<",
            Comparator::LessOrEqual => "<=",
            Comparator::Equal => "==",
            Comparator::NotEqual => "!=",
        };
        f.write_str(symbol)
    }
}

/// Per-row verdict logic shared by the absolute predicates
pub trait AbsolutePredicate: Send + Sync {
    /// Metric label for this predicate type
    fn name(&self) -> &'static str;

    /// Configured threshold, if the predicate has one
    fn threshold(&self) -> Option<Number>;

    /// Decides one row; `current` is `None` when the value is absent or null
    fn matches(&self, kind: NumericKind, threshold: Option<&Number>, current: Option<&Number>) -> bool;

    /// Output produced when the query returns no rows at all
    fn on_empty(&self) -> Option<EvaluationOutput> {
        None
    }
}

/// `current <op> expected`
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPredicate {
    comparator: Comparator,
    expected: Number,
}

impl ThresholdPredicate {
    pub fn new(comparator: Comparator, expected: Number) -> Self {
        Self {
            comparator,
            expected,
        }
    }

    /// Builds from a configured value: a numeric literal or a string such as `"10k"`
    pub fn from_value(comparator: Comparator, expected: &Value) -> Result<Self, PredicateError> {
        Ok(Self::new(comparator, parse_expected(expected)?))
    }

    pub fn greater_than(expected: Number) -> Self {
        Self::new(Comparator::GreaterThan, expected)
    }

    pub fn less_than(expected: Number) -> Self {
        Self::new(Comparator::LessThan, expected)
    }

    pub fn comparator(&self) -> Comparator {
        self.comparator
    }

    pub fn expected(&self) -> Number {
        self.expected
    }
}

impl AbsolutePredicate for ThresholdPredicate {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn threshold(&self) -> Option<Number> {
        Some(self.expected)
    }

    fn matches(&self, kind: NumericKind, threshold: Option<&Number>, current: Option<&Number>) -> bool {
        match (current, threshold) {
            (Some(current), Some(threshold)) => current
                .compare(threshold, kind)
                .map(|ordering| self.comparator.accepts(ordering))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Matches series whose value is absent, and a rule whose query returns nothing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsNullPredicate;

impl AbsolutePredicate for IsNullPredicate {
    fn name(&self) -> &'static str {
        "is_null"
    }

    fn threshold(&self) -> Option<Number> {
        None
    }

    fn matches(&self, _kind: NumericKind, _threshold: Option<&Number>, current: Option<&Number>) -> bool {
        current.is_none()
    }

    fn on_empty(&self) -> Option<EvaluationOutput> {
        Some(EvaluationOutput::new(true, Label::empty(), NULL_TEXT))
    }
}

/// Parses a configured threshold value
pub fn parse_expected(expected: &Value) -> Result<Number, PredicateError> {
    match expected {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(Number::Integer(v))
            } else if let Some(v) = n.as_f64() {
                Ok(Number::Float(v))
            } else {
                Err(PredicateError::UnparsableThreshold(n.to_string()))
            }
        }
        Value::String(text) => parse_threshold_text(text)
            .ok_or_else(|| PredicateError::UnparsableThreshold(text.clone())),
        other => Err(PredicateError::WrongThresholdType(json_type(other).to_string())),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Builds a row's label from the group-by dimensions, in declaration order
pub fn label_of(row: &Row, group_by: &[String]) -> Label {
    group_by
        .iter()
        .filter_map(|name| row.dimensions.get(name).map(|value| (name, value)))
        .fold(Label::builder(), |builder, (name, value)| {
            builder.add(name.clone(), value.clone())
        })
        .build()
}

/// Runs one grouped query and applies `predicate` to every returned row
pub async fn evaluate_absolute<P>(
    predicate: &P,
    query: &dyn QueryApi,
    target: &QueryTarget<'_>,
    interval: &TimeSpan,
    ctx: &EvaluationContext,
) -> Result<EvaluationOutputs, PredicateError>
where
    P: AbsolutePredicate + ?Sized,
{
    let kind = target.metric.resolve_kind(query, target.data_source).await?;

    let request = GroupByQuery {
        data_source: target.data_source.to_string(),
        fields: vec![target.metric.clone()],
        filter: target.filter.map(str::to_string),
        group_by: target.group_by.to_vec(),
        interval: *interval,
    };

    let started = Instant::now();
    let rows = query.group_by(&request).await;
    telemetry::record_query_duration("group_by", started);
    let rows = rows?;

    if rows.is_empty() {
        debug!(parent: &ctx.span, predicate = predicate.name(), "Query returned no rows");
        let output = predicate.on_empty();
        if let Some(output) = &output {
            telemetry::record_evaluation(predicate.name(), outcome(output.matched));
        }
        return Ok(output.into_iter().collect());
    }

    let threshold = predicate.threshold();
    let threshold_text = threshold
        .map(|t| t.format(kind))
        .unwrap_or_else(|| NULL_TEXT.to_string());

    let outputs = rows
        .iter()
        .map(|row| {
            let label = label_of(row, target.group_by);
            let current = row
                .get(&target.metric.name)
                .map(|raw| Number::from_raw(raw, kind));
            let matched = predicate.matches(kind, threshold.as_ref(), current.as_ref());

            telemetry::record_evaluation(predicate.name(), outcome(matched));
            debug!(
                parent: &ctx.span,
                predicate = predicate.name(),
                label = %label,
                current = ?current,
                matched,
                "Label evaluated"
            );

            let mut output = EvaluationOutput::new(matched, label, threshold_text.clone());
            if let Some(current) = current {
                output = output.with_current(current.format(kind));
                if let Some(threshold) = &threshold {
                    output = output.with_delta(current.delta(threshold, kind).format(kind));
                }
            }
            output
        })
        .collect();

    Ok(outputs)
}

fn outcome(matched: bool) -> &'static str {
    if matched {
        "matched"
    } else {
        "unmatched"
    }
}
