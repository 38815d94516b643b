// * Time-series Query Contract
// * Narrow read interface to the metric backend: grouped queries, step-aligned series
// * and field schema lookup

use crate::model::NumericKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

// * Cloneable so that one failed load can be handed to every waiter
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueryError {
    #[error("Query backend error: {0}")]
    Backend(String),

    #[error("Unknown metric field '{field}' in data source '{data_source}'")]
    UnknownField { data_source: String, field: String },

    #[error("Query timed out")]
    Timeout,
}

/// Aggregation applied to a metric field over the query window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregator {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Aggregator::Count => "count",
            Aggregator::Sum => "sum",
            Aggregator::Avg => "avg",
            Aggregator::Min => "min",
            Aggregator::Max => "max",
            Aggregator::First => "first",
            Aggregator::Last => "last",
        };
        f.write_str(name)
    }
}

/// A metric field together with its aggregation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricField {
    pub name: String,
    pub aggregator: Aggregator,
}

impl MetricField {
    pub fn new(name: impl Into<String>, aggregator: Aggregator) -> Self {
        Self {
            name: name.into(),
            aggregator,
        }
    }

    /// Resolves the semantic type used for comparison and formatting
    ///
    /// Counts are always integral; everything else follows the schema.
    pub async fn resolve_kind<S>(&self, schema: &S, data_source: &str) -> Result<NumericKind, QueryError>
    where
        S: SchemaLookup + ?Sized,
    {
        match self.aggregator {
            Aggregator::Count => Ok(NumericKind::Integer),
            _ => schema.field_kind(data_source, &self.name).await,
        }
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.aggregator, self.name)
    }
}

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeSpan {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> chrono::Duration {
        self.end - self.start
    }
}

/// Grouped aggregation over one window
#[derive(Debug, Clone, PartialEq)]
pub struct GroupByQuery {
    pub data_source: String,
    pub fields: Vec<MetricField>,
    pub filter: Option<String>,
    pub group_by: Vec<String>,
    pub interval: TimeSpan,
}

/// One row of a grouped result; a metric may be present but null
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub dimensions: BTreeMap<String, String>,
    pub values: HashMap<String, Option<f64>>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    pub fn value(mut self, field: impl Into<String>, value: Option<f64>) -> Self {
        self.values.insert(field.into(), value);
        self
    }

    /// Reads a metric value, treating missing and null alike
    pub fn get(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied().flatten()
    }
}

/// Step-aligned series query
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesQuery {
    pub data_source: String,
    pub field: MetricField,
    pub filter: Option<String>,
    pub interval: TimeSpan,
    pub step_seconds: u64,
}

impl TimeSeriesQuery {
    /// Number of step buckets covering the interval
    pub fn bucket_count(&self) -> usize {
        let seconds = self.interval.length().num_seconds().max(0) as u64;
        (seconds / self.step_seconds.max(1)) as usize
    }
}

/// A named series; `None` entries are gaps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesResult {
    pub series: Vec<Series>,
}

/// Field schema lookup
#[async_trait]
pub trait SchemaLookup: Send + Sync {
    async fn field_kind(&self, data_source: &str, field: &str) -> Result<NumericKind, QueryError>;
}

/// Read-only access to the metric backend
#[async_trait]
pub trait QueryApi: SchemaLookup {
    async fn group_by(&self, query: &GroupByQuery) -> Result<Vec<Row>, QueryError>;

    async fn time_series(&self, query: &TimeSeriesQuery) -> Result<TimeSeriesResult, QueryError>;
}
