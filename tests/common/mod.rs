// * Shared fixtures for integration tests
// * A scripted in-memory query backend that counts its calls

#![allow(dead_code)]

use apm_alert::baseline::{BaselineCacheManager, MovingAverage};
use apm_alert::model::NumericKind;
use apm_alert::predicate::{EvaluationContext, EvaluationSources};
use apm_alert::query::{
    GroupByQuery, QueryApi, QueryError, Row, SchemaLookup, Series, TimeSeriesQuery,
    TimeSeriesResult, TimeSpan,
};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct ScriptedQueryApi {
    kind: NumericKind,
    rows: Mutex<Vec<Row>>,
    series: Mutex<Vec<Option<f64>>>,
    fail: AtomicBool,
    history_windows: Mutex<Vec<TimeSpan>>,
    pub group_by_calls: AtomicUsize,
    pub time_series_calls: AtomicUsize,
}

impl ScriptedQueryApi {
    pub fn new(kind: NumericKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            rows: Mutex::new(Vec::new()),
            series: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            history_windows: Mutex::new(Vec::new()),
            group_by_calls: AtomicUsize::new(0),
            time_series_calls: AtomicUsize::new(0),
        })
    }

    pub fn with_rows(self: Arc<Self>, rows: Vec<Row>) -> Arc<Self> {
        *self.rows.lock().unwrap() = rows;
        self
    }

    /// Historical values, one per step from the start of the window
    pub fn with_series(self: Arc<Self>, values: Vec<Option<f64>>) -> Arc<Self> {
        *self.series.lock().unwrap() = values;
        self
    }

    /// Makes historical series queries fail until reset
    pub fn fail_history(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Windows requested by historical series queries, in call order
    pub fn history_windows(&self) -> Vec<TimeSpan> {
        self.history_windows.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), QueryError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(QueryError::Backend("scripted failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SchemaLookup for ScriptedQueryApi {
    async fn field_kind(&self, _: &str, _: &str) -> Result<NumericKind, QueryError> {
        Ok(self.kind)
    }
}

#[async_trait]
impl QueryApi for ScriptedQueryApi {
    async fn group_by(&self, _: &GroupByQuery) -> Result<Vec<Row>, QueryError> {
        self.group_by_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn time_series(&self, query: &TimeSeriesQuery) -> Result<TimeSeriesResult, QueryError> {
        self.time_series_calls.fetch_add(1, Ordering::SeqCst);
        self.history_windows.lock().unwrap().push(query.interval);
        self.check()?;
        Ok(TimeSeriesResult {
            series: vec![Series {
                name: query.field.name.clone(),
                values: self.series.lock().unwrap().clone(),
            }],
        })
    }
}

/// Sources with an identity smoother so baselines equal the raw series
pub fn sources(api: Arc<ScriptedQueryApi>) -> EvaluationSources {
    let baseline = BaselineCacheManager::new(
        api.clone(),
        Arc::new(MovingAverage::new(1)),
        Duration::from_secs(24 * 3600),
    );
    EvaluationSources::new(api, Arc::new(baseline))
}

pub fn utc() -> FixedOffset {
    FixedOffset::east_opt(0).unwrap()
}

/// One-minute window ending at `end`
pub fn minute_ending(end: DateTime<Utc>) -> TimeSpan {
    TimeSpan::new(end - chrono::Duration::minutes(1), end)
}

pub fn context(alert_id: &str, interval: TimeSpan) -> EvaluationContext {
    EvaluationContext::new(alert_id, interval, interval.end).with_timezone(utc())
}

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 2, hour, minute, 0).unwrap()
}
