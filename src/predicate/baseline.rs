// * Day-over-Day Baseline Predicate
// * Compares the live value with the smoothed value at the same time of day N days earlier

use super::{EvaluationContext, PredicateError, QueryTarget};
use crate::baseline::BaselineCacheManager;
use crate::config::constants::MIN_BASELINE_STEP_SECS;
use crate::model::{EvaluationOutput, EvaluationOutputs, Label, Number};
use crate::ops::telemetry;
use crate::query::{GroupByQuery, QueryApi, TimeSpan};
use chrono::{DateTime, Days, FixedOffset, NaiveTime, Timelike, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

const PREDICATE_NAME: &str = "day_over_day";

/// Direction of change the rule alerts on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    #[default]
    Increase,
    Decrease,
}

/// Fires when the relative change against the baseline exceeds `percentage`
#[derive(Debug, Clone, PartialEq)]
pub struct DayOverDayPredicate {
    day_before: u32,
    percentage: Decimal,
    trend: Trend,
}

impl DayOverDayPredicate {
    /// Validates `day_before >= 1` and `percentage` in `(0, 100]`
    pub fn new(day_before: i64, percentage: f64, trend: Trend) -> Result<Self, PredicateError> {
        if !(percentage > 0.0 && percentage <= 100.0) {
            return Err(PredicateError::InvalidPercentage(percentage));
        }
        let day_before = u32::try_from(day_before)
            .ok()
            .filter(|d| *d >= 1)
            .ok_or(PredicateError::InvalidDayBefore(day_before))?;
        let percentage =
            Decimal::from_f64(percentage).ok_or(PredicateError::InvalidPercentage(percentage))?;

        Ok(Self {
            day_before,
            percentage,
            trend,
        })
    }

    pub fn day_before(&self) -> u32 {
        self.day_before
    }

    pub fn percentage(&self) -> Decimal {
        self.percentage
    }

    pub fn trend(&self) -> Trend {
        self.trend
    }

    /// Strictly greater than the configured percentage
    pub fn matches(&self, delta: Decimal) -> bool {
        delta > self.percentage
    }

    pub async fn evaluate(
        &self,
        query: &dyn QueryApi,
        baseline: &BaselineCacheManager,
        target: &QueryTarget<'_>,
        interval: &TimeSpan,
        ctx: &EvaluationContext,
    ) -> Result<EvaluationOutputs, PredicateError> {
        if !target.group_by.is_empty() {
            debug!(parent: &ctx.span, "Group-by dimensions are ignored by day-over-day rules");
        }

        let kind = target.metric.resolve_kind(query, target.data_source).await?;
        let request = GroupByQuery {
            data_source: target.data_source.to_string(),
            fields: vec![target.metric.clone()],
            filter: target.filter.map(str::to_string),
            group_by: Vec::new(),
            interval: *interval,
        };

        let started = Instant::now();
        let rows = query.group_by(&request).await;
        telemetry::record_query_duration("group_by", started);
        let rows = rows?;

        let Some(current) = rows.first().and_then(|row| row.get(&target.metric.name)) else {
            return Ok(inconclusive(ctx, "no current value"));
        };

        let step_seconds = (interval.length().num_seconds().max(0) as u64).max(MIN_BASELINE_STEP_SECS);
        // * Day and position within it both come from the live window's start
        let Some(window) = baseline_window(interval.start, self.day_before, ctx.timezone) else {
            return Ok(inconclusive(ctx, "baseline day out of range"));
        };

        let series = baseline
            .get_baseline_metrics_list(
                &window,
                step_seconds,
                target.data_source,
                target.filter,
                target.metric,
            )
            .await?;

        let index = baseline_index(interval.start, ctx.timezone, step_seconds);
        let Some(&reference) = series.get(index) else {
            return Ok(inconclusive(ctx, "baseline index out of range"));
        };
        let Some(delta) = compute_delta(current, reference, self.trend) else {
            return Ok(inconclusive(ctx, "delta not representable"));
        };

        let matched = self.matches(delta);
        telemetry::record_evaluation(PREDICATE_NAME, if matched { "matched" } else { "unmatched" });
        debug!(
            parent: &ctx.span,
            current,
            baseline = reference,
            index,
            delta = %delta,
            matched,
            "Day-over-day evaluated"
        );

        let output = EvaluationOutput::new(matched, Label::empty(), format!("{}%", self.percentage))
            .with_current(Number::from_raw(current, kind).format(kind))
            .with_delta(format!("{:.2}", delta));
        Ok(vec![output])
    }
}

fn inconclusive(ctx: &EvaluationContext, reason: &str) -> EvaluationOutputs {
    telemetry::record_evaluation(PREDICATE_NAME, "inconclusive");
    debug!(parent: &ctx.span, reason, "Day-over-day inconclusive");
    Vec::new()
}

/// The whole local calendar day `day_before` days before the day holding `at`
pub fn baseline_window(at: DateTime<Utc>, day_before: u32, tz: FixedOffset) -> Option<TimeSpan> {
    let day = at
        .with_timezone(&tz)
        .date_naive()
        .checked_sub_days(Days::new(u64::from(day_before)))?;
    let local_midnight = day.and_time(NaiveTime::MIN);
    let start = (local_midnight - chrono::Duration::seconds(i64::from(tz.local_minus_utc()))).and_utc();
    Some(TimeSpan::new(start, start + chrono::Duration::days(1)))
}

/// Position of `at`'s local time of day within a day sampled every `step_seconds`
pub fn baseline_index(at: DateTime<Utc>, tz: FixedOffset, step_seconds: u64) -> usize {
    let local = at.with_timezone(&tz);
    let offset_ms = u64::from(local.num_seconds_from_midnight()) * 1000
        + u64::from(local.nanosecond() / 1_000_000);
    (offset_ms / (step_seconds.max(1) * 1000)) as usize
}

/// Percentage change of `current` against `baseline`
///
/// A zero baseline yields the raw difference. Otherwise the difference is
/// scaled to two decimals, divided with four decimals of precision (half-up)
/// and multiplied by 100.
pub fn compute_delta(current: f64, baseline: f64, trend: Trend) -> Option<Decimal> {
    let current = Decimal::from_f64(current)?;
    let baseline = Decimal::from_f64(baseline)?;

    if baseline.is_zero() {
        return current.checked_sub(baseline);
    }

    let diff = match trend {
        Trend::Increase => current.checked_sub(baseline)?,
        Trend::Decrease => baseline.checked_sub(current)?,
    }
    .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

    diff.checked_div(baseline)?
        .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
        .checked_mul(Decimal::ONE_HUNDRED)
}
