// * Baseline Cache Manager
// * Time-bounded, single-flight cache of smoothed historical series

use super::smoothing::Smoother;
use crate::ops::telemetry;
use crate::query::{MetricField, QueryApi, QueryError, TimeSeriesQuery, TimeSpan};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Everything that determines one historical query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaselineCacheKey {
    pub data_source: String,
    pub filter: Option<String>,
    pub field: MetricField,
    pub interval: TimeSpan,
    pub step_seconds: u64,
}

// * A smoothed series and the instant it was written
#[derive(Debug)]
struct Loaded {
    values: Arc<Vec<f64>>,
    loaded_at: Instant,
}

// * The cell serialises concurrent loads of one key; a failed load leaves it empty
#[derive(Debug, Default)]
struct CacheSlot {
    cell: OnceCell<Loaded>,
}

impl CacheSlot {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        self.cell
            .get()
            .map(|loaded| now.duration_since(loaded.loaded_at) >= ttl)
            .unwrap_or(false)
    }
}

// * Expired, or left empty by a failed load that no caller is still waiting on.
// * Callers only take a slot under the map lock, so a lone reference means idle.
fn is_stale(slot: &Arc<CacheSlot>, now: Instant, ttl: Duration) -> bool {
    slot.is_expired(now, ttl) || (!slot.cell.initialized() && Arc::strong_count(slot) == 1)
}

/// Shares smoothed baseline series across labels and rules
///
/// Entries expire `ttl` after they are written. Concurrent callers for one
/// key share a single load; failures are not cached.
pub struct BaselineCacheManager {
    query: Arc<dyn QueryApi>,
    smoother: Arc<dyn Smoother>,
    ttl: Duration,
    slots: Mutex<HashMap<BaselineCacheKey, Arc<CacheSlot>>>,
}

impl std::fmt::Debug for BaselineCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaselineCacheManager")
            .field("smoother", &self.smoother.name())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl BaselineCacheManager {
    pub fn new(query: Arc<dyn QueryApi>, smoother: Arc<dyn Smoother>, ttl: Duration) -> Self {
        Self {
            query,
            smoother,
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the smoothed series for the historical window, loading it at most once
    pub async fn get_baseline_metrics_list(
        &self,
        interval: &TimeSpan,
        step_seconds: u64,
        data_source: &str,
        filter: Option<&str>,
        field: &MetricField,
    ) -> Result<Arc<Vec<f64>>, QueryError> {
        let key = BaselineCacheKey {
            data_source: data_source.to_string(),
            filter: filter.map(str::to_string),
            field: field.clone(),
            interval: *interval,
            step_seconds,
        };

        let slot = self.slot_for(&key).await;
        if let Some(loaded) = slot.cell.get() {
            telemetry::record_baseline_cache("hit");
            return Ok(Arc::clone(&loaded.values));
        }

        let loaded = slot.cell.get_or_try_init(|| self.load(key.clone())).await?;
        Ok(Arc::clone(&loaded.values))
    }

    /// Number of live entries, including loads in flight
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every entry
    pub async fn invalidate_all(&self) {
        self.slots.lock().await.clear();
    }

    // * Finds or creates the slot for `key`, discarding expired slots on the way
    async fn slot_for(&self, key: &BaselineCacheKey) -> Arc<CacheSlot> {
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        slots.retain(|_, slot| !is_stale(slot, now, self.ttl));
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    async fn load(&self, key: BaselineCacheKey) -> Result<Loaded, QueryError> {
        let query = TimeSeriesQuery {
            data_source: key.data_source.clone(),
            field: key.field.clone(),
            filter: key.filter.clone(),
            interval: key.interval,
            step_seconds: key.step_seconds,
        };

        let started = std::time::Instant::now();
        let result = self.query.time_series(&query).await;
        telemetry::record_query_duration("time_series", started);

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                telemetry::record_baseline_cache("load_error");
                warn!(
                    data_source = %key.data_source,
                    field = %key.field,
                    error = %e,
                    "Baseline load failed"
                );
                return Err(e);
            }
        };
        telemetry::record_baseline_cache("miss");

        // * Pick the series for the field, zero-filling gaps and short tails
        let buckets = query.bucket_count();
        let mut values: Vec<f64> = result
            .series
            .iter()
            .find(|s| s.name == key.field.name)
            .or_else(|| result.series.first())
            .map(|s| s.values.iter().map(|v| v.unwrap_or(0.0)).collect())
            .unwrap_or_default();
        if values.len() < buckets {
            values.resize(buckets, 0.0);
        }

        let smoothed = self.smoother.smooth(&values);
        debug!(
            data_source = %key.data_source,
            field = %key.field,
            points = smoothed.len(),
            smoother = self.smoother.name(),
            "Baseline loaded"
        );

        Ok(Loaded {
            values: Arc::new(smoothed),
            loaded_at: Instant::now(),
        })
    }
}
