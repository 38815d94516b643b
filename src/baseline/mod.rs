// * Baseline History
// * Smoothed day-over-day reference series, cached per query shape

pub mod cache;
pub mod smoothing;

// * Re-exports for convenient access
pub use cache::{BaselineCacheKey, BaselineCacheManager};
pub use smoothing::{MovingAverage, Smoother};

use crate::config::BaselineConfig;
use crate::query::QueryApi;
use std::sync::Arc;

/// Builds a cache manager with a moving-average smoother from configuration
pub fn cache_from_config(query: Arc<dyn QueryApi>, config: &BaselineConfig) -> BaselineCacheManager {
    BaselineCacheManager::new(
        query,
        Arc::new(MovingAverage::new(config.smoothing_window)),
        config.cache_ttl,
    )
}
