// * Key-Value Contract
// * The primitives the evaluation state needs from a backing store

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Unexpected value '{value}' at key '{key}'")]
    Decode { key: String, value: String },

    #[error("Invalid store configuration: {0}")]
    Config(String),
}

/// Atomic key-value primitives with native expiry
///
/// Every method is a single round trip; implementations must make
/// [`KeyValueStore::incr_and_expire`] and [`KeyValueStore::set_if_absent`]
/// atomic across all processes sharing the store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Increments an integer counter, creating it at zero
    async fn incr(&self, key: &str) -> Result<i64, StateError>;

    /// Sets the expiry of an existing key; returns false when the key is missing
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StateError>;

    /// Increments and (re)sets the expiry in one atomic step
    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64, StateError>;

    /// Stores `value` with `ttl` only when the key does not exist
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StateError>;

    /// Stores `value`, replacing any existing value; `None` keeps it forever
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StateError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StateError>;

    /// Removes a key; returns true when something was deleted
    async fn delete(&self, key: &str) -> Result<bool, StateError>;

    /// Remaining time to live; `None` when missing or persistent
    async fn get_expire(&self, key: &str) -> Result<Option<Duration>, StateError>;

    /// Adds `member` to the set at `key`, extending its expiry to at least `ttl`
    async fn index_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StateError>;

    async fn index_members(&self, key: &str) -> Result<Vec<String>, StateError>;
}

/// Milliseconds for a store expiry; never zero
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
