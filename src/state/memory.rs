// * In-process Key-Value Store
// * Single-process alternative to Redis; expiry is evaluated lazily on access

use super::store::{KeyValueStore, StateError};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum MemoryValue {
    Text(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: MemoryValue,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn text(value: impl Into<String>, expires_at: Option<Instant>) -> Self {
        Self {
            value: MemoryValue::Text(value.into()),
            expires_at,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

// * An expiry too far out to represent never fires
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

fn decode_error(key: &str, value: &MemoryValue) -> StateError {
    let value = match value {
        MemoryValue::Text(text) => text.clone(),
        MemoryValue::Set(_) => "<set>".to_string(),
    };
    StateError::Decode {
        key: key.to_string(),
        value,
    }
}

/// Process-local store backed by a sharded map
///
/// Atomicity holds within one process only; use it for single-replica
/// deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired entries and returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, expired ones included until purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // * Reads a live value; the shard guard is released before an expired entry is removed
    fn read(&self, key: &str) -> Option<(MemoryValue, Option<Instant>)> {
        let now = Instant::now();
        let found = self
            .entries
            .get(key)
            .map(|entry| (entry.is_live(now), entry.value.clone(), entry.expires_at));

        match found {
            Some((true, value, expires_at)) => Some((value, expires_at)),
            Some((false, _, _)) => {
                self.entries.remove_if(key, |_, entry| !entry.is_live(now));
                None
            }
            None => None,
        }
    }

    fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StateError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry::text("0", None));
        if !entry.is_live(now) {
            *entry = MemoryEntry::text("0", None);
        }

        let next = match &entry.value {
            MemoryValue::Text(text) => text
                .parse::<i64>()
                .map_err(|_| decode_error(key, &entry.value))?
                .checked_add(1)
                .ok_or_else(|| decode_error(key, &entry.value))?,
            other => return Err(decode_error(key, other)),
        };

        entry.value = MemoryValue::Text(next.to_string());
        if let Some(ttl) = ttl {
            entry.expires_at = deadline(now, ttl);
        }
        Ok(next)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn incr(&self, key: &str) -> Result<i64, StateError> {
        self.increment(key, None)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StateError> {
        let now = Instant::now();
        let updated = match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = deadline(now, ttl);
                true
            }
            _ => false,
        };
        Ok(updated)
    }

    async fn incr_and_expire(&self, key: &str, ttl: Duration) -> Result<i64, StateError> {
        self.increment(key, Some(ttl))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StateError> {
        let now = Instant::now();
        let fresh = MemoryEntry::text(value, deadline(now, ttl));

        let inserted = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(fresh);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };
        Ok(inserted)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StateError> {
        let expires_at = ttl.and_then(|ttl| deadline(Instant::now(), ttl));
        self.entries
            .insert(key.to_string(), MemoryEntry::text(value, expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
        match self.read(key) {
            Some((MemoryValue::Text(text), _)) => Ok(Some(text)),
            Some((other, _)) => Err(decode_error(key, &other)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StateError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, entry)| entry.is_live(now)))
    }

    async fn get_expire(&self, key: &str) -> Result<Option<Duration>, StateError> {
        let now = Instant::now();
        Ok(self
            .read(key)
            .and_then(|(_, expires_at)| expires_at)
            .map(|deadline| deadline.saturating_duration_since(now))
            .filter(|remaining| !remaining.is_zero()))
    }

    async fn index_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StateError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: MemoryValue::Set(BTreeSet::new()),
                expires_at: deadline(now, ttl),
            });
        if !entry.is_live(now) {
            *entry = MemoryEntry {
                value: MemoryValue::Set(BTreeSet::new()),
                expires_at: deadline(now, ttl),
            };
        }

        match &mut entry.value {
            MemoryValue::Set(members) => {
                members.insert(member.to_string());
            }
            other => return Err(decode_error(key, other)),
        }

        // * Keep the longest expiry seen; a persistent index stays persistent
        if let Some(current) = entry.expires_at {
            let requested = deadline(now, ttl);
            entry.expires_at = requested.map(|requested| requested.max(current));
        }
        Ok(())
    }

    async fn index_members(&self, key: &str) -> Result<Vec<String>, StateError> {
        match self.read(key) {
            Some((MemoryValue::Set(members), _)) => Ok(members.into_iter().collect()),
            Some((other, _)) => Err(decode_error(key, &other)),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incr_creates_and_counts() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("k").await.unwrap(), 1);
        assert_eq!(store.incr("k").await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.get_expire("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_and_expire_refreshes_ttl() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);

        store.incr_and_expire("k", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.incr_and_expire("k", ttl).await.unwrap(), 2);

        // * Would have expired at t=10 without the refresh
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.incr_and_expire("k", ttl).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_until_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);

        assert!(store.set_if_absent("s", "1", ttl).await.unwrap());
        assert!(!store.set_if_absent("s", "1", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.set_if_absent("s", "1", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_expire_reports_remaining() {
        let store = MemoryStore::new();
        store
            .set("s", "1", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            store.get_expire("s").await.unwrap(),
            Some(Duration::from_secs(20))
        );
        assert_eq!(store.get_expire("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expire_missing_key() {
        let store = MemoryStore::new();
        assert!(!store.expire("nope", Duration::from_secs(1)).await.unwrap());
        store.set("yes", "v", None).await.unwrap();
        assert!(store.expire("yes", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_on_non_integer_is_decode_error() {
        let store = MemoryStore::new();
        store.set("k", "abc", None).await.unwrap();
        assert!(matches!(
            store.incr("k").await,
            Err(StateError::Decode { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_keeps_longest_expiry() {
        let store = MemoryStore::new();
        store
            .index_add("idx", "a", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .index_add("idx", "b", Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            store.index_members("idx").await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.index_members("idx").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store
            .set("short", "v", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.set("long", "v", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
