// * Evaluation State Manager
// * Match counters, silence flags and evaluation timestamps per rule and label

use super::keys::StateKeys;
use super::memory::MemoryStore;
use super::redis_store::RedisStore;
use super::store::{KeyValueStore, StateError};
use crate::config::constants::{DEFAULT_NAMESPACE, INDEX_FALLBACK_TTL};
use crate::config::{StateBackend, StateConfig};
use crate::model::Label;
use crate::ops::telemetry;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// * Stored while a label is silenced; only the key's presence matters
const SILENCE_SENTINEL: &str = "1";

/// Which kind of key a snapshot entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    MatchCount,
    Silence,
    Evaluation,
}

/// One exported key, independent of the backing store's layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertStateSnapshot {
    pub alert_id: String,
    pub label: Label,
    pub kind: StateKind,
    pub value: String,
    /// Remaining time to live at export; `None` for persistent keys
    pub ttl_ms: Option<u64>,
}

/// Which keys a rule change clears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    MatchCounts,
    Silence,
    /// Counters, silences, the evaluation timestamp and the label index
    All,
}

/// Facade over a [`KeyValueStore`] implementing the per-rule state contract
///
/// Every label that gets a counter or silence is recorded in a per-rule index
/// set, so clearing and exporting a rule never needs a keyspace scan.
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn KeyValueStore>,
    keys: StateKeys,
}

impl StateManager {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            keys: StateKeys::new(namespace),
        }
    }

    /// Process-local state under the default namespace
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), DEFAULT_NAMESPACE)
    }

    /// Connects the configured backend
    pub async fn from_config(config: &StateConfig) -> Result<Self, StateError> {
        let store: Arc<dyn KeyValueStore> = match config.backend {
            StateBackend::Memory => Arc::new(MemoryStore::new()),
            StateBackend::Redis => Arc::new(RedisStore::connect(&config.redis).await?),
        };
        info!(
            backend = store.name(),
            namespace = %config.namespace,
            "Evaluation state backend ready"
        );
        Ok(Self::new(store, config.namespace.clone()))
    }

    pub fn keys(&self) -> &StateKeys {
        &self.keys
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.name()
    }

    /// Deletes every match counter of the rule
    pub async fn reset_match_count(&self, alert_id: &str) -> Result<(), StateError> {
        let identities = observe("reset_match_count", self.identities(alert_id).await)?;
        let deletions = identities
            .iter()
            .map(|identity| self.keys.counter_for_identity(alert_id, identity))
            .map(|key| async move { self.store.delete(&key).await });

        for result in join_all(deletions).await {
            observe("reset_match_count", result)?;
        }
        debug!(alert_id, "Match counters reset");
        Ok(())
    }

    /// Increments each label's counter and refreshes its expiry to `window`
    ///
    /// Returns the post-increment count per label. A counter lapses once no
    /// increment arrives for `window`.
    pub async fn incr_match_count(
        &self,
        alert_id: &str,
        labels: &[Label],
        window: Duration,
    ) -> Result<HashMap<Label, i64>, StateError> {
        let unique: BTreeSet<&Label> = labels.iter().collect();
        let index = self.keys.label_index(alert_id);

        let increments = unique.into_iter().map(|label| {
            let index = index.as_str();
            async move {
                self.store.index_add(index, label.id(), window).await?;
                let count = self
                    .store
                    .incr_and_expire(&self.keys.counter(alert_id, label), window)
                    .await?;
                Ok::<_, StateError>((label.clone(), count))
            }
        });

        let mut counts = HashMap::with_capacity(labels.len());
        for result in join_all(increments).await {
            let (label, count) = observe("incr_match_count", result)?;
            counts.insert(label, count);
        }
        Ok(counts)
    }

    /// Claims the silence period for a label; true for exactly one caller per period
    ///
    /// A zero duration never silences, so every call succeeds.
    pub async fn try_enter_silence(
        &self,
        alert_id: &str,
        label: &Label,
        silence: Duration,
    ) -> Result<bool, StateError> {
        if silence.is_zero() {
            return Ok(true);
        }

        let result = async {
            self.store
                .index_add(&self.keys.label_index(alert_id), label.id(), silence)
                .await?;
            self.store
                .set_if_absent(&self.keys.silence(alert_id, label), SILENCE_SENTINEL, silence)
                .await
        }
        .await;

        let entered = observe("try_enter_silence", result)?;
        debug!(alert_id, label = %label, entered, "Silence claim");
        Ok(entered)
    }

    /// Remaining silence; zero when the label is not silenced
    pub async fn get_silence_remain_time(
        &self,
        alert_id: &str,
        label: &Label,
    ) -> Result<Duration, StateError> {
        let remaining = observe(
            "get_silence_remain_time",
            self.store.get_expire(&self.keys.silence(alert_id, label)).await,
        )?;
        Ok(remaining.unwrap_or(Duration::ZERO))
    }

    /// Records the last evaluation instant; it expires after one `interval`
    pub async fn set_evaluation_time(
        &self,
        alert_id: &str,
        at: DateTime<Utc>,
        interval: Duration,
    ) -> Result<(), StateError> {
        observe(
            "set_evaluation_time",
            self.store
                .set(
                    &self.keys.evaluation(alert_id),
                    &at.timestamp_millis().to_string(),
                    Some(interval),
                )
                .await,
        )
    }

    /// Claims the tick at `at` for this replica; false when a peer already holds it
    ///
    /// The claim lives for one `interval`, long enough to cover the tick.
    pub async fn try_claim_tick(
        &self,
        alert_id: &str,
        at: DateTime<Utc>,
        interval: Duration,
    ) -> Result<bool, StateError> {
        if interval.is_zero() {
            return Ok(true);
        }
        let claimed = observe(
            "try_claim_tick",
            self.store
                .set_if_absent(
                    &self.keys.tick_claim(alert_id, at.timestamp_millis()),
                    "1",
                    interval,
                )
                .await,
        )?;
        if !claimed {
            debug!(alert_id, tick = %at, "Tick claimed by a peer");
        }
        Ok(claimed)
    }

    /// Last evaluation instant recorded within the current interval
    pub async fn get_evaluation_timestamp(
        &self,
        alert_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StateError> {
        let key = self.keys.evaluation(alert_id);
        let raw = observe("get_evaluation_timestamp", self.store.get(&key).await)?;

        raw.map(|value| {
            value
                .parse::<i64>()
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .ok_or(StateError::Decode { key: key.clone(), value })
        })
        .transpose()
    }

    /// Dumps the live state of the given rules
    pub async fn export_alert_states(
        &self,
        alert_ids: &[String],
    ) -> Result<Vec<AlertStateSnapshot>, StateError> {
        let mut snapshots = Vec::new();

        for alert_id in alert_ids {
            let identities = observe("export", self.identities(alert_id).await)?;
            for identity in identities {
                let Some(label) = Label::from_identity(&identity) else {
                    warn!(alert_id = %alert_id, identity = %identity, "Skipping malformed label identity");
                    continue;
                };

                let counter = self.keys.counter_for_identity(alert_id, &identity);
                let silence = self.keys.silence_for_identity(alert_id, &identity);
                for (key, kind) in [(counter, StateKind::MatchCount), (silence, StateKind::Silence)] {
                    if let Some(snapshot) = self.snapshot(alert_id, &label, &key, kind).await? {
                        snapshots.push(snapshot);
                    }
                }
            }

            let evaluation = self.keys.evaluation(alert_id);
            if let Some(snapshot) = self
                .snapshot(alert_id, &Label::empty(), &evaluation, StateKind::Evaluation)
                .await?
            {
                snapshots.push(snapshot);
            }
        }

        info!(
            rules = alert_ids.len(),
            entries = snapshots.len(),
            "Alert state exported"
        );
        Ok(snapshots)
    }

    /// Writes snapshots back, replacing existing values; returns how many were applied
    pub async fn restore_alert_states(
        &self,
        snapshots: &[AlertStateSnapshot],
    ) -> Result<usize, StateError> {
        for snapshot in snapshots {
            let alert_id = snapshot.alert_id.as_str();
            let ttl = snapshot.ttl_ms.map(Duration::from_millis);

            let key = match snapshot.kind {
                StateKind::MatchCount => {
                    if snapshot.value.parse::<i64>().is_err() {
                        return Err(StateError::Decode {
                            key: self.keys.counter(alert_id, &snapshot.label),
                            value: snapshot.value.clone(),
                        });
                    }
                    self.keys.counter(alert_id, &snapshot.label)
                }
                StateKind::Silence => self.keys.silence(alert_id, &snapshot.label),
                StateKind::Evaluation => self.keys.evaluation(alert_id),
            };

            if snapshot.kind != StateKind::Evaluation {
                observe(
                    "restore",
                    self.store
                        .index_add(
                            &self.keys.label_index(alert_id),
                            snapshot.label.id(),
                            ttl.unwrap_or(INDEX_FALLBACK_TTL),
                        )
                        .await,
                )?;
            }
            observe("restore", self.store.set(&key, &snapshot.value, ttl).await)?;
        }

        info!(entries = snapshots.len(), "Alert state restored");
        Ok(snapshots.len())
    }

    /// Best-effort deletion of a rule's keys; returns how many keys were removed
    ///
    /// A failing key is logged and skipped so the remaining keys are still
    /// attempted.
    pub async fn clear_rule_state(&self, alert_id: &str, scope: ClearScope) -> usize {
        let identities = match self.identities(alert_id).await {
            Ok(identities) => identities,
            Err(e) => {
                telemetry::record_state_error("clear");
                warn!(alert_id, error = %e, "Label index unreadable; clearing unlabeled keys only");
                BTreeSet::from([Label::empty().id().to_string()])
            }
        };

        let mut keys = Vec::new();
        for identity in &identities {
            if matches!(scope, ClearScope::MatchCounts | ClearScope::All) {
                keys.push(self.keys.counter_for_identity(alert_id, identity));
            }
            if matches!(scope, ClearScope::Silence | ClearScope::All) {
                keys.push(self.keys.silence_for_identity(alert_id, identity));
            }
        }
        if scope == ClearScope::All {
            // * Only the last recorded tick can still hold a live claim worth freeing
            if let Ok(Some(last)) = self.get_evaluation_timestamp(alert_id).await {
                keys.push(self.keys.tick_claim(alert_id, last.timestamp_millis()));
            }
            keys.push(self.keys.evaluation(alert_id));
            keys.push(self.keys.label_index(alert_id));
        }

        let deletions = keys
            .iter()
            .map(|key| async move { (key, self.store.delete(key).await) });

        let mut removed = 0;
        for (key, result) in join_all(deletions).await {
            telemetry::record_state_op("clear");
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    telemetry::record_state_error("clear");
                    warn!(alert_id, key = %key, error = %e, "Failed to delete state key");
                }
            }
        }

        debug!(alert_id, ?scope, removed, "Rule state cleared");
        removed
    }

    // * Indexed label identities plus the unlabeled one
    async fn identities(&self, alert_id: &str) -> Result<BTreeSet<String>, StateError> {
        let mut identities: BTreeSet<String> = self
            .store
            .index_members(&self.keys.label_index(alert_id))
            .await?
            .into_iter()
            .collect();
        identities.insert(Label::empty().id().to_string());
        Ok(identities)
    }

    async fn snapshot(
        &self,
        alert_id: &str,
        label: &Label,
        key: &str,
        kind: StateKind,
    ) -> Result<Option<AlertStateSnapshot>, StateError> {
        let Some(value) = observe("export", self.store.get(key).await)? else {
            return Ok(None);
        };
        let ttl = observe("export", self.store.get_expire(key).await)?;

        Ok(Some(AlertStateSnapshot {
            alert_id: alert_id.to_string(),
            label: label.clone(),
            kind,
            value,
            ttl_ms: ttl.map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
        }))
    }
}

fn observe<T>(op: &'static str, result: Result<T, StateError>) -> Result<T, StateError> {
    telemetry::record_state_op(op);
    if let Err(e) = &result {
        telemetry::record_state_error(op);
        warn!(op, error = %e, "State operation failed");
    }
    result
}
