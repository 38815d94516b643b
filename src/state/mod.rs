// * Distributed Evaluation State
// * Counters and silence flags shared by every evaluator replica

pub mod keys;
pub mod manager;
pub mod memory;
pub mod redis_store;
pub mod store;

// * Re-exports for convenient access
pub use keys::StateKeys;
pub use manager::{AlertStateSnapshot, ClearScope, StateKind, StateManager};
pub use memory::MemoryStore;
pub use redis_store::{RedisConnection, RedisConnectionManager, RedisStore};
pub use store::{KeyValueStore, StateError};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Label;
    use chrono::{TimeZone, Utc};
    use futures::future::join_all;
    use std::sync::Arc;
    use std::time::Duration;

    fn us() -> Label {
        Label::builder().add("region", "us").build()
    }

    fn eu() -> Label {
        Label::builder().add("region", "eu").build()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let state = Arc::new(StateManager::in_memory());
        let window = Duration::from_secs(300);

        let tasks = (0..64).map(|_| {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.incr_match_count("r1", &[us()], window).await })
        });
        for result in join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let counts = state.incr_match_count("r1", &[us()], window).await.unwrap();
        assert_eq!(counts[&us()], 65);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_silence_has_single_winner() {
        let state = Arc::new(StateManager::in_memory());
        let silence = Duration::from_secs(600);

        let tasks = (0..32).map(|_| {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.try_enter_silence("r1", &us(), silence).await })
        });
        let winners = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .filter(|entered| *entered)
            .count();

        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_reopens_after_expiry() {
        let state = StateManager::in_memory();
        let silence = Duration::from_secs(60);

        assert!(state.try_enter_silence("r1", &us(), silence).await.unwrap());
        assert!(!state.try_enter_silence("r1", &us(), silence).await.unwrap());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(
            state.get_silence_remain_time("r1", &us()).await.unwrap(),
            Duration::from_secs(40)
        );

        tokio::time::advance(Duration::from_secs(41)).await;
        assert_eq!(
            state.get_silence_remain_time("r1", &us()).await.unwrap(),
            Duration::ZERO
        );
        assert!(state.try_enter_silence("r1", &us(), silence).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_silence_never_blocks() {
        let state = StateManager::in_memory();
        assert!(state.try_enter_silence("r1", &us(), Duration::ZERO).await.unwrap());
        assert!(state.try_enter_silence("r1", &us(), Duration::ZERO).await.unwrap());
        assert_eq!(
            state.get_silence_remain_time("r1", &us()).await.unwrap(),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_lapses_after_window() {
        let state = StateManager::in_memory();
        let window = Duration::from_secs(120);

        state.incr_match_count("r1", &[us()], window).await.unwrap();
        tokio::time::advance(Duration::from_secs(100)).await;
        let counts = state.incr_match_count("r1", &[us()], window).await.unwrap();
        assert_eq!(counts[&us()], 2);

        tokio::time::advance(Duration::from_secs(121)).await;
        let counts = state.incr_match_count("r1", &[us()], window).await.unwrap();
        assert_eq!(counts[&us()], 1);
    }

    #[tokio::test]
    async fn test_counts_are_per_label_and_deduplicated() {
        let state = StateManager::in_memory();
        let window = Duration::from_secs(60);

        let counts = state
            .incr_match_count("r1", &[us(), eu(), us()], window)
            .await
            .unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[&us()], 1);
        assert_eq!(counts[&eu()], 1);
    }

    #[tokio::test]
    async fn test_reset_match_count_clears_every_label() {
        let state = StateManager::in_memory();
        let window = Duration::from_secs(60);

        state
            .incr_match_count("r1", &[us(), eu(), Label::empty()], window)
            .await
            .unwrap();
        state.reset_match_count("r1").await.unwrap();

        let counts = state
            .incr_match_count("r1", &[us(), eu(), Label::empty()], window)
            .await
            .unwrap();
        assert!(counts.values().all(|count| *count == 1));
    }

    #[tokio::test]
    async fn test_evaluation_timestamp_round_trip() {
        let state = StateManager::in_memory();
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        assert_eq!(state.get_evaluation_timestamp("r1").await.unwrap(), None);
        state
            .set_evaluation_time("r1", at, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(state.get_evaluation_timestamp("r1").await.unwrap(), Some(at));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluation_timestamp_expires_with_interval() {
        let state = StateManager::in_memory();
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        state
            .set_evaluation_time("r1", at, Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(state.get_evaluation_timestamp("r1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_evaluation_timestamp_is_decode_error() {
        let store = Arc::new(MemoryStore::new());
        let state = StateManager::new(store.clone(), "ns");
        store.set("ns:r1:evaluation", "yesterday", None).await.unwrap();

        assert!(matches!(
            state.get_evaluation_timestamp("r1").await,
            Err(StateError::Decode { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tick_claims_have_single_winner() {
        let state = Arc::new(StateManager::in_memory());
        let tick = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        let tasks = (0..16).map(|_| {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                state
                    .try_claim_tick("r1", tick, Duration::from_secs(60))
                    .await
            })
        });
        let winners = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .filter(|claimed| *claimed)
            .count();
        assert_eq!(winners, 1);

        // * The next tick is a separate claim
        let next = tick + chrono::Duration::minutes(1);
        assert!(state
            .try_claim_tick("r1", next, Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_clear_all_frees_last_tick_claim() {
        let state = StateManager::in_memory();
        let tick = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let every = Duration::from_secs(60);
        assert!(state.try_claim_tick("r1", tick, every).await.unwrap());
        state.set_evaluation_time("r1", tick, every).await.unwrap();

        // * Evaluation marker, tick claim and the label index (never written, so absent)
        assert_eq!(state.clear_rule_state("r1", ClearScope::All).await, 2);
        assert!(state.try_claim_tick("r1", tick, every).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_scopes() {
        let state = StateManager::in_memory();
        let window = Duration::from_secs(60);
        state.incr_match_count("r1", &[us()], window).await.unwrap();
        state
            .try_enter_silence("r1", &us(), Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(state.clear_rule_state("r1", ClearScope::MatchCounts).await, 1);
        assert!(state.get_silence_remain_time("r1", &us()).await.unwrap() > Duration::ZERO);

        assert_eq!(state.clear_rule_state("r1", ClearScope::Silence).await, 1);
        assert!(state.try_enter_silence("r1", &us(), window).await.unwrap());

        // * The re-entered silence plus the label index
        assert_eq!(state.clear_rule_state("r1", ClearScope::All).await, 2);
    }

    #[tokio::test]
    async fn test_export_restore_moves_state_between_stores() {
        let source = StateManager::new(Arc::new(MemoryStore::new()), "ns");
        let window = Duration::from_secs(300);
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();

        source
            .incr_match_count("r1", &[us(), Label::empty()], window)
            .await
            .unwrap();
        source.incr_match_count("r1", &[us()], window).await.unwrap();
        source
            .try_enter_silence("r1", &us(), Duration::from_secs(600))
            .await
            .unwrap();
        source
            .set_evaluation_time("r1", at, Duration::from_secs(60))
            .await
            .unwrap();

        let snapshots = source
            .export_alert_states(&["r1".to_string()])
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 4);
        assert!(snapshots.iter().all(|s| s.ttl_ms.is_some()));

        let target = StateManager::new(Arc::new(MemoryStore::new()), "other");
        assert_eq!(target.restore_alert_states(&snapshots).await.unwrap(), 4);

        let counts = target.incr_match_count("r1", &[us()], window).await.unwrap();
        assert_eq!(counts[&us()], 3);
        assert!(!target
            .try_enter_silence("r1", &us(), Duration::from_secs(600))
            .await
            .unwrap());
        assert_eq!(target.get_evaluation_timestamp("r1").await.unwrap(), Some(at));
        assert_eq!(
            target.export_alert_states(&["r1".to_string()]).await.unwrap().len(),
            4
        );
    }

    #[tokio::test]
    async fn test_restore_rejects_non_integer_counter() {
        let state = StateManager::in_memory();
        let snapshot = AlertStateSnapshot {
            alert_id: "r1".to_string(),
            label: us(),
            kind: StateKind::MatchCount,
            value: "three".to_string(),
            ttl_ms: None,
        };
        assert!(matches!(
            state.restore_alert_states(&[snapshot]).await,
            Err(StateError::Decode { .. })
        ));
    }

    #[test]
    fn test_snapshot_serializes_label_as_map() {
        let snapshot = AlertStateSnapshot {
            alert_id: "r1".to_string(),
            label: us(),
            kind: StateKind::Silence,
            value: "1".to_string(),
            ttl_ms: Some(1500),
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["label"]["region"], "us");
        assert_eq!(value["kind"], "silence");

        let back: AlertStateSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(back, snapshot);
    }
}
