// * Rule Change Events
// * Explicit subscribe/publish between the rule repository and its observers

use super::rule::AlertRule;
use crate::state::{ClearScope, StateManager};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Observer of rule repository changes
///
/// Callbacks cannot fail; a listener handles its own errors so the rest of
/// the chain always runs.
#[async_trait]
pub trait RuleListener: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_loaded(&self, _rule: &AlertRule) {}

    async fn on_updated(&self, original: &AlertRule, updated: &AlertRule);

    async fn on_removed(&self, rule: &AlertRule);
}

/// Fan-out of rule events to every subscribed listener, in subscription order
#[derive(Default)]
pub struct RuleEventBus {
    listeners: RwLock<Vec<Arc<dyn RuleListener>>>,
}

impl RuleEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, listener: Arc<dyn RuleListener>) {
        debug!(listener = listener.name(), "Rule listener subscribed");
        self.listeners.write().await.push(listener);
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn publish_loaded(&self, rule: &AlertRule) {
        for listener in self.snapshot().await {
            listener.on_loaded(rule).await;
        }
    }

    pub async fn publish_updated(&self, original: &AlertRule, updated: &AlertRule) {
        for listener in self.snapshot().await {
            listener.on_updated(original, updated).await;
        }
    }

    pub async fn publish_removed(&self, rule: &AlertRule) {
        for listener in self.snapshot().await {
            listener.on_removed(rule).await;
        }
    }

    // * Callbacks run without the lock so a listener may subscribe others
    async fn snapshot(&self) -> Vec<Arc<dyn RuleListener>> {
        self.listeners.read().await.clone()
    }
}

/// Drops per-rule evaluation state when a rule changes
///
/// An update always resets match counters and drops silences only when the
/// silence duration changed. A removal deletes everything the rule owned.
pub struct StateInvalidator {
    state: Arc<StateManager>,
}

impl StateInvalidator {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self { state }
    }

    /// Creates the invalidator and subscribes it to `bus`
    pub async fn register(state: Arc<StateManager>, bus: &RuleEventBus) -> Arc<Self> {
        let invalidator = Arc::new(Self::new(state));
        bus.subscribe(invalidator.clone()).await;
        invalidator
    }
}

#[async_trait]
impl RuleListener for StateInvalidator {
    fn name(&self) -> &'static str {
        "state_invalidator"
    }

    async fn on_loaded(&self, rule: &AlertRule) {
        debug!(alert_id = %rule.id, "Rule loaded; existing state kept");
    }

    async fn on_updated(&self, original: &AlertRule, updated: &AlertRule) {
        let mut removed = self
            .state
            .clear_rule_state(&updated.id, ClearScope::MatchCounts)
            .await;

        let silence_changed = original.silence != updated.silence;
        if silence_changed {
            removed += self
                .state
                .clear_rule_state(&updated.id, ClearScope::Silence)
                .await;
        }

        // * A renamed id leaves nothing behind under the old one
        if original.id != updated.id {
            removed += self
                .state
                .clear_rule_state(&original.id, ClearScope::All)
                .await;
        }

        info!(
            alert_id = %updated.id,
            silence_changed,
            removed,
            "Rule updated; evaluation state invalidated"
        );
    }

    async fn on_removed(&self, rule: &AlertRule) {
        let removed = self.state.clear_rule_state(&rule.id, ClearScope::All).await;
        info!(alert_id = %rule.id, removed, "Rule removed; evaluation state purged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Label, Number};
    use crate::predicate::{Predicate, ThresholdPredicate};
    use crate::query::{Aggregator, MetricField};
    use crate::rules::AlertCondition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn rule(silence_secs: u64) -> AlertRule {
        let condition = AlertCondition::new(
            "http",
            MetricField::new("latency", Aggregator::Avg),
            Predicate::Threshold(ThresholdPredicate::greater_than(Number::Integer(100))),
        );
        AlertRule::builder("r1", condition)
            .silence(Duration::from_secs(silence_secs))
            .build()
    }

    fn us() -> Label {
        Label::builder().add("region", "us").build()
    }

    #[derive(Default)]
    struct Recorder {
        events: AtomicUsize,
    }

    #[async_trait]
    impl RuleListener for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn on_updated(&self, _: &AlertRule, _: &AlertRule) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_removed(&self, _: &AlertRule) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn matched_and_silenced(state: &StateManager, rule: &AlertRule) {
        state
            .incr_match_count(&rule.id, &[us()], rule.match_window())
            .await
            .unwrap();
        assert!(state
            .try_enter_silence(&rule.id, &us(), rule.silence)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_update_with_same_silence_keeps_silence() {
        let state = Arc::new(StateManager::in_memory());
        let bus = RuleEventBus::new();
        StateInvalidator::register(state.clone(), &bus).await;

        let original = rule(600);
        matched_and_silenced(&state, &original).await;
        bus.publish_updated(&original, &rule(600)).await;

        let counts = state
            .incr_match_count("r1", &[us()], original.match_window())
            .await
            .unwrap();
        assert_eq!(counts[&us()], 1);
        assert!(state.get_silence_remain_time("r1", &us()).await.unwrap() > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_update_with_new_silence_drops_silence() {
        let state = Arc::new(StateManager::in_memory());
        let bus = RuleEventBus::new();
        StateInvalidator::register(state.clone(), &bus).await;

        let original = rule(600);
        matched_and_silenced(&state, &original).await;
        bus.publish_updated(&original, &rule(60)).await;

        assert_eq!(
            state.get_silence_remain_time("r1", &us()).await.unwrap(),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_every_listener_sees_every_event() {
        let state = Arc::new(StateManager::in_memory());
        let bus = RuleEventBus::new();
        let recorder = Arc::new(Recorder::default());
        StateInvalidator::register(state, &bus).await;
        bus.subscribe(recorder.clone()).await;

        bus.publish_loaded(&rule(60)).await;
        bus.publish_updated(&rule(60), &rule(120)).await;
        bus.publish_removed(&rule(120)).await;

        assert_eq!(bus.listener_count().await, 2);
        assert_eq!(recorder.events.load(Ordering::SeqCst), 2);
    }
}
