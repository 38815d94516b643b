mod common;

use apm_alert::config::{StateBackend, StateConfig};
use apm_alert::engine::{Decision, RuleEvaluator};
use apm_alert::model::{Label, Number, NumericKind};
use apm_alert::predicate::{Predicate, ThresholdPredicate};
use apm_alert::query::{Aggregator, MetricField, Row};
use apm_alert::rules::{AlertCondition, AlertRule, RuleEventBus, StateInvalidator};
use apm_alert::state::{AlertStateSnapshot, StateManager};
use common::{at, sources, ScriptedQueryApi};
use std::sync::Arc;
use std::time::Duration;

// * Test Suite for the per-rule state machine across ticks and rule changes

fn cpu_rule(for_times: u32, silence: Duration) -> AlertRule {
    let mut condition = AlertCondition::new(
        "hosts",
        MetricField::new("cpu", Aggregator::Max),
        Predicate::Threshold(ThresholdPredicate::greater_than(Number::Integer(90))),
    );
    condition.group_by = vec!["host".to_string()];
    AlertRule::builder("cpu-high", condition)
        .every(Duration::from_secs(60))
        .for_times(for_times)
        .silence(silence)
        .build()
}

fn host(name: &str) -> Label {
    Label::builder().add("host", name).build()
}

async fn memory_state() -> Arc<StateManager> {
    let config = StateConfig {
        backend: StateBackend::Memory,
        ..StateConfig::default()
    };
    Arc::new(StateManager::from_config(&config).await.unwrap())
}

#[tokio::test]
async fn test_state_machine_from_match_to_silence() {
    let api = ScriptedQueryApi::new(NumericKind::Integer).with_rows(vec![
        Row::new().dimension("host", "a").value("cpu", Some(95.0)),
        Row::new().dimension("host", "b").value("cpu", Some(40.0)),
    ]);
    let state = memory_state().await;
    let evaluator = RuleEvaluator::new(sources(api), state.clone()).with_timezone(common::utc());
    let rule = cpu_rule(3, Duration::from_secs(1800));

    let mut decisions = Vec::new();
    for minute in 0..4 {
        let report = evaluator.evaluate(&rule, at(9, minute)).await.unwrap();
        assert!(!report.decisions.contains_key(&host("b")));
        decisions.push(report.decisions[&host("a")]);
    }

    assert_eq!(decisions[0], Decision::Pending { count: 1 });
    assert_eq!(decisions[1], Decision::Pending { count: 2 });
    assert_eq!(decisions[2], Decision::Fire);
    assert!(matches!(decisions[3], Decision::Silenced { .. }));

    let remaining = state
        .get_silence_remain_time("cpu-high", &host("a"))
        .await
        .unwrap();
    assert!(remaining > Duration::from_secs(1700));
}

#[tokio::test]
async fn test_rule_update_resets_progress_but_keeps_unchanged_silence() {
    let api = ScriptedQueryApi::new(NumericKind::Integer)
        .with_rows(vec![Row::new().dimension("host", "a").value("cpu", Some(95.0))]);
    let state = memory_state().await;
    let bus = RuleEventBus::new();
    StateInvalidator::register(state.clone(), &bus).await;
    let evaluator = RuleEvaluator::new(sources(api), state.clone());

    let original = cpu_rule(1, Duration::from_secs(1800));
    let report = evaluator.evaluate(&original, at(9, 0)).await.unwrap();
    assert_eq!(report.decisions[&host("a")], Decision::Fire);

    let updated = cpu_rule(2, Duration::from_secs(1800));
    bus.publish_updated(&original, &updated).await;

    let report = evaluator.evaluate(&updated, at(9, 1)).await.unwrap();
    assert_eq!(report.decisions[&host("a")], Decision::Pending { count: 1 });
    let report = evaluator.evaluate(&updated, at(9, 2)).await.unwrap();
    assert!(matches!(report.decisions[&host("a")], Decision::Silenced { .. }));
}

#[tokio::test]
async fn test_removed_rule_can_fire_again_under_same_id() {
    let api = ScriptedQueryApi::new(NumericKind::Integer)
        .with_rows(vec![Row::new().dimension("host", "a").value("cpu", Some(95.0))]);
    let state = memory_state().await;
    let bus = RuleEventBus::new();
    StateInvalidator::register(state.clone(), &bus).await;
    let evaluator = RuleEvaluator::new(sources(api), state.clone());

    let rule = cpu_rule(1, Duration::from_secs(3600));
    let report = evaluator.evaluate(&rule, at(9, 0)).await.unwrap();
    assert_eq!(report.decisions[&host("a")], Decision::Fire);

    bus.publish_removed(&rule).await;
    assert!(state
        .export_alert_states(&[rule.id.clone()])
        .await
        .unwrap()
        .is_empty());

    // * Same tick again: the evaluation marker and tick claim went with the rule
    let recreated = cpu_rule(1, Duration::from_secs(3600));
    let report = evaluator.evaluate(&recreated, at(9, 0)).await.unwrap();
    assert!(report.evaluated);
    assert_eq!(report.decisions[&host("a")], Decision::Fire);
}

#[tokio::test]
async fn test_snapshot_survives_json_between_backends() {
    let source = memory_state().await;
    let window = Duration::from_secs(300);
    source
        .incr_match_count("cpu-high", &[host("a"), host("b")], window)
        .await
        .unwrap();
    source
        .try_enter_silence("cpu-high", &host("a"), Duration::from_secs(900))
        .await
        .unwrap();

    let exported = source
        .export_alert_states(&["cpu-high".to_string()])
        .await
        .unwrap();
    let json = serde_json::to_string(&exported).unwrap();
    let imported: Vec<AlertStateSnapshot> = serde_json::from_str(&json).unwrap();

    let target = memory_state().await;
    assert_eq!(target.restore_alert_states(&imported).await.unwrap(), 3);
    assert!(!target
        .try_enter_silence("cpu-high", &host("a"), Duration::from_secs(900))
        .await
        .unwrap());
    assert!(target
        .try_enter_silence("cpu-high", &host("b"), Duration::from_secs(900))
        .await
        .unwrap());
    let counts = target
        .incr_match_count("cpu-high", &[host("b")], window)
        .await
        .unwrap();
    assert_eq!(counts[&host("b")], 2);
}
