// * Alert Rule
// * The slice of a rule definition the evaluation engine reads

use crate::predicate::{Predicate, QueryTarget};
use crate::query::MetricField;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a rule queries and how it judges the result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCondition {
    pub data_source: String,
    pub metric: MetricField,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub predicate: Predicate,
}

impl AlertCondition {
    pub fn new(data_source: impl Into<String>, metric: MetricField, predicate: Predicate) -> Self {
        Self {
            data_source: data_source.into(),
            metric,
            filter: None,
            group_by: Vec::new(),
            predicate,
        }
    }

    pub fn target(&self) -> QueryTarget<'_> {
        QueryTarget {
            data_source: &self.data_source,
            metric: &self.metric,
            filter: self.filter.as_deref(),
            group_by: &self.group_by,
        }
    }
}

/// Alert rule as published by the rule repository
///
/// - `every`: evaluation interval
/// - `for_times`: consecutive matched cycles required before firing
/// - `silence`: cool-down after a label fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub every: Duration,
    #[serde(default = "default_for_times")]
    pub for_times: u32,
    #[serde(with = "humantime_serde")]
    pub silence: Duration,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub condition: AlertCondition,
}

fn default_for_times() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    pub fn builder(id: impl Into<String>, condition: AlertCondition) -> AlertRuleBuilder {
        AlertRuleBuilder::new(id, condition)
    }

    /// Matched cycles needed before a label may fire; never below one
    pub fn required_matches(&self) -> i64 {
        i64::from(self.for_times.max(1))
    }

    /// How long a match counter survives without a new match
    ///
    /// One interval of slack beyond `for_times` cycles keeps a counter alive
    /// until the next tick.
    pub fn match_window(&self) -> Duration {
        self.every
            .saturating_mul(self.for_times.max(1).saturating_add(1))
    }
}

/// Fluent construction for [`AlertRule`]
#[derive(Debug, Clone)]
pub struct AlertRuleBuilder {
    rule: AlertRule,
}

impl AlertRuleBuilder {
    pub fn new(id: impl Into<String>, condition: AlertCondition) -> Self {
        let id = id.into();
        Self {
            rule: AlertRule {
                name: id.clone(),
                id,
                every: Duration::from_secs(60),
                for_times: default_for_times(),
                silence: Duration::from_secs(600),
                enabled: true,
                condition,
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.rule.name = name.into();
        self
    }

    pub fn every(mut self, every: Duration) -> Self {
        self.rule.every = every;
        self
    }

    pub fn for_times(mut self, for_times: u32) -> Self {
        self.rule.for_times = for_times;
        self
    }

    pub fn silence(mut self, silence: Duration) -> Self {
        self.rule.silence = silence;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.rule.enabled = enabled;
        self
    }

    pub fn build(self) -> AlertRule {
        self.rule
    }
}
