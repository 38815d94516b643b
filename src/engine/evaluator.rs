// * Rule Evaluator
// * One evaluation tick per rule: predicate verdicts, match counting, silence claims

use crate::model::{EvaluationOutputs, Label};
use crate::ops::telemetry;
use crate::predicate::{EvaluationContext, EvaluationSources, PredicateError};
use crate::query::TimeSpan;
use crate::rules::AlertRule;
use crate::state::{StateError, StateManager};
use chrono::{DateTime, FixedOffset, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Predicate evaluation failed: {0}")]
    Predicate(#[from] PredicateError),

    #[error("Evaluation state unavailable: {0}")]
    State(#[from] StateError),

    #[error("Evaluation interval of {0:?} is out of range")]
    Interval(Duration),
}

/// What the caller should do for one matched label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Threshold reached and this replica won the silence claim; notify
    Fire,
    /// Threshold reached but an earlier firing is still cooling down
    Silenced { remaining: Duration },
    /// Matched, but not yet for enough cycles
    Pending { count: i64 },
}

/// Result of one tick for one rule
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub alert_id: String,
    /// False when the tick was skipped (rule disabled or already evaluated)
    pub evaluated: bool,
    pub outputs: EvaluationOutputs,
    /// Decisions for matched labels only
    pub decisions: BTreeMap<Label, Decision>,
}

impl EvaluationReport {
    fn skipped(alert_id: &str) -> Self {
        Self {
            alert_id: alert_id.to_string(),
            evaluated: false,
            outputs: Vec::new(),
            decisions: BTreeMap::new(),
        }
    }

    /// Labels this replica should notify for
    pub fn fired(&self) -> impl Iterator<Item = &Label> {
        self.decisions
            .iter()
            .filter(|(_, decision)| **decision == Decision::Fire)
            .map(|(label, _)| label)
    }
}

/// Applies a rule's match-count and silence policy on top of its predicate
///
/// Safe to run on several replicas at once. A replica evaluates a tick only
/// after atomically claiming it, so each tick counts once per label, and only
/// one replica can win a label's silence claim.
#[derive(Clone)]
pub struct RuleEvaluator {
    sources: EvaluationSources,
    state: Arc<StateManager>,
    timezone: Option<FixedOffset>,
}

impl RuleEvaluator {
    pub fn new(sources: EvaluationSources, state: Arc<StateManager>) -> Self {
        Self {
            sources,
            state,
            timezone: None,
        }
    }

    /// Zone for baseline calendar days; the host's offset when unset
    pub fn with_timezone(mut self, timezone: FixedOffset) -> Self {
        self.timezone = Some(timezone);
        self
    }

    /// Evaluates `rule` for the interval ending at `now`
    pub async fn evaluate(
        &self,
        rule: &AlertRule,
        now: DateTime<Utc>,
    ) -> Result<EvaluationReport, EvaluationError> {
        if !rule.enabled {
            debug!(alert_id = %rule.id, "Rule disabled; tick skipped");
            return Ok(EvaluationReport::skipped(&rule.id));
        }

        // * A peer that already handled this tick recorded the same logical time
        if let Some(last) = self.state.get_evaluation_timestamp(&rule.id).await? {
            if last >= now {
                debug!(alert_id = %rule.id, last = %last, "Tick already evaluated");
                return Ok(EvaluationReport::skipped(&rule.id));
            }
        }

        // * Peers racing on the same tick: only the claim holder counts matches
        if !self.state.try_claim_tick(&rule.id, now, rule.every).await? {
            return Ok(EvaluationReport::skipped(&rule.id));
        }

        let every = chrono::Duration::from_std(rule.every)
            .map_err(|_| EvaluationError::Interval(rule.every))?;
        let interval = TimeSpan::new(now - every, now);
        let mut ctx = EvaluationContext::new(&rule.id, interval, now);
        if let Some(timezone) = self.timezone {
            ctx = ctx.with_timezone(timezone);
        }

        let outputs = rule
            .condition
            .predicate
            .evaluate(&self.sources, &rule.condition.target(), &interval, &ctx)
            .await?;

        let matched: Vec<Label> = outputs
            .iter()
            .filter(|output| output.matched)
            .map(|output| output.label.clone())
            .collect();

        let decisions = if matched.is_empty() {
            BTreeMap::new()
        } else {
            self.decide(rule, &matched).await?
        };

        self.state
            .set_evaluation_time(&rule.id, now, rule.every)
            .await?;

        let fired = decisions
            .values()
            .filter(|decision| **decision == Decision::Fire)
            .count();
        info!(
            parent: &ctx.span,
            outputs = outputs.len(),
            matched = matched.len(),
            fired,
            "Rule evaluated"
        );

        Ok(EvaluationReport {
            alert_id: rule.id.clone(),
            evaluated: true,
            outputs,
            decisions,
        })
    }

    /// Evaluates several rules for the same tick concurrently
    pub async fn evaluate_all(
        &self,
        rules: &[AlertRule],
        now: DateTime<Utc>,
    ) -> Vec<Result<EvaluationReport, EvaluationError>> {
        join_all(rules.iter().map(|rule| self.evaluate(rule, now))).await
    }

    async fn decide(
        &self,
        rule: &AlertRule,
        matched: &[Label],
    ) -> Result<BTreeMap<Label, Decision>, EvaluationError> {
        let counts = self
            .state
            .incr_match_count(&rule.id, matched, rule.match_window())
            .await?;
        let required = rule.required_matches();

        let mut decisions = BTreeMap::new();
        for (label, count) in counts {
            let decision = if count < required {
                Decision::Pending { count }
            } else if self
                .state
                .try_enter_silence(&rule.id, &label, rule.silence)
                .await?
            {
                telemetry::record_notification_eligible();
                Decision::Fire
            } else {
                let remaining = self
                    .state
                    .get_silence_remain_time(&rule.id, &label)
                    .await?;
                Decision::Silenced { remaining }
            };

            debug!(alert_id = %rule.id, label = %label, count, ?decision, "Label decided");
            decisions.insert(label, decision);
        }
        Ok(decisions)
    }
}
