// * State Key Layout
// * <namespace>:<alertId>[:<subKey>] where subKey is a literal or a label identity

use crate::model::Label;

const SILENCE: &str = "silence";
const EVALUATION: &str = "evaluation";
const LABELS: &str = "labels";
const TICK: &str = "tick";

/// Builds every key the state manager touches for one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateKeys {
    namespace: String,
}

impl StateKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Match counter; the empty label maps to the bare rule key
    pub fn counter(&self, alert_id: &str, label: &Label) -> String {
        self.counter_for_identity(alert_id, label.id())
    }

    pub fn counter_for_identity(&self, alert_id: &str, identity: &str) -> String {
        if identity == Label::empty().id() {
            format!("{}:{}", self.namespace, alert_id)
        } else {
            format!("{}:{}:{}", self.namespace, alert_id, identity)
        }
    }

    pub fn silence(&self, alert_id: &str, label: &Label) -> String {
        self.silence_for_identity(alert_id, label.id())
    }

    pub fn silence_for_identity(&self, alert_id: &str, identity: &str) -> String {
        if identity == Label::empty().id() {
            format!("{}:{}:{}", self.namespace, alert_id, SILENCE)
        } else {
            format!("{}:{}:{}:{}", self.namespace, alert_id, SILENCE, identity)
        }
    }

    pub fn evaluation(&self, alert_id: &str) -> String {
        format!("{}:{}:{}", self.namespace, alert_id, EVALUATION)
    }

    /// Claim on one evaluation tick, identified by its logical time in milliseconds
    pub fn tick_claim(&self, alert_id: &str, tick_millis: i64) -> String {
        format!("{}:{}:{}:{}", self.namespace, alert_id, TICK, tick_millis)
    }

    /// Set of label identities that have ever held state for the rule
    pub fn label_index(&self, alert_id: &str) -> String {
        format!("{}:{}:{}", self.namespace, alert_id, LABELS)
    }
}
