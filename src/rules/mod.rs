// * Alert Rules
// * Rule definitions and the change events that invalidate their state

pub mod listener;
pub mod rule;

// * Re-exports for convenient access
pub use listener::{RuleEventBus, RuleListener, StateInvalidator};
pub use rule::{AlertCondition, AlertRule, AlertRuleBuilder};
