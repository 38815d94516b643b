// * APM Alert Evaluation Engine
// * Predicates, baselines and distributed evaluation state for alert rules

pub mod baseline;
pub mod config;
pub mod engine;
pub mod model;
pub mod ops;
pub mod predicate;
pub mod query;
pub mod rules;
pub mod state;
