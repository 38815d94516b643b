// * apm-alert
// * Hosts the evaluation state backend, the rule invalidator and the metrics endpoint

use apm_alert::config::EngineConfig;
use apm_alert::ops::telemetry;
use apm_alert::rules::{RuleEventBus, StateInvalidator};
use apm_alert::state::StateManager;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("apm-alert: {}", e);
            std::process::exit(2);
        }
    };

    if config.telemetry.json {
        telemetry::init_tracing_with_level(&config.telemetry.log_level);
    } else {
        telemetry::init_tracing_pretty();
    }

    let state = match StateManager::from_config(&config.state).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!(error = %e, "Failed to connect evaluation state backend");
            std::process::exit(1);
        }
    };

    let bus = RuleEventBus::new();
    StateInvalidator::register(Arc::clone(&state), &bus).await;

    let metrics = match config.telemetry.metrics_port {
        Some(port) => Some(telemetry::start_metrics_server(port).await),
        None => None,
    };

    info!(
        backend = state.backend_name(),
        namespace = state.keys().namespace(),
        listeners = bus.listener_count().await,
        "apm-alert ready"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutting down");
    if let Some(handle) = metrics {
        handle.shutdown();
    }
}
