// * Operations
// * Production observability: structured logging and Prometheus metrics

pub mod telemetry;

// * Re-exports for convenient access
pub use telemetry::{
    get_metrics_string, init_tracing, init_tracing_pretty, init_tracing_with_level,
    record_baseline_cache, record_evaluation, record_notification_eligible,
    record_query_duration, record_state_error, record_state_op, start_metrics_server,
    start_metrics_server_default, MetricsServerHandle,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        record_state_op("reset_match_count");
        record_state_error("reset_match_count");
        record_notification_eligible();

        let metrics = get_metrics_string();
        assert!(metrics.contains("apm_alert_state_errors_total"));
        assert!(metrics.contains("apm_alert_notifications_eligible_total"));
    }
}
