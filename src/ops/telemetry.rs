// * Telemetry - JSON Logging and Prometheus Metrics
// * Structured logging and evaluation metrics for the alerting tier

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, Encoder,
    HistogramVec, IntCounter, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::constants::DEFAULT_METRICS_PORT;

lazy_static! {
    // * Predicate evaluations by predicate type and outcome
    pub static ref EVALUATIONS_TOTAL: CounterVec = register_counter_vec!(
        "apm_alert_evaluations_total",
        "Per-label predicate evaluations by predicate and outcome",
        &["predicate", "outcome"]
    ).unwrap();

    // * Baseline cache lookups
    pub static ref BASELINE_CACHE_TOTAL: CounterVec = register_counter_vec!(
        "apm_alert_baseline_cache_total",
        "Baseline cache lookups by result",
        &["result"]
    ).unwrap();

    // * State store operations
    pub static ref STATE_OPS_TOTAL: CounterVec = register_counter_vec!(
        "apm_alert_state_ops_total",
        "Evaluation state operations by operation",
        &["op"]
    ).unwrap();

    // * State store failures
    pub static ref STATE_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "apm_alert_state_errors_total",
        "Evaluation state failures by operation",
        &["op"]
    ).unwrap();

    // * Query latency
    pub static ref QUERY_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "apm_alert_query_duration_seconds",
        "Metric backend query duration in seconds",
        &["kind"],
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    // * Labels that passed the match-count and silence checks
    pub static ref NOTIFICATIONS_ELIGIBLE_TOTAL: IntCounter = register_int_counter!(
        "apm_alert_notifications_eligible_total",
        "Labels that became eligible to fire"
    ).unwrap();
}

/// Initializes the tracing subscriber with JSON formatting
///
/// # Example
/// ```ignore
/// use apm_alert::ops::telemetry;
///
/// telemetry::init_tracing();
/// tracing::info!(alert_id = "cpu-high", "Evaluating rule");
/// ```
pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Initializes tracing with custom log level
pub fn init_tracing_with_level(level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .try_init();
}

/// Initializes tracing with pretty formatting (for development)
pub fn init_tracing_pretty() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().pretty())
        .try_init();
}

/// Metrics server handle for graceful shutdown
pub struct MetricsServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    running: Arc<AtomicBool>,
}

impl MetricsServerHandle {
    /// Signals the metrics server to shut down
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.running.store(false, Ordering::Relaxed);
    }

    /// Returns true if the server is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Starts the Prometheus metrics HTTP server on the specified port
///
/// Serves `/metrics`, `/health` and `/ready`.
pub async fn start_metrics_server(port: u16) -> MetricsServerHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    tokio::spawn(async move {
        let make_svc = hyper::service::make_service_fn(|_conn| async {
            Ok::<_, std::convert::Infallible>(hyper::service::service_fn(handle_metrics_request))
        });

        let server = match hyper::Server::try_bind(&addr) {
            Ok(builder) => builder.serve(make_svc).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            }),
            Err(e) => {
                tracing::error!(error = %e, port = port, "Metrics server failed to bind");
                running_clone.store(false, Ordering::Relaxed);
                return;
            }
        };

        tracing::info!(port = port, "Metrics server started");

        if let Err(e) = server.await {
            tracing::error!(error = %e, "Metrics server error");
        }

        running_clone.store(false, Ordering::Relaxed);
        tracing::info!("Metrics server stopped");
    });

    MetricsServerHandle {
        shutdown_tx: Some(shutdown_tx),
        running,
    }
}

/// Starts the metrics server on the default port
pub async fn start_metrics_server_default() -> MetricsServerHandle {
    start_metrics_server(DEFAULT_METRICS_PORT).await
}

async fn handle_metrics_request(
    req: hyper::Request<hyper::Body>,
) -> Result<hyper::Response<hyper::Body>, std::convert::Infallible> {
    let (status, content_type, body) = match req.uri().path() {
        "/metrics" => (200, TextEncoder::new().format_type().to_string(), get_metrics_string()),
        "/health" => (200, "text/plain".to_string(), "OK".to_string()),
        "/ready" => (200, "text/plain".to_string(), "READY".to_string()),
        _ => (404, "text/plain".to_string(), "Not Found".to_string()),
    };

    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() =
        hyper::StatusCode::from_u16(status).unwrap_or(hyper::StatusCode::INTERNAL_SERVER_ERROR);
    if let Ok(value) = hyper::header::HeaderValue::from_str(&content_type) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    Ok(response)
}

/// Returns the current metrics as a string
pub fn get_metrics_string() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Records one per-label predicate verdict
pub fn record_evaluation(predicate: &str, outcome: &str) {
    EVALUATIONS_TOTAL
        .with_label_values(&[predicate, outcome])
        .inc();
}

/// Records a baseline cache lookup result (`hit`, `miss`, `load_error`)
pub fn record_baseline_cache(result: &str) {
    BASELINE_CACHE_TOTAL.with_label_values(&[result]).inc();
}

/// Records a state store operation
pub fn record_state_op(op: &str) {
    STATE_OPS_TOTAL.with_label_values(&[op]).inc();
}

/// Records a failed state store operation
pub fn record_state_error(op: &str) {
    STATE_ERRORS_TOTAL.with_label_values(&[op]).inc();
}

/// Records backend query latency measured from `started`
pub fn record_query_duration(kind: &str, started: Instant) {
    QUERY_DURATION_SECONDS
        .with_label_values(&[kind])
        .observe(started.elapsed().as_secs_f64());
}

/// Records a label that became eligible to fire
pub fn record_notification_eligible() {
    NOTIFICATIONS_ELIGIBLE_TOTAL.inc();
}
