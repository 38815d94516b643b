// * Configuration Constants
// * Central location for defaults of the evaluation and state layers

use std::time::Duration;

// * Key namespace prefix for distributed evaluation state
pub const DEFAULT_NAMESPACE: &str = "apm:alert";

// * Baseline entries expire one full day after they are written
pub const BASELINE_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// * Points averaged by the default baseline smoother
pub const DEFAULT_SMOOTHING_WINDOW: usize = 5;

// * Smallest baseline step; one point per minute
pub const MIN_BASELINE_STEP_SECS: u64 = 60;

// * Label index entries outlive keys restored without an expiry by this long
pub const INDEX_FALLBACK_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// * Redis defaults
pub const DEFAULT_REDIS_HOST: &str = "127.0.0.1";
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_POOL_MAX_SIZE: u32 = 8;
pub const DEFAULT_POOL_MIN_IDLE: u32 = 1;
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_CLUSTER_MAX_REDIRECTS: u32 = 5;

// * Prometheus endpoint port
pub const DEFAULT_METRICS_PORT: u16 = 9100;

// * Environment variables
pub const ENV_CONFIG_PATH: &str = "APM_ALERT_CONFIG";
pub const ENV_STATE_BACKEND: &str = "APM_ALERT_STATE_BACKEND";
pub const ENV_NAMESPACE: &str = "APM_ALERT_NAMESPACE";
pub const ENV_LOG_LEVEL: &str = "APM_ALERT_LOG_LEVEL";
