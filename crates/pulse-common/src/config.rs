//! Configuration for the Pulsewatch pipeline

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Backing store and connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path; `:memory:` for tests
    pub path: String,
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "pulsewatch.db".to_string(),
            pool_size: 8,
            acquire_timeout_ms: 10_000,
        }
    }
}

/// Ingest path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Points per storage chunk
    pub chunk_size: usize,
    /// Dead-letter at most this many failed items per request
    pub dead_letter_limit: usize,
    pub idempotency_ttl_hours: i64,
    pub dead_letter_max_retries: u32,
    pub dead_letter_base_delay_ms: u64,
    pub dead_letter_max_delay_ms: u64,
    pub pipeline_version: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            dead_letter_limit: 10,
            idempotency_ttl_hours: 24,
            dead_letter_max_retries: 5,
            dead_letter_base_delay_ms: 1_000,
            dead_letter_max_delay_ms: 3_600_000,
            pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Forecast engine and remote backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    pub default_backend: String,
    pub remote_api_url: Option<String>,
    pub remote_api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub health_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_open_for_secs: u64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            default_backend: "holt_winters".to_string(),
            remote_api_url: None,
            remote_api_key: None,
            request_timeout_ms: 30_000,
            health_timeout_ms: 5_000,
            max_retries: 3,
            retry_base_delay_ms: 500,
            breaker_failure_threshold: 5,
            breaker_open_for_secs: 60,
        }
    }
}

/// Alert filtering and lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// Default dedup window when a rule does not configure one
    pub dedup_window_ms: u64,
    pub rate_limit_per_minute: u64,
    pub escalation_timeout_ms: u64,
    pub max_escalation_level: u32,
    pub reminder_interval_ms: u64,
    pub channel_timeout_ms: u64,
    pub channel_max_retries: u32,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 300_000,
            rate_limit_per_minute: 60,
            escalation_timeout_ms: 1_800_000,
            max_escalation_level: 3,
            reminder_interval_ms: 3_600_000,
            channel_timeout_ms: 10_000,
            channel_max_retries: 3,
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub probe_timeout_ms: u64,
    pub history_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5_000,
            history_size: 100,
        }
    }
}

/// Intervals for host-driven background loops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub escalation_check_interval_ms: u64,
    pub reminder_check_interval_ms: u64,
    pub dedup_cleanup_interval_ms: u64,
    pub idempotency_cleanup_interval_ms: u64,
    pub dead_letter_retry_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            escalation_check_interval_ms: 60_000,
            reminder_check_interval_ms: 60_000,
            dedup_cleanup_interval_ms: 60_000,
            idempotency_cleanup_interval_ms: 300_000,
            dead_letter_retry_interval_ms: 30_000,
        }
    }
}

impl Config {
    /// Defaults overlaid with environment variables
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(path) = std::env::var("PULSE_DATABASE_PATH") {
            config.database.path = path;
        }
        if let Ok(backend) = std::env::var("PULSE_DEFAULT_BACKEND") {
            config.forecast.default_backend = backend;
        }
        if let Ok(url) = std::env::var("PULSE_FORECAST_API_URL") {
            config.forecast.remote_api_url = Some(url);
        }
        if let Ok(key) = std::env::var("PULSE_FORECAST_API_KEY") {
            config.forecast.remote_api_key = Some(key);
        }
        if let Ok(addr) = std::env::var("PULSE_BIND_ADDRESS") {
            config.server.bind_address = addr;
        }
        if let Ok(port) = std::env::var("PULSE_PORT") {
            if let Ok(port) = port.parse() {
                config.server.port = port;
            }
        }
        config
    }
}
