//! All enumerated configuration (spec.md §6), loaded once at startup.
//!
//! Required keys missing from the environment fail fast with
//! `ConfigError` before the process enters the main loop — everything
//! else falls back to the defaults named in the spec.

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_max: u32,
}

impl DbConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub url: String,
    pub pop_timeout_s: u64,
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    pub batch_size_max: usize,
    pub window_minutes_max: i64,
    pub min_movement_m: f64,
    pub connect_gap_minutes_max: i64,
    pub max_retries: u32,
    pub stats_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
    pub cors_origin: String,
    pub default_hours: i64,
    pub max_hours: i64,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub tcp_port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub queue: QueueConfig,
    pub matcher: MatcherConfig,
    pub processing: ProcessingConfig,
    pub api: ApiConfig,
    pub ingest: IngestConfig,
    pub worker_parallelism: usize,
}

fn env_var(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingVar(key))
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load and validate configuration from the environment. Called once in
    /// `main`; a missing required key here means the process never enters
    /// the main loop (spec.md §7, `ConfigurationError`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let db = DbConfig {
            host: env_var("DB_HOST")?,
            port: env_or("DB_PORT", 5432),
            database: env_var("DB_DATABASE")?,
            user: env_var("DB_USER")?,
            password: env_var("DB_PASSWORD")?,
            pool_max: env_or("DB_POOL_MAX", 10),
        };

        let queue = QueueConfig {
            url: env_var("QUEUE_URL")?,
            pop_timeout_s: env_or("QUEUE_POP_TIMEOUT_S", 5),
        };

        let matcher = MatcherConfig {
            base_url: env_var("MATCHER_BASE_URL")?,
            timeout_ms: env_or("MATCHER_TIMEOUT_MS", 10_000),
        };

        let processing = ProcessingConfig {
            batch_size_max: env_or("PROCESSING_BATCH_SIZE_MAX", 5),
            window_minutes_max: env_or("PROCESSING_WINDOW_MINUTES_MAX", 2),
            min_movement_m: env_or("PROCESSING_MIN_MOVEMENT_M", 50.0),
            connect_gap_minutes_max: env_or("PROCESSING_CONNECT_GAP_MINUTES_MAX", 5),
            max_retries: env_or("PROCESSING_MAX_RETRIES", 3),
            stats_interval_ms: env_or("PROCESSING_STATS_INTERVAL_MS", 300_000),
        };

        let api = ApiConfig {
            port: env_or("API_PORT", 8080),
            cors_origin: std::env::var("API_CORS_ORIGIN").unwrap_or_else(|_| "*".to_string()),
            default_hours: env_or("API_DEFAULT_HOURS", 168),
            max_hours: env_or("API_MAX_HOURS", 720),
        };

        let ingest = IngestConfig {
            tcp_port: env_or("INGEST_TCP_PORT", 7000),
        };

        let worker_parallelism = env_or("WORKER_PARALLELISM", 1usize).max(1);

        if processing.batch_size_max < 2 {
            return Err(ConfigError::InvalidValue {
                key: "PROCESSING_BATCH_SIZE_MAX",
                value: processing.batch_size_max.to_string(),
            });
        }

        Ok(Config {
            db,
            queue,
            matcher,
            processing,
            api,
            ingest,
            worker_parallelism,
        })
    }
}
