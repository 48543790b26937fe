//! Configuration for the courier service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use courier_delivery::{
    circuit::CircuitConfig,
    client::ClientConfig,
    poller::LeaseSettings,
    retry::RetryPolicy,
    workers::{DlqWorkerConfig, EventDeliveryConfig},
    EngineConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const CONFIG_FILE: &str = "courier.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use courier_api::Config;
///
/// let config = Config::load().expect("configuration loads");
///
/// println!("operator API on {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Database connection idle timeout in seconds.
    ///
    /// Environment variable: `DATABASE_IDLE_TIMEOUT`
    #[serde(default = "default_idle_timeout", alias = "DATABASE_IDLE_TIMEOUT")]
    pub database_idle_timeout: u64,
    /// Maximum lifetime of database connections in seconds.
    ///
    /// Environment variable: `DATABASE_MAX_LIFETIME`
    #[serde(default = "default_max_lifetime", alias = "DATABASE_MAX_LIFETIME")]
    pub database_max_lifetime: u64,

    // Operator API
    /// Operator API bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Operator API bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// Operator API request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Poll intervals
    /// Delivery worker poll interval in seconds.
    ///
    /// Environment variable: `DELIVERY_POLL_INTERVAL_SECS`
    #[serde(default = "default_delivery_interval", alias = "DELIVERY_POLL_INTERVAL_SECS")]
    pub delivery_poll_interval_secs: u64,
    /// Scheduler worker poll interval in seconds.
    ///
    /// Environment variable: `SCHEDULER_POLL_INTERVAL_SECS`
    #[serde(default = "default_slow_interval", alias = "SCHEDULER_POLL_INTERVAL_SECS")]
    pub scheduler_poll_interval_secs: u64,
    /// Scheduled job worker poll interval in seconds.
    ///
    /// Environment variable: `JOB_POLL_INTERVAL_SECS`
    #[serde(default = "default_slow_interval", alias = "JOB_POLL_INTERVAL_SECS")]
    pub job_poll_interval_secs: u64,
    /// Dead-letter worker poll interval in seconds.
    ///
    /// Environment variable: `DLQ_POLL_INTERVAL_SECS`
    #[serde(default = "default_slow_interval", alias = "DLQ_POLL_INTERVAL_SECS")]
    pub dlq_poll_interval_secs: u64,

    // Batches
    /// Upstream events fetched per delivery tick.
    ///
    /// Environment variable: `DELIVERY_BATCH_SIZE`
    #[serde(default = "default_delivery_batch", alias = "DELIVERY_BATCH_SIZE")]
    pub delivery_batch_size: u32,
    /// Events of one batch delivered concurrently.
    ///
    /// Environment variable: `DELIVERY_CONCURRENCY`
    #[serde(default = "default_delivery_concurrency", alias = "DELIVERY_CONCURRENCY")]
    pub delivery_concurrency: usize,
    /// Due scheduled deliveries handled per tick.
    ///
    /// Environment variable: `SCHEDULER_BATCH_SIZE`
    #[serde(default = "default_scheduler_batch", alias = "SCHEDULER_BATCH_SIZE")]
    pub scheduler_batch_size: u32,
    /// Dead-letter entries claimed per tick.
    ///
    /// Environment variable: `DLQ_BATCH_SIZE`
    #[serde(default = "default_dlq_batch", alias = "DLQ_BATCH_SIZE")]
    pub dlq_batch_size: u32,
    /// Upstream events older than this many seconds are dropped.
    ///
    /// Environment variable: `MAX_EVENT_AGE_SECS`
    #[serde(default = "default_max_event_age", alias = "MAX_EVENT_AGE_SECS")]
    pub max_event_age_secs: u64,

    // Immediate retry
    /// Default in-process attempt budget.
    ///
    /// Environment variable: `MAX_RETRY_ATTEMPTS`
    #[serde(default = "default_retry_attempts", alias = "MAX_RETRY_ATTEMPTS")]
    pub max_retry_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between in-process retries in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor", alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,

    // Dead-letter retry
    /// Default dead-letter cycle budget.
    ///
    /// Environment variable: `DLQ_MAX_RETRIES`
    #[serde(default = "default_dlq_max_retries", alias = "DLQ_MAX_RETRIES")]
    pub dlq_max_retries: u32,
    /// Base delay between dead-letter cycles in seconds.
    ///
    /// Environment variable: `DLQ_BASE_DELAY_SECS`
    #[serde(default = "default_dlq_base_delay", alias = "DLQ_BASE_DELAY_SECS")]
    pub dlq_base_delay_secs: u64,
    /// Maximum delay between dead-letter cycles in seconds.
    ///
    /// Environment variable: `DLQ_MAX_DELAY_SECS`
    #[serde(default = "default_dlq_max_delay", alias = "DLQ_MAX_DELAY_SECS")]
    pub dlq_max_delay_secs: u64,
    /// Seconds after which a `retrying` entry is considered orphaned.
    ///
    /// Environment variable: `DLQ_STALE_AFTER_SECS`
    #[serde(default = "default_dlq_stale_after", alias = "DLQ_STALE_AFTER_SECS")]
    pub dlq_stale_after_secs: u64,

    // Circuit breaker
    /// Consecutive failures that disable a route.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_FAILURE_THRESHOLD`
    #[serde(default = "default_failure_threshold", alias = "CIRCUIT_BREAKER_FAILURE_THRESHOLD")]
    pub circuit_breaker_failure_threshold: u32,
    /// Seconds after the last failure before a single probe is allowed.
    /// Unset keeps open circuits open until an operator resets them.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_HALF_OPEN_SECS`
    #[serde(default, alias = "CIRCUIT_BREAKER_HALF_OPEN_SECS")]
    pub circuit_breaker_half_open_secs: Option<u64>,

    // Collaborators and client
    /// Dedup cache entry lifetime in seconds.
    ///
    /// Environment variable: `DEDUP_TTL_SECS`
    #[serde(default = "default_dedup_ttl", alias = "DEDUP_TTL_SECS")]
    pub dedup_ttl_secs: u64,
    /// Data source fetch timeout for scheduled jobs in seconds.
    ///
    /// Environment variable: `FETCH_TIMEOUT_SECS`
    #[serde(default = "default_fetch_timeout", alias = "FETCH_TIMEOUT_SECS")]
    pub fetch_timeout_secs: u64,
    /// Upper bound on a single outbound HTTP request in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,
    /// User agent sent with every delivery.
    ///
    /// Environment variable: `DELIVERY_USER_AGENT`
    #[serde(default = "default_user_agent", alias = "DELIVERY_USER_AGENT")]
    pub delivery_user_agent: String,

    // Coordination
    /// Take a per-worker lease before every tick.
    ///
    /// Environment variable: `WORKER_LEASE_ENABLED`
    #[serde(default = "default_lease_enabled", alias = "WORKER_LEASE_ENABLED")]
    pub worker_lease_enabled: bool,
    /// Lease owner id. Defaults to a random id per process.
    ///
    /// Environment variable: `INSTANCE_ID`
    #[serde(default, alias = "INSTANCE_ID")]
    pub instance_id: Option<String>,
    /// Seconds to wait for in-flight ticks on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: u64,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `courier.toml` and environment
    /// variable overrides.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed("")),
        )
    }

    /// Extracts and validates configuration from a prepared figment.
    ///
    /// # Errors
    ///
    /// Returns error if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Engine settings derived from this configuration.
    pub fn to_engine_config(&self) -> EngineConfig {
        let delivery_interval = Duration::from_secs(self.delivery_poll_interval_secs);
        let scheduler_interval = Duration::from_secs(self.scheduler_poll_interval_secs);
        let job_interval = Duration::from_secs(self.job_poll_interval_secs);
        let dlq_interval = Duration::from_secs(self.dlq_poll_interval_secs);

        EngineConfig {
            delivery_interval,
            scheduler_interval,
            job_interval,
            dlq_interval,
            delivery: EventDeliveryConfig {
                batch_size: self.delivery_batch_size,
                concurrency: self.delivery_concurrency,
                max_event_age: Duration::from_secs(self.max_event_age_secs),
            },
            scheduler_batch_size: self.scheduler_batch_size,
            dlq: DlqWorkerConfig {
                batch_size: self.dlq_batch_size,
                stale_after: Duration::from_secs(self.dlq_stale_after_secs),
            },
            immediate_policy: self.to_retry_policy(),
            dlq_policy: self.to_dlq_policy(),
            circuit: self.to_circuit_config(),
            dedup_ttl: Duration::from_secs(self.dedup_ttl_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            client: self.to_client_config(),
            lease: self.worker_lease_enabled.then(|| LeaseSettings {
                owner: self
                    .instance_id
                    .clone()
                    .unwrap_or_else(|| format!("courier-{}", Uuid::new_v4())),
                ttl: delivery_interval.max(scheduler_interval).max(job_interval).max(dlq_interval)
                    * 3,
            }),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    /// HTTP client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            user_agent: self.delivery_user_agent.clone(),
            ..ClientConfig::default()
        }
    }

    /// In-process retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
        }
    }

    /// Dead-letter retry policy.
    pub fn to_dlq_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.dlq_max_retries,
            base_delay: Duration::from_secs(self.dlq_base_delay_secs),
            max_delay: Duration::from_secs(self.dlq_max_delay_secs),
            jitter_factor: self.retry_jitter_factor,
        }
    }

    /// Circuit breaker configuration.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            half_open_after: self.circuit_breaker_half_open_secs.map(Duration::from_secs),
        }
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Returns error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("invalid server address")
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        let intervals = [
            self.delivery_poll_interval_secs,
            self.scheduler_poll_interval_secs,
            self.job_poll_interval_secs,
            self.dlq_poll_interval_secs,
        ];
        if intervals.contains(&0) {
            anyhow::bail!("poll intervals must be greater than 0");
        }

        if self.delivery_batch_size == 0
            || self.delivery_concurrency == 0
            || self.scheduler_batch_size == 0
            || self.dlq_batch_size == 0
        {
            anyhow::bail!("batch sizes must be greater than 0");
        }

        if self.max_retry_attempts == 0 {
            anyhow::bail!("max_retry_attempts must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.circuit_breaker_failure_threshold == 0 {
            anyhow::bail!("circuit_breaker_failure_threshold must be greater than 0");
        }

        if self.fetch_timeout_secs == 0 || self.delivery_timeout_seconds == 0 {
            anyhow::bail!("timeouts must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            database_idle_timeout: default_idle_timeout(),
            database_max_lifetime: default_max_lifetime(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            delivery_poll_interval_secs: default_delivery_interval(),
            scheduler_poll_interval_secs: default_slow_interval(),
            job_poll_interval_secs: default_slow_interval(),
            dlq_poll_interval_secs: default_slow_interval(),
            delivery_batch_size: default_delivery_batch(),
            delivery_concurrency: default_delivery_concurrency(),
            scheduler_batch_size: default_scheduler_batch(),
            dlq_batch_size: default_dlq_batch(),
            max_event_age_secs: default_max_event_age(),
            max_retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_jitter_factor: default_jitter_factor(),
            dlq_max_retries: default_dlq_max_retries(),
            dlq_base_delay_secs: default_dlq_base_delay(),
            dlq_max_delay_secs: default_dlq_max_delay(),
            dlq_stale_after_secs: default_dlq_stale_after(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_half_open_secs: None,
            dedup_ttl_secs: default_dedup_ttl(),
            fetch_timeout_secs: default_fetch_timeout(),
            delivery_timeout_seconds: default_delivery_timeout(),
            delivery_user_agent: default_user_agent(),
            worker_lease_enabled: default_lease_enabled(),
            instance_id: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_lifetime() -> u64 {
    1800
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_delivery_interval() -> u64 {
    5
}

fn default_slow_interval() -> u64 {
    60
}

fn default_delivery_batch() -> u32 {
    5
}

fn default_delivery_concurrency() -> usize {
    5
}

fn default_scheduler_batch() -> u32 {
    10
}

fn default_dlq_batch() -> u32 {
    50
}

fn default_max_event_age() -> u64 {
    24 * 60 * 60
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_dlq_max_retries() -> u32 {
    5
}

fn default_dlq_base_delay() -> u64 {
    60
}

fn default_dlq_max_delay() -> u64 {
    3600
}

fn default_dlq_stale_after() -> u64 {
    600
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_dedup_ttl() -> u64 {
    300
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_delivery_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("Courier-Delivery/{}", env!("CARGO_PKG_VERSION"))
}

fn default_lease_enabled() -> bool {
    true
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info,courier=debug,tower_http=debug".to_string()
}
