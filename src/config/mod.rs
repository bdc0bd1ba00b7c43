/// Configuration management for the chatflow engine
///
/// Handles server configuration, database connection, engine limits and the
/// outbound transport endpoint.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Execution limits, retry and recovery policy
    pub engine: EngineConfig,
    /// Outbound message delivery
    pub transport: TransportConfig,
    /// Timeout sweep schedule
    pub scheduler: SchedulerConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL (default: "sqlite://data/chatflow.db")
    pub url: String,
}

/// Dispatcher and recovery limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node steps per dispatcher invocation before `LoopDetected`
    pub max_steps: u32,
    /// Attempts for a transient handler failure (first try included)
    pub retry_max_attempts: u32,
    /// Base delay for exponential backoff between transient retries
    pub retry_base_delay_ms: u64,
    /// Recovery escalations allowed per (flow, subject) inside the window
    pub recovery_max_attempts: u32,
    /// Rolling window for the recovery cap
    pub recovery_window_secs: i64,
    /// Final message sent when a context ends in failure
    pub failure_message: String,
    /// Message sent when a handler is refused authorization
    pub auth_failure_message: String,
    /// Default re-prompt when a validation failure carries none
    pub reprompt_message: String,
    /// Seconds a `running` context may go without progress before the sweep fails it
    pub stale_running_secs: i64,
}

/// Outbound transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Webhook that receives `{chat_id, text, controls}` send requests.
    /// When unset, outbound messages are only logged.
    pub outbound_url: Option<String>,
}

/// Background sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cron expression (with seconds) for the expired-wait sweep
    pub sweep_schedule: String,
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 500,
            retry_max_attempts: 3,
            retry_base_delay_ms: 200,
            recovery_max_attempts: 5,
            recovery_window_secs: 3600,
            failure_message: "Something went wrong. Send /start to begin again or /help to reach a human."
                .to_string(),
            auth_failure_message: "We could not verify your access. Send /help to reach a human."
                .to_string(),
            reprompt_message: "That didn't look right, please try again.".to_string(),
            stale_running_secs: 300,
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let engine_defaults = EngineConfig::default();
        Self {
            server: ServerConfig {
                host: std::env::var("CHATFLOW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("CHATFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                url: std::env::var("CHATFLOW_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/chatflow.db".to_string()),
            },
            engine: EngineConfig {
                max_steps: env_or("CHATFLOW_MAX_STEPS", engine_defaults.max_steps),
                retry_max_attempts: env_or("CHATFLOW_RETRY_ATTEMPTS", engine_defaults.retry_max_attempts),
                retry_base_delay_ms: env_or(
                    "CHATFLOW_RETRY_BASE_DELAY_MS",
                    engine_defaults.retry_base_delay_ms,
                ),
                recovery_max_attempts: env_or(
                    "CHATFLOW_RECOVERY_MAX_ATTEMPTS",
                    engine_defaults.recovery_max_attempts,
                ),
                recovery_window_secs: env_or(
                    "CHATFLOW_RECOVERY_WINDOW_SECS",
                    engine_defaults.recovery_window_secs,
                ),
                stale_running_secs: env_or("CHATFLOW_STALE_RUNNING_SECS", engine_defaults.stale_running_secs),
                ..engine_defaults
            },
            transport: TransportConfig {
                outbound_url: std::env::var("CHATFLOW_OUTBOUND_URL").ok(),
            },
            scheduler: SchedulerConfig {
                sweep_schedule: std::env::var("CHATFLOW_SWEEP_SCHEDULE")
                    .unwrap_or_else(|_| "*/15 * * * * *".to_string()),
            },
        }
    }
}
