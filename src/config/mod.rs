/// Configuration management for the apiflow engine
///
/// Handles server configuration, database connection, queue defaults and
/// executor runtime parameters.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Queue subsystem defaults
    pub queue: QueueConfig,
    /// Workflow executor settings
    pub executor: ExecutorConfig,
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
    /// SQLite connection URL (default: "sqlite://data/apiflow.db")
    pub url: String,
}

/// Service-wide queue defaults
///
/// Every job option and worker option left unset by the caller falls back
/// to the values here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Worker slots per registered queue
    pub team_size: usize,
    /// Retries before a job is terminally failed
    pub retry_limit: u32,
    /// Seconds between a failure and the next attempt
    pub retry_delay_secs: u64,
    /// Seconds a single handler invocation may run
    pub timeout_secs: u64,
    /// Seconds a job may wait for a worker before it expires
    pub expire_in_secs: u64,
    /// Idle worker poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Cron expression (with seconds) for the maintenance sweep
    pub maintenance_schedule: String,
    /// Failed job count at which health degrades to warning
    pub failed_warning_threshold: u64,
    /// Queued job count at which health degrades to warning
    pub queued_warning_threshold: u64,
}

/// How the execution entry point runs a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run the executor on the caller's task and return the summary
    Inline,
    /// Enqueue a job and return a pollable execution id
    Queued,
}

/// Workflow executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub mode: ExecutionMode,
    /// Per-request timeout for api_call steps
    pub http_timeout_secs: u64,
    /// Default timeout for webhook deliveries
    pub webhook_timeout_secs: u64,
    /// Prefix for environment-backed secrets
    pub secret_prefix: String,
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn expire_in(&self) -> Duration {
        Duration::from_secs(self.expire_in_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ExecutorConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("APIFLOW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("APIFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                url: std::env::var("APIFLOW_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/apiflow.db".to_string()),
            },
            queue: QueueConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            team_size: env_or("APIFLOW_TEAM_SIZE", 10),
            retry_limit: env_or("APIFLOW_RETRY_LIMIT", 3),
            retry_delay_secs: env_or("APIFLOW_RETRY_DELAY_SECS", 30),
            timeout_secs: env_or("APIFLOW_JOB_TIMEOUT_SECS", 600),
            expire_in_secs: env_or("APIFLOW_JOB_EXPIRE_SECS", 3600),
            poll_interval_ms: env_or("APIFLOW_POLL_INTERVAL_MS", 500),
            maintenance_schedule: std::env::var("APIFLOW_MAINTENANCE_SCHEDULE")
                .unwrap_or_else(|_| "0 * * * * *".to_string()),
            failed_warning_threshold: env_or("APIFLOW_FAILED_WARNING_THRESHOLD", 25),
            queued_warning_threshold: env_or("APIFLOW_QUEUED_WARNING_THRESHOLD", 1000),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let mode = match std::env::var("APIFLOW_EXECUTION_MODE").as_deref() {
            Ok("inline") => ExecutionMode::Inline,
            _ => ExecutionMode::Queued,
        };

        Self {
            mode,
            http_timeout_secs: env_or("APIFLOW_HTTP_TIMEOUT_SECS", 30),
            webhook_timeout_secs: env_or("APIFLOW_WEBHOOK_TIMEOUT_SECS", 30),
            secret_prefix: std::env::var("APIFLOW_SECRET_PREFIX")
                .unwrap_or_else(|_| "APIFLOW_SECRET_".to_string()),
        }
    }
}
