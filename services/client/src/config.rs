//! services/client/src/config.rs
//!
//! Defines the client's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development. Every scheduled-task interval has a default
//! and can be overridden individually.

use std::net::SocketAddr;
use std::time::Duration;
use study_sync_core::connectivity::RetryPolicy;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bridge_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub allowed_origin: String,
    pub session: SessionConfig,
}

/// Timing and sizing knobs for one group session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub tick_interval: Duration,
    pub authority_broadcast_interval: Duration,
    pub heartbeat_interval: Duration,
    pub presence_interval: Duration,
    pub user_sweep_interval: Duration,
    pub group_sweep_interval: Duration,
    pub poll_interval: Duration,
    pub public_refresh_interval: Duration,
    /// How long a `Subscribed` channel must stay healthy before it is trusted.
    pub confirm_delay: Duration,
    /// Pause before re-opening a store change feed that ended.
    pub change_feed_retry: Duration,
    pub retry: RetryPolicy,
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            authority_broadcast_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            presence_interval: Duration::from_secs(60),
            user_sweep_interval: Duration::from_secs(60),
            group_sweep_interval: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(2),
            public_refresh_interval: Duration::from_secs(30),
            confirm_delay: Duration::from_millis(500),
            change_feed_retry: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            history_limit: 100,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        // --- Bridge and Database Settings ---
        let bridge_address_str =
            std::env::var("BRIDGE_ADDRESS").unwrap_or_else(|_| "127.0.0.1:4000".to_string());
        let bridge_address = bridge_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BRIDGE_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let allowed_origin = std::env::var("ALLOWED_ORIGIN")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());

        Ok(Self {
            bridge_address,
            database_url,
            log_level,
            allowed_origin,
            session: SessionConfig::from_env()?,
        })
    }
}

impl SessionConfig {
    /// Defaults overridden by any of the interval variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let read = |name: &str| std::env::var(name).ok();
        let defaults = Self::default();

        Ok(Self {
            tick_interval: defaults.tick_interval,
            authority_broadcast_interval: defaults.authority_broadcast_interval,
            heartbeat_interval: secs_var(
                "HEARTBEAT_INTERVAL_SECS",
                read("HEARTBEAT_INTERVAL_SECS"),
                defaults.heartbeat_interval,
            )?,
            presence_interval: secs_var(
                "PRESENCE_INTERVAL_SECS",
                read("PRESENCE_INTERVAL_SECS"),
                defaults.presence_interval,
            )?,
            user_sweep_interval: secs_var(
                "USER_SWEEP_INTERVAL_SECS",
                read("USER_SWEEP_INTERVAL_SECS"),
                defaults.user_sweep_interval,
            )?,
            group_sweep_interval: secs_var(
                "GROUP_SWEEP_INTERVAL_SECS",
                read("GROUP_SWEEP_INTERVAL_SECS"),
                defaults.group_sweep_interval,
            )?,
            poll_interval: millis_var(
                "POLL_INTERVAL_MS",
                read("POLL_INTERVAL_MS"),
                defaults.poll_interval,
            )?,
            public_refresh_interval: secs_var(
                "PUBLIC_REFRESH_INTERVAL_SECS",
                read("PUBLIC_REFRESH_INTERVAL_SECS"),
                defaults.public_refresh_interval,
            )?,
            confirm_delay: millis_var(
                "CONFIRM_DELAY_MS",
                read("CONFIRM_DELAY_MS"),
                defaults.confirm_delay,
            )?,
            change_feed_retry: defaults.change_feed_retry,
            retry: defaults.retry,
            history_limit: match read("HISTORY_LIMIT") {
                Some(raw) => parse_positive("HISTORY_LIMIT", &raw)? as usize,
                None => defaults.history_limit,
            },
        })
    }
}

fn parse_positive(name: &str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("'{}' is not a positive integer", raw),
        )),
    }
}

fn secs_var(name: &str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    raw.map_or(Ok(default), |raw| parse_positive(name, &raw).map(Duration::from_secs))
}

fn millis_var(name: &str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    raw.map_or(Ok(default), |raw| parse_positive(name, &raw).map(Duration::from_millis))
}
