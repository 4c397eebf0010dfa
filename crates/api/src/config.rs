//! Application configuration

use std::env;
use std::time::Duration;

use crate::websocket::heartbeat::HeartbeatConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database (optional - falls back to the in-memory store)
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,

    // Liveness
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,

    // Offline presence relay
    pub observer_ttl_secs: u64,
    pub observer_max_rooms: usize,

    // Protocol limits
    pub max_message_bytes: usize,
    pub protocol_error_limit: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 5)?,

            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            jwt_expiry_hours: parse_or("JWT_EXPIRY_HOURS", 24)?,

            heartbeat_interval_secs: parse_or("HEARTBEAT_INTERVAL_SECS", 30)?,
            heartbeat_timeout_secs: parse_or("HEARTBEAT_TIMEOUT_SECS", 10)?,

            // 3 days
            observer_ttl_secs: parse_or("OBSERVER_TTL_SECS", 259_200)?,
            observer_max_rooms: parse_or("OBSERVER_MAX_ROOMS", 10_000)?,

            max_message_bytes: parse_or("MAX_MESSAGE_BYTES", 16_384)?,
            protocol_error_limit: parse_or("PROTOCOL_ERROR_LIMIT", 5)?,
        };

        // Reject an ordering that could let a stale timeout close a healthy connection
        config.heartbeat()?;

        Ok(config)
    }

    /// Configuration with defaults for everything except the signing secret
    pub fn with_secret(jwt_secret: impl Into<String>) -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            database_url: None,
            database_max_connections: 5,
            jwt_secret: jwt_secret.into(),
            jwt_expiry_hours: 24,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
            observer_ttl_secs: 259_200,
            observer_max_rooms: 10_000,
            max_message_bytes: 16_384,
            protocol_error_limit: 5,
        }
    }

    /// Validated heartbeat timings
    pub fn heartbeat(&self) -> Result<HeartbeatConfig, ConfigError> {
        HeartbeatConfig::new(
            Duration::from_secs(self.heartbeat_interval_secs),
            Duration::from_secs(self.heartbeat_timeout_secs),
        )
    }

    pub fn observer_ttl(&self) -> Duration {
        Duration::from_secs(self.observer_ttl_secs)
    }
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
    #[error("Heartbeat timeout ({timeout:?}) must be shorter than the heartbeat interval ({interval:?})")]
    HeartbeatOrdering { interval: Duration, timeout: Duration },
}
