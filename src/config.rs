//! Runtime configuration, read from the environment (a `.env` file is loaded first if present).

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub delivery_timeout: Duration,
    /// Outbound queue size per connection.
    pub connection_buffer: usize,
    pub ping_timeout_secs: u64,
    pub prune_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let prune_interval_secs: u64 = parse_or(&lookup, "PRUNE_INTERVAL_SECS", 60)?;
        if prune_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "PRUNE_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            bind_addr: parse_or(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            jwt_secret,
            delivery_timeout: Duration::from_millis(parse_or(&lookup, "DELIVERY_TIMEOUT_MS", 5_000)?),
            connection_buffer: parse_or(&lookup, "CONNECTION_BUFFER", 64)?,
            ping_timeout_secs: parse_or(&lookup, "PING_TIMEOUT_SECS", 300)?,
            prune_interval: Duration::from_secs(prune_interval_secs),
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
