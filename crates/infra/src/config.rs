//! Engine and worker configuration, read from the environment.

use std::time::Duration;

use thiserror::Error;

pub const SWEEP_INTERVAL_SECS: &str = "TRYOUT_SWEEP_INTERVAL_SECS";
pub const SWEEP_ON_START: &str = "TRYOUT_SWEEP_ON_START";
pub const DATABASE_URL: &str = "DATABASE_URL";
pub const DB_MAX_CONNECTIONS: &str = "TRYOUT_DB_MAX_CONNECTIONS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub sweep_interval: Duration,
    pub sweep_on_start: bool,
    /// Postgres connection string; the in-memory store is used when absent.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(3600),
            sweep_on_start: true,
            database_url: None,
            db_max_connections: 5,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or blank keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(raw) = get(SWEEP_INTERVAL_SECS) {
            let secs: u64 = raw.parse().map_err(|e: std::num::ParseIntError| invalid(SWEEP_INTERVAL_SECS, &raw, e))?;
            if secs == 0 {
                return Err(invalid(SWEEP_INTERVAL_SECS, &raw, "must be at least 1"));
            }
            config.sweep_interval = Duration::from_secs(secs);
        }

        if let Some(raw) = get(SWEEP_ON_START) {
            config.sweep_on_start = parse_flag(&raw).ok_or_else(|| invalid(SWEEP_ON_START, &raw, "expected true or false"))?;
        }

        config.database_url = get(DATABASE_URL);

        if let Some(raw) = get(DB_MAX_CONNECTIONS) {
            let max: u32 = raw.parse().map_err(|e: std::num::ParseIntError| invalid(DB_MAX_CONNECTIONS, &raw, e))?;
            if max == 0 {
                return Err(invalid(DB_MAX_CONNECTIONS, &raw, "must be at least 1"));
            }
            config.db_max_connections = max;
        }

        Ok(config)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
