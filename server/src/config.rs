use crate::{api::RateLimit, broadcaster::BROADCAST_INTERVAL, flusher::FLUSH_INTERVAL};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::Level;

/// Server configuration, as read from YAML.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub directory: String,
    pub log_level: String,
    pub log_json: bool,

    pub flush_interval_ms: u64,
    pub broadcast_interval_ms: u64,

    /// Requests per second per client IP; `0` disables rate limiting.
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5201,
            directory: "./data".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            flush_interval_ms: FLUSH_INTERVAL.as_millis() as u64,
            broadcast_interval_ms: BROADCAST_INTERVAL.as_millis() as u64,
            rate_limit_per_second: 50,
            rate_limit_burst: 200,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
}

pub struct ValidatedConfig {
    pub port: u16,
    pub directory: PathBuf,
    pub log_level: Level,
    pub log_json: bool,

    pub flush_interval: Duration,
    pub broadcast_interval: Duration,
    pub rate_limit: Option<RateLimit>,
}

fn non_zero(field: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(value)
}

impl Config {
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let log_level = Level::from_str(&self.log_level).map_err(|_| {
            ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            }
        })?;
        let flush_interval =
            Duration::from_millis(non_zero("flush_interval_ms", self.flush_interval_ms)?);
        let broadcast_interval = Duration::from_millis(non_zero(
            "broadcast_interval_ms",
            self.broadcast_interval_ms,
        )?);
        let rate_limit = match self.rate_limit_per_second {
            0 => None,
            per_second => Some(RateLimit {
                per_second,
                burst: non_zero("rate_limit_burst", self.rate_limit_burst as u64)? as u32,
            }),
        };

        Ok(ValidatedConfig {
            port: self.port,
            directory: PathBuf::from(self.directory),
            log_level,
            log_json: self.log_json,
            flush_interval,
            broadcast_interval,
            rate_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default().validate().unwrap();
        assert_eq!(config.port, 5201);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.broadcast_interval, Duration::from_millis(200));
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(
            config.rate_limit,
            Some(RateLimit {
                per_second: 50,
                burst: 200
            })
        );
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str(
            "port: 9000\nlog_level: debug\nrate_limit_per_second: 0\ndirectory: /var/lib/chests\n",
        )
        .unwrap();
        let config = config.validate().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.directory, PathBuf::from("/var/lib/chests"));
        assert_eq!(config.rate_limit, None);
        assert_eq!(config.flush_interval, FLUSH_INTERVAL);
    }

    #[test]
    fn test_invalid_values() {
        let config = Config {
            log_level: "loud".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel { .. })
        ));

        let config = Config {
            broadcast_interval_ms: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidNonZero {
                field: "broadcast_interval_ms",
                ..
            })
        ));

        let config = Config {
            rate_limit_burst: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
