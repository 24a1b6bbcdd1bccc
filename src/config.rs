//! Client configuration.

use std::env;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Page size for catalog fetches
    pub catalog_page_limit: u32,
    /// Seconds to wait for a reservation response
    pub reservation_timeout_secs: u64,
    /// Length of the board selection window
    pub selection_window_secs: u32,
    /// Failed reconnects before giving up
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per attempt
    pub reconnect_base_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catalog_page_limit: 100,
            reservation_timeout_secs: 10,
            selection_window_secs: 30,
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl SyncConfig {
    /// Read overrides from `BINGO_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            catalog_page_limit: parse_env("BINGO_CATALOG_LIMIT", defaults.catalog_page_limit),
            reservation_timeout_secs: parse_env(
                "BINGO_RESERVATION_TIMEOUT",
                defaults.reservation_timeout_secs,
            ),
            selection_window_secs: parse_env(
                "BINGO_SELECTION_WINDOW",
                defaults.selection_window_secs,
            ),
            max_reconnect_attempts: parse_env(
                "BINGO_MAX_RECONNECTS",
                defaults.max_reconnect_attempts,
            ),
            reconnect_base_delay_ms: parse_env(
                "BINGO_RECONNECT_DELAY_MS",
                defaults.reconnect_base_delay_ms,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.catalog_page_limit == 0 {
            return Err(ConfigError::Invalid("catalog_page_limit must be positive".into()));
        }
        Ok(())
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.reservation_timeout_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Unparseable config value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reservation_timeout(), Duration::from_secs(10));
        assert_eq!(config.selection_window_secs, 30);
    }

    #[test]
    fn test_zero_page_limit_is_invalid() {
        let config = SyncConfig {
            catalog_page_limit: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_value(serde_json::json!({"selection_window_secs": 5})).unwrap();
        assert_eq!(config.selection_window_secs, 5);
        assert_eq!(config.catalog_page_limit, 100);
    }
}
