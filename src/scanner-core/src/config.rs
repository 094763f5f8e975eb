//! Environment-sourced configuration, following the teacher's
//! `from_env`/`from_env_only` split so tests can load config without
//! picking up stray values from a developer's `.env`.

use std::env;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub health_port: u16,
    pub log_level: String,
    pub catalog_api_url: String,
    pub feed_ws_url: String,
    pub max_subscriptions: usize,
    pub min_volume_24h: Decimal,
    pub min_liquidity: Decimal,
    pub min_expiry: Duration,
    pub max_expiry: Duration,
    pub pinned_market_prefixes: Vec<String>,
    pub min_combined_threshold: Decimal,
    pub min_arb_ticks: u32,
    pub catalog_refresh_interval: Duration,
    pub pinned_refresh_interval: Duration,
    pub aggregator_interval: Duration,
}

impl Config {
    /// Load `.env` if present, then read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Read from the process environment without touching `.env`. Used by
    /// tests that need deterministic defaults.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let parse_u64 = |field: &'static str, value: String| -> Result<u64, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidValue { field, value })
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/arb_scanner".to_string()),
            health_port: env::var("HEALTH_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            catalog_api_url: env::var("CATALOG_API_URL")
                .unwrap_or_else(|_| "https://gamma-api.polymarket.com".to_string()),
            feed_ws_url: env::var("FEED_WS_URL")
                .unwrap_or_else(|_| "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()),
            max_subscriptions: env::var("MAX_SUBSCRIPTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2000),
            min_volume_24h: env::var("MIN_VOLUME_24H")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Decimal::new(10_000, 0)),
            min_liquidity: env::var("MIN_LIQUIDITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Decimal::new(5_000, 0)),
            min_expiry: Duration::from_secs(
                match env::var("MIN_EXPIRY_SECS") {
                    Ok(v) => parse_u64("MIN_EXPIRY_SECS", v)?,
                    Err(_) => 300,
                },
            ),
            max_expiry: Duration::from_secs(
                match env::var("MAX_EXPIRY_SECS") {
                    Ok(v) => parse_u64("MAX_EXPIRY_SECS", v)?,
                    Err(_) => 3600 * 24 * 30,
                },
            ),
            pinned_market_prefixes: env::var("PINNED_MARKET_PREFIXES")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            min_combined_threshold: env::var("MIN_COMBINED_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Decimal::ONE),
            min_arb_ticks: env::var("MIN_ARB_TICKS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            catalog_refresh_interval: Duration::from_secs(60),
            pinned_refresh_interval: Duration::from_secs(10),
            aggregator_interval: Duration::from_secs(60),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "DATABASE_URL",
            "HEALTH_PORT",
            "LOG_LEVEL",
            "CATALOG_API_URL",
            "FEED_WS_URL",
            "MAX_SUBSCRIPTIONS",
            "MIN_VOLUME_24H",
            "MIN_LIQUIDITY",
            "MIN_EXPIRY_SECS",
            "MAX_EXPIRY_SECS",
            "PINNED_MARKET_PREFIXES",
            "MIN_COMBINED_THRESHOLD",
            "MIN_ARB_TICKS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_are_applied_when_unset() {
        clear_env();
        let config = Config::from_env_only().unwrap();
        assert_eq!(config.min_arb_ticks, 2);
        assert_eq!(config.min_combined_threshold, Decimal::ONE);
        assert!(config.pinned_market_prefixes.is_empty());
    }

    #[test]
    #[serial]
    fn pinned_prefixes_split_on_comma_and_trim() {
        clear_env();
        env::set_var("PINNED_MARKET_PREFIXES", "BTC 5m, ETH 5m ,  ");
        let config = Config::from_env_only().unwrap();
        assert_eq!(config.pinned_market_prefixes, vec!["BTC 5m", "ETH 5m"]);
        clear_env();
    }

    #[test]
    #[serial]
    fn invalid_numeric_env_var_is_an_error() {
        clear_env();
        env::set_var("MIN_EXPIRY_SECS", "not-a-number");
        let result = Config::from_env_only();
        assert!(result.is_err());
        clear_env();
    }
}
