//! Process configuration, loaded from environment variables with `.env` fallback.
//!
//! Grounded on the teacher's `config.rs`: every field is `env::var(...).unwrap_or_else(||
//! default).parse::<T>().context("...")?`, so a misconfigured deployment fails fast with a
//! clear message rather than silently defaulting deep inside the engine.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Mock,
    Live,
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mock" => Ok(Mode::Mock),
            "live" => Ok(Mode::Live),
            other => anyhow::bail!("unknown MODE '{other}', expected 'mock' or 'live'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub symbols: Vec<String>,

    pub exchange_api_key: String,
    pub exchange_api_secret: String,
    pub exchange_base_url: String,
    pub testnet: bool,

    pub webhook_secret: String,
    pub store_url: Option<String>,

    pub http_bind_addr: String,

    pub max_exchange_calls_per_sec: usize,
    pub order_timeout_secs: u64,

    pub max_drawdown_pct: Decimal,
    pub max_api_error_pct: Decimal,
    pub volatility_threshold_pct: Decimal,
    pub volatility_breaker_count: u32,
    pub max_position_pct: Decimal,
    pub equity_poll_interval_secs: u64,
    pub btc_symbol: String,

    pub alert_history_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mode: Mode = env::var("MODE")
            .unwrap_or_else(|_| "mock".to_string())
            .parse()
            .context("failed to parse MODE")?;

        let symbols = env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            mode,
            symbols,
            exchange_api_key: env::var("EXCHANGE_API_KEY").unwrap_or_default(),
            exchange_api_secret: env::var("EXCHANGE_API_SECRET").unwrap_or_default(),
            exchange_base_url: env::var("EXCHANGE_BASE_URL")
                .unwrap_or_else(|_| "https://api.binance.com".to_string()),
            testnet: env::var("TESTNET")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("failed to parse TESTNET")?,

            webhook_secret: env::var("WEBHOOK_SECRET").unwrap_or_else(|_| "dev-secret".to_string()),
            store_url: env::var("STORE_URL").ok(),

            http_bind_addr: env::var("HTTP_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),

            max_exchange_calls_per_sec: env::var("MAX_EXCHANGE_CALLS_PER_SEC")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("failed to parse MAX_EXCHANGE_CALLS_PER_SEC")?,
            order_timeout_secs: env::var("ORDER_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("failed to parse ORDER_TIMEOUT_SECS")?,

            max_drawdown_pct: env::var("MAX_DRAWDOWN_PCT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("failed to parse MAX_DRAWDOWN_PCT")?,
            max_api_error_pct: env::var("MAX_API_ERROR_PCT")
                .unwrap_or_else(|_| "2.0".to_string())
                .parse()
                .context("failed to parse MAX_API_ERROR_PCT")?,
            volatility_threshold_pct: env::var("VOLATILITY_THRESHOLD_PCT")
                .unwrap_or_else(|_| "5.0".to_string())
                .parse()
                .context("failed to parse VOLATILITY_THRESHOLD_PCT")?,
            volatility_breaker_count: env::var("VOLATILITY_BREAKER_COUNT")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("failed to parse VOLATILITY_BREAKER_COUNT")?,
            max_position_pct: env::var("MAX_POSITION_PCT")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .context("failed to parse MAX_POSITION_PCT")?,
            equity_poll_interval_secs: env::var("EQUITY_POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("failed to parse EQUITY_POLL_INTERVAL_SECS")?,
            btc_symbol: env::var("BTC_SYMBOL").unwrap_or_else(|_| "BTCUSDT".to_string()),

            alert_history_capacity: env::var("ALERT_HISTORY_CAPACITY")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .context("failed to parse ALERT_HISTORY_CAPACITY")?,
        })
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    pub fn equity_poll_interval(&self) -> Duration {
        Duration::from_secs(self.equity_poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Mock".parse::<Mode>().unwrap(), Mode::Mock);
        assert_eq!("LIVE".parse::<Mode>().unwrap(), Mode::Live);
        assert!("bogus".parse::<Mode>().is_err());
    }
}
