//! Environment-driven runtime configuration.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

use crate::domain::types::AccountType;

/// Application execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Mock,
    Live,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Mode::Mock),
            "live" => Ok(Mode::Live),
            _ => anyhow::bail!("Invalid MODE: {}. Must be 'mock' or 'live'", s),
        }
    }
}

/// Main application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // Core
    pub mode: Mode,
    pub account_type: AccountType,

    // Brokerage
    pub broker_app_key: String,
    pub broker_app_secret: String,
    pub broker_account_no: String,
    pub broker_base_url: String,
    pub broker_ws_url: String,
    pub exchange_code: String,

    // Quote REST API
    pub quote_api_base_url: String,
    pub quote_api_key: String,

    // News
    pub rss_feed_url: String,
    pub news_poll_seconds: u64,
    pub news_dedup_capacity: usize,

    // Decision thresholds and sizing
    pub pending_score_threshold: f64,
    pub execute_score_threshold: f64,
    pub position_fraction: Decimal,
    pub max_position_usd: Decimal,

    // Exit rules
    pub stop_loss_percent: Decimal,
    pub take_profit_percent: Decimal,

    // Cache TTLs and worker intervals
    pub balance_ttl_seconds: u64,
    pub positions_ttl_seconds: u64,
    pub monitor_interval_seconds: u64,
    pub market_poll_seconds: u64,
    pub history_sync_seconds: u64,

    // Behavior toggles
    pub simulation_mode: bool,
    pub mock_initial_cash: Decimal,

    // Storage
    pub database_url: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mode_str = env::var("MODE").unwrap_or_else(|_| "mock".to_string());
        let mode = Mode::from_str(&mode_str)?;

        let account_type_str = env::var("ACCOUNT_TYPE").unwrap_or_else(|_| "virtual".to_string());
        let account_type = AccountType::from_str(&account_type_str)?;

        // Real and virtual accounts live on different brokerage hosts.
        let (default_base, default_ws) = match account_type {
            AccountType::Real => (
                "https://openapi.koreainvestment.com:9443",
                "ws://ops.koreainvestment.com:21000",
            ),
            AccountType::Virtual => (
                "https://openapivts.koreainvestment.com:29443",
                "ws://ops.koreainvestment.com:31000",
            ),
        };

        let config = Self {
            mode,
            account_type,

            broker_app_key: env::var("BROKER_APP_KEY").unwrap_or_default(),
            broker_app_secret: env::var("BROKER_APP_SECRET").unwrap_or_default(),
            broker_account_no: env::var("BROKER_ACCOUNT_NO").unwrap_or_default(),
            broker_base_url: env::var("BROKER_BASE_URL")
                .unwrap_or_else(|_| default_base.to_string()),
            broker_ws_url: env::var("BROKER_WS_URL").unwrap_or_else(|_| default_ws.to_string()),
            exchange_code: env::var("EXCHANGE_CODE").unwrap_or_else(|_| "NASD".to_string()),

            quote_api_base_url: env::var("QUOTE_API_BASE_URL")
                .unwrap_or_else(|_| "https://financialmodelingprep.com/stable".to_string()),
            quote_api_key: env::var("QUOTE_API_KEY").unwrap_or_default(),

            rss_feed_url: env::var("RSS_FEED_URL").unwrap_or_default(),
            news_poll_seconds: Self::parse_u64("NEWS_POLL_SECONDS", 60)?,
            news_dedup_capacity: Self::parse_usize("NEWS_DEDUP_CAPACITY", 500)?,

            pending_score_threshold: Self::parse_f64("PENDING_SCORE_THRESHOLD", 65.0)?,
            execute_score_threshold: Self::parse_f64("EXECUTE_SCORE_THRESHOLD", 80.0)?,
            position_fraction: Self::parse_decimal("POSITION_FRACTION", "0.10")?,
            max_position_usd: Self::parse_decimal("MAX_POSITION_USD", "1000")?,

            stop_loss_percent: Self::parse_decimal("STOP_LOSS_PERCENT", "2.0")?,
            take_profit_percent: Self::parse_decimal("TAKE_PROFIT_PERCENT", "5.0")?,

            balance_ttl_seconds: Self::parse_u64("BALANCE_TTL_SECONDS", 60)?,
            positions_ttl_seconds: Self::parse_u64("POSITIONS_TTL_SECONDS", 30)?,
            monitor_interval_seconds: Self::parse_u64("MONITOR_INTERVAL_SECONDS", 5)?,
            market_poll_seconds: Self::parse_u64("MARKET_POLL_SECONDS", 30)?,
            history_sync_seconds: Self::parse_u64("HISTORY_SYNC_SECONDS", 600)?,

            simulation_mode: Self::parse_bool("SIMULATION_MODE", false),
            mock_initial_cash: Self::parse_decimal("MOCK_INITIAL_CASH", "100000")?,

            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://newstrade.db".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Live mode needs real credentials; mock mode runs without any.
    fn validate(&self) -> Result<()> {
        if self.mode == Mode::Live {
            if self.broker_app_key.is_empty() || self.broker_app_secret.is_empty() {
                anyhow::bail!("BROKER_APP_KEY and BROKER_APP_SECRET are required in live mode");
            }
            if self.broker_account_no.is_empty() {
                anyhow::bail!("BROKER_ACCOUNT_NO is required in live mode");
            }
            if self.quote_api_key.is_empty() {
                anyhow::bail!("QUOTE_API_KEY is required in live mode");
            }
            if self.rss_feed_url.is_empty() {
                anyhow::bail!("RSS_FEED_URL is required in live mode");
            }
        }
        if self.execute_score_threshold < self.pending_score_threshold {
            anyhow::bail!(
                "EXECUTE_SCORE_THRESHOLD ({}) must be >= PENDING_SCORE_THRESHOLD ({})",
                self.execute_score_threshold,
                self.pending_score_threshold
            );
        }
        Ok(())
    }

    fn parse_f64(key: &str, default: f64) -> Result<f64> {
        env::var(key)
            .unwrap_or_else(|_| default.to_string())
            .parse::<f64>()
            .context(format!("Failed to parse {}", key))
    }

    fn parse_u64(key: &str, default: u64) -> Result<u64> {
        env::var(key)
            .unwrap_or_else(|_| default.to_string())
            .parse::<u64>()
            .context(format!("Failed to parse {}", key))
    }

    fn parse_usize(key: &str, default: usize) -> Result<usize> {
        env::var(key)
            .unwrap_or_else(|_| default.to_string())
            .parse::<usize>()
            .context(format!("Failed to parse {}", key))
    }

    fn parse_decimal(key: &str, default: &str) -> Result<Decimal> {
        env::var(key)
            .unwrap_or_else(|_| default.to_string())
            .parse::<Decimal>()
            .context(format!("Failed to parse {}", key))
    }

    fn parse_bool(key: &str, default: bool) -> bool {
        env::var(key)
            .unwrap_or_else(|_| default.to_string())
            .parse::<bool>()
            .unwrap_or(default)
    }
}
