// Runtime settings: built-in defaults, optional TOML file, TRENDBOT__* env overrides
use crate::api::coinbase::COINBASE_API_BASE;
use crate::execution::{MachineSettings, RetryPolicy};
use crate::models::Product;
use crate::risk::StopLoss;
use ::config::{Config, Environment, File, FileFormat};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "trendbot.toml";
pub const ENV_PREFIX: &str = "TRENDBOT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("invalid product: {0}")]
    InvalidProduct(String),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub trading: TradingSettings,
    pub schedule: ScheduleSettings,
    pub retry: RetrySettings,
    pub exchange: ExchangeSettings,
    pub feed: FeedSettings,
    pub supervisor: SupervisorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingSettings {
    pub product_id: String,
    /// Consecutive ticks the signal must exceed before acting
    pub threshold: u32,
    pub take_profit_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub poll_interval_ms: u64,
    /// Expiry of the forced exit sell
    pub exit_cancel_after: String,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            product_id: "BTC-USD".to_string(),
            threshold: 20,
            take_profit_pct: dec!(0.005),
            stop_loss_pct: dec!(0.01),
            poll_interval_ms: 2_000,
            exit_cancel_after: "min".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub price_refresh_ms: u64,
    pub signal_ms: u64,
    pub throttle_ms: u64,
    pub status_ms: u64,
    pub settled_report_ms: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            price_refresh_ms: 5_000,
            signal_ms: 1_000,
            throttle_ms: 1_000,
            status_ms: 2_000,
            settled_report_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
    pub jitter_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: 8,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub rest_url: String,
    pub requests_per_second: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            rest_url: COINBASE_API_BASE.to_string(),
            requests_per_second: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub redis_url: String,
    pub stream_key: String,
    pub checkpoint_key: String,
    pub block_ms: usize,
    pub batch_size: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            stream_key: "gdax_order_price_avg".to_string(),
            checkpoint_key: "trendbot:feed:checkpoint".to_string(),
            block_ms: 1_000,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_delay_ms: 10_000,
        }
    }
}

impl Settings {
    /// Load defaults, then `path` if it exists, then `TRENDBOT__SECTION__KEY` env vars
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let settings: Settings = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML document without touching the environment
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.product()?;

        let t = &self.trading;
        if t.take_profit_pct <= Decimal::ZERO {
            return Err(invalid("trading.take_profit_pct", "must be positive"));
        }
        if t.stop_loss_pct <= Decimal::ZERO || t.stop_loss_pct >= Decimal::ONE {
            return Err(invalid("trading.stop_loss_pct", "must be between 0 and 1"));
        }
        if t.poll_interval_ms == 0 {
            return Err(invalid("trading.poll_interval_ms", "must be non-zero"));
        }
        if !matches!(t.exit_cancel_after.as_str(), "min" | "hour" | "day") {
            return Err(invalid(
                "trading.exit_cancel_after",
                "expected one of min, hour, day",
            ));
        }

        let s = &self.schedule;
        for (key, value) in [
            ("schedule.price_refresh_ms", s.price_refresh_ms),
            ("schedule.signal_ms", s.signal_ms),
            ("schedule.throttle_ms", s.throttle_ms),
            ("schedule.status_ms", s.status_ms),
            ("schedule.settled_report_ms", s.settled_report_ms),
        ] {
            if value == 0 {
                return Err(invalid(key, "interval must be non-zero"));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.exchange.requests_per_second == 0 {
            return Err(invalid("exchange.requests_per_second", "must be non-zero"));
        }
        Ok(())
    }

    pub fn product(&self) -> Result<Product, ConfigError> {
        self.trading
            .product_id
            .parse()
            .map_err(ConfigError::InvalidProduct)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            max_attempts: self.retry.max_attempts,
            jitter: Duration::from_millis(self.retry.jitter_ms),
        }
    }

    pub fn machine_settings(&self) -> Result<MachineSettings, ConfigError> {
        Ok(MachineSettings {
            product: self.product()?,
            take_profit_pct: self.trading.take_profit_pct,
            poll_interval: Duration::from_millis(self.trading.poll_interval_ms),
            exit_cancel_after: self.trading.exit_cancel_after.clone(),
            retry: self.retry_policy(),
        })
    }

    pub fn stop_loss(&self) -> StopLoss {
        StopLoss::new(self.trading.stop_loss_pct)
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}
