//! Configuration loading and validation for the trading control plane.
//!
//! Uses serde_yaml to load YAML configuration files with support for
//! environment variable overrides for credentials and the kill switch token.

mod app;
mod circuit_breaker;
pub(crate) mod duration;
mod error;
mod exchange;
mod execution;
mod kill_switch;
mod loops;
mod protection;
mod reconciliation;
mod risk;
mod storage;

pub use app::AppConfig;
pub use circuit_breaker::CircuitBreakerConfig;
pub use error::ConfigError;
pub use exchange::ExchangeConfig;
pub use execution::{ExecutionConfig, RetryConfig, RetryPolicy};
pub use kill_switch::KillSwitchConfig;
pub use loops::LoopConfig;
pub use protection::ProtectionConfig;
pub use reconciliation::ReconciliationConfig;
pub use risk::{DEFAULT_CRITICAL_MULTIPLIER, LimitConfig, RiskConfig};
pub use storage::StorageConfig;

use serde::Deserialize;
use std::{env, fs};
use tracing::warn;

/// Env var holding the kill switch reset token.
pub const KILL_SWITCH_TOKEN_ENV: &str = "KILL_SWITCH_RESET_TOKEN";

/// Root configuration structure.
///
/// Required sections: app, exchange, symbols.
/// Every other section falls back to its defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub exchange: ExchangeConfig,
    /// Symbols the bot is allowed to trade (e.g., "BTCUSDT").
    pub symbols: Vec<String>,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub kill_switch: KillSwitchConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bot: LoopConfig,
}

impl Config {
    /// Load configuration from a YAML file at the given path.
    ///
    /// First loads environment variables from `.env` (if present), then the
    /// YAML config, then secrets from the environment:
    /// - `{EXCHANGE}_API_KEY`, `{EXCHANGE}_API_SECRET`
    /// - `KILL_SWITCH_RESET_TOKEN`
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;

        config.load_secrets_from_env();
        config.validate()?;

        Ok(config)
    }

    fn load_secrets_from_env(&mut self) {
        let env_prefix = self.exchange.name.to_uppercase();
        self.exchange.api_key = env::var(format!("{}_API_KEY", env_prefix)).unwrap_or_default();
        self.exchange.api_secret =
            env::var(format!("{}_API_SECRET", env_prefix)).unwrap_or_default();
        self.kill_switch.reset_token = env::var(KILL_SWITCH_TOKEN_ENV).unwrap_or_default();
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app.name.is_empty() {
            return Err(ConfigError::Validation("app.name is required".into()));
        }

        if self.symbols.is_empty() {
            return Err(ConfigError::Validation(
                "at least one symbol is required".into(),
            ));
        }

        if !self.app.is_development()
            && (self.exchange.api_key.is_empty() || self.exchange.api_secret.is_empty())
        {
            let prefix = self.exchange.name.to_uppercase();
            return Err(ConfigError::Validation(format!(
                "exchange {}: API credentials not found (set {}_API_KEY and {}_API_SECRET env vars)",
                self.exchange.name, prefix, prefix
            )));
        }

        self.risk.validate()?;
        self.protection.validate()?;

        if self.circuit_breaker.atr_window == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.atr_window must be positive".into(),
            ));
        }
        if self.circuit_breaker.max_consecutive_losses == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.max_consecutive_losses must be positive".into(),
            ));
        }

        if !self.protection.native_enabled && !self.protection.virtual_enabled {
            warn!("both native and virtual protection are disabled; every entry will halt trading");
        }
        if self.kill_switch.reset_token.is_empty() {
            warn!("{} not set; the kill switch cannot be reset", KILL_SWITCH_TOKEN_ENV);
        }

        Ok(())
    }
}
