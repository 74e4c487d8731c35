//! Exchange connection configuration.

use serde::Deserialize;
use std::time::Duration;

use super::duration;
use crate::domain::Category;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for the exchange connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Exchange identifier; also the prefix of the credential env vars.
    #[serde(default = "default_name")]
    pub name: String,
    /// Use the exchange testnet endpoint.
    #[serde(default)]
    pub testnet: bool,
    /// API key (loaded from `{NAME}_API_KEY`).
    #[serde(skip)]
    pub api_key: String,
    /// API secret (loaded from `{NAME}_API_SECRET`).
    #[serde(skip)]
    pub api_secret: String,
    /// Product line traded by the bot.
    #[serde(default = "default_category")]
    pub category: Category,
    /// Settlement coin used to list orders and positions.
    #[serde(default = "default_settle_coin")]
    pub settle_coin: String,
    /// Wallet account type queried for balance.
    #[serde(default = "default_account_type")]
    pub account_type: String,
    /// Receive window for signed requests in milliseconds.
    pub recv_window: Option<i64>,
    /// Upper bound on a single HTTP round trip (default: 10s).
    #[serde(default, with = "duration")]
    pub request_timeout: Duration,
    /// Maximum API requests per minute.
    pub rate_limit: Option<i64>,
}

impl ExchangeConfig {
    pub fn request_timeout(&self) -> Duration {
        duration::or_default(self.request_timeout, DEFAULT_REQUEST_TIMEOUT)
    }
}

fn default_name() -> String {
    "bybit".to_string()
}

fn default_category() -> Category {
    Category::Linear
}

fn default_settle_coin() -> String {
    "USDT".to_string()
}

fn default_account_type() -> String {
    "UNIFIED".to_string()
}
