//! Circuit breaker configuration.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

use super::duration;

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30 * 60);
const DEFAULT_LOSS_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Volatility and loss-streak halt settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of ATR samples in the rolling mean.
    #[serde(default = "default_atr_window")]
    pub atr_window: usize,
    /// Samples required before the spike check is armed.
    #[serde(default = "default_min_atr_samples")]
    pub min_atr_samples: usize,
    /// Spike when ATR > mean * multiplier.
    #[serde(default = "default_volatility_multiplier")]
    pub volatility_multiplier: Option<Decimal>,
    /// Spike when ATR > mean * (1 + percent / 100).
    #[serde(default)]
    pub volatility_percent: Option<Decimal>,
    /// Time a volatility halt lasts before recovery is allowed (default: 30m).
    #[serde(default, with = "duration")]
    pub cooldown: Duration,
    /// Consecutive losing trades that trip the kill state.
    #[serde(default = "default_max_losses")]
    pub max_consecutive_losses: usize,
    /// Window the consecutive losses must fall inside (default: 1h).
    #[serde(default, with = "duration")]
    pub loss_window: Duration,
    /// Realized daily loss, in percent of equity, that trips the kill state.
    #[serde(default = "default_daily_loss_percent")]
    pub max_daily_loss_percent: Decimal,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            atr_window: default_atr_window(),
            min_atr_samples: default_min_atr_samples(),
            volatility_multiplier: default_volatility_multiplier(),
            volatility_percent: None,
            cooldown: DEFAULT_COOLDOWN,
            max_consecutive_losses: default_max_losses(),
            loss_window: DEFAULT_LOSS_WINDOW,
            max_daily_loss_percent: default_daily_loss_percent(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        duration::or_default(self.cooldown, DEFAULT_COOLDOWN)
    }

    pub fn loss_window(&self) -> Duration {
        duration::or_default(self.loss_window, DEFAULT_LOSS_WINDOW)
    }
}

fn default_atr_window() -> usize {
    20
}

fn default_min_atr_samples() -> usize {
    5
}

fn default_volatility_multiplier() -> Option<Decimal> {
    Some(Decimal::TWO)
}

fn default_max_losses() -> usize {
    3
}

fn default_daily_loss_percent() -> Decimal {
    Decimal::from(5)
}
