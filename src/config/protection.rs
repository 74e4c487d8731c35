//! Protective stop-loss / take-profit configuration.

use rust_decimal::Decimal;
use serde::Deserialize;

use super::ConfigError;

/// Stop-loss and take-profit placement settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtectionConfig {
    /// Stop distance in ATRs.
    #[serde(default = "default_sl_multiplier")]
    pub sl_multiplier: Decimal,
    /// Take-profit distance in ATRs.
    #[serde(default = "default_tp_multiplier")]
    pub tp_multiplier: Decimal,
    /// Stop distance as a percent of entry when no ATR is available.
    #[serde(default = "default_sl_percent")]
    pub sl_percent_fallback: Decimal,
    /// Take-profit distance as a percent of entry when no ATR is available.
    #[serde(default = "default_tp_percent")]
    pub tp_percent_fallback: Decimal,
    /// Floor for both distances, in price units.
    #[serde(default = "default_min_distance")]
    pub min_distance: Decimal,
    /// Trailing distance in ATRs.
    #[serde(default = "default_trail_multiplier")]
    pub trail_multiplier: Decimal,
    #[serde(default = "default_true")]
    pub trailing_enabled: bool,
    /// Try exchange-native stops first.
    #[serde(default = "default_true")]
    pub native_enabled: bool,
    /// Monitor levels locally when native stops are unavailable.
    #[serde(default = "default_true")]
    pub virtual_enabled: bool,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            sl_multiplier: default_sl_multiplier(),
            tp_multiplier: default_tp_multiplier(),
            sl_percent_fallback: default_sl_percent(),
            tp_percent_fallback: default_tp_percent(),
            min_distance: default_min_distance(),
            trail_multiplier: default_trail_multiplier(),
            trailing_enabled: true,
            native_enabled: true,
            virtual_enabled: true,
        }
    }
}

impl ProtectionConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.sl_multiplier <= Decimal::ZERO
            || self.tp_multiplier <= Decimal::ZERO
            || self.trail_multiplier <= Decimal::ZERO
        {
            return Err(ConfigError::Validation(
                "protection multipliers must be positive".into(),
            ));
        }
        for (name, pct) in [
            ("sl_percent_fallback", self.sl_percent_fallback),
            ("tp_percent_fallback", self.tp_percent_fallback),
        ] {
            if pct <= Decimal::ZERO || pct >= Decimal::ONE_HUNDRED {
                return Err(ConfigError::Validation(format!(
                    "protection.{} must be in (0, 100)",
                    name
                )));
            }
        }
        if self.min_distance < Decimal::ZERO {
            return Err(ConfigError::Validation(
                "protection.min_distance must not be negative".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_sl_multiplier() -> Decimal {
    Decimal::new(15, 1)
}

fn default_tp_multiplier() -> Decimal {
    Decimal::TWO
}

fn default_sl_percent() -> Decimal {
    Decimal::TWO
}

fn default_tp_percent() -> Decimal {
    Decimal::from(3)
}

fn default_min_distance() -> Decimal {
    Decimal::new(1, 2)
}

fn default_trail_multiplier() -> Decimal {
    Decimal::ONE
}
