//! Risk decision configuration.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

use super::ConfigError;

/// Breaches beyond this multiple of the limit are critical unless a check
/// configures its own multiplier.
pub const DEFAULT_CRITICAL_MULTIPLIER: Decimal = Decimal::TWO;

/// Risk decision limits, one entry per check.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Maximum account leverage (open + proposed notional over balance).
    #[serde(default = "default_leverage")]
    pub leverage: LimitConfig,
    /// Maximum total notional in quote currency.
    #[serde(default = "default_notional")]
    pub notional: LimitConfig,
    /// Maximum realized loss today as a percent of balance.
    #[serde(default = "default_daily_loss")]
    pub daily_loss_percent: LimitConfig,
    /// Maximum decline from session peak equity, in percent.
    #[serde(default = "default_drawdown")]
    pub drawdown_percent: LimitConfig,
    /// Balance percent put at risk between entry and stop (position sizing).
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade_percent: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            leverage: default_leverage(),
            notional: default_notional(),
            daily_loss_percent: default_daily_loss(),
            drawdown_percent: default_drawdown(),
            risk_per_trade_percent: default_risk_per_trade(),
        }
    }
}

/// One enable/disable-able limit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub limit: Decimal,
    /// A breach above `limit * critical_multiplier` is critical.
    /// A multiplier of 1 makes every breach critical.
    #[serde(default = "default_multiplier")]
    pub critical_multiplier: Decimal,
}

impl LimitConfig {
    pub fn new(limit: Decimal, critical_multiplier: Decimal) -> Self {
        Self {
            enabled: true,
            limit,
            critical_multiplier,
        }
    }
}

impl RiskConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (name, check) in self.checks() {
            if check.limit <= Decimal::ZERO {
                return Err(ConfigError::Validation(format!(
                    "risk.{}.limit must be positive",
                    name
                )));
            }
            if check.critical_multiplier < Decimal::ONE {
                return Err(ConfigError::Validation(format!(
                    "risk.{}.critical_multiplier must be >= 1",
                    name
                )));
            }
        }
        if self.risk_per_trade_percent <= Decimal::ZERO
            || self.risk_per_trade_percent > Decimal::ONE_HUNDRED
        {
            return Err(ConfigError::Validation(
                "risk.risk_per_trade_percent must be in (0, 100]".into(),
            ));
        }
        Ok(())
    }

    /// Applies `risk.<check>.<field>` overrides read from the persisted
    /// key-value store. Unknown keys are rejected so typos surface.
    pub fn apply_override(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let err = |reason: &str| ConfigError::Override {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let path = key.strip_prefix("risk.").ok_or_else(|| err("not a risk key"))?;
        if path == "risk_per_trade_percent" {
            self.risk_per_trade_percent =
                Decimal::from_str(value).map_err(|e| err(&e.to_string()))?;
            return Ok(());
        }

        let (check, field) = path.split_once('.').ok_or_else(|| err("expected risk.<check>.<field>"))?;
        let target = match check {
            "leverage" => &mut self.leverage,
            "notional" => &mut self.notional,
            "daily_loss_percent" => &mut self.daily_loss_percent,
            "drawdown_percent" => &mut self.drawdown_percent,
            _ => return Err(err("unknown check")),
        };

        match field {
            "enabled" => target.enabled = value.parse().map_err(|_| err("expected true/false"))?,
            "limit" => target.limit = Decimal::from_str(value).map_err(|e| err(&e.to_string()))?,
            "critical_multiplier" => {
                target.critical_multiplier =
                    Decimal::from_str(value).map_err(|e| err(&e.to_string()))?
            }
            _ => return Err(err("unknown field")),
        }
        Ok(())
    }

    fn checks(&self) -> [(&'static str, &LimitConfig); 4] {
        [
            ("leverage", &self.leverage),
            ("notional", &self.notional),
            ("daily_loss_percent", &self.daily_loss_percent),
            ("drawdown_percent", &self.drawdown_percent),
        ]
    }
}

fn default_true() -> bool {
    true
}

fn default_multiplier() -> Decimal {
    DEFAULT_CRITICAL_MULTIPLIER
}

fn default_leverage() -> LimitConfig {
    LimitConfig::new(Decimal::TEN, DEFAULT_CRITICAL_MULTIPLIER)
}

fn default_notional() -> LimitConfig {
    LimitConfig::new(Decimal::from(100_000), DEFAULT_CRITICAL_MULTIPLIER)
}

fn default_daily_loss() -> LimitConfig {
    // Any breach of the daily loss budget halts trading.
    LimitConfig::new(Decimal::from(5), Decimal::ONE)
}

fn default_drawdown() -> LimitConfig {
    LimitConfig::new(Decimal::TEN, Decimal::new(15, 1))
}

fn default_risk_per_trade() -> Decimal {
    Decimal::ONE
}
