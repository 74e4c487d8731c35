//! Stop-loss / take-profit level math.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::config::ProtectionConfig;
use crate::domain::PositionSide;

/// How a position's levels are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionMode {
    /// Calculated but not yet placed.
    Pending,
    /// Attached to the position on the exchange.
    Native,
    /// Watched locally against the price feed.
    Virtual,
}

impl fmt::Display for ProtectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionMode::Pending => write!(f, "pending"),
            ProtectionMode::Native => write!(f, "native"),
            ProtectionMode::Virtual => write!(f, "virtual"),
        }
    }
}

impl FromStr for ProtectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProtectionMode::Pending),
            "native" => Ok(ProtectionMode::Native),
            "virtual" => Ok(ProtectionMode::Virtual),
            _ => Err(format!("unknown protection mode: {}", s)),
        }
    }
}

/// Which protective level fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    StopLoss,
    TakeProfit,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::StopLoss => "stop_loss",
            TriggerKind::TakeProfit => "take_profit",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ProtectiveLevels is the SL/TP state of one open position.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectiveLevels {
    pub position_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    /// Quantity still protected; shrinks on partial fills.
    pub quantity: Decimal,
    /// ATR the distances were derived from, if any.
    pub atr: Option<Decimal>,
    pub stop_price: Decimal,
    pub take_profit_price: Decimal,
    pub sl_hit: bool,
    pub tp_hit: bool,
    pub mode: ProtectionMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProtectiveLevels {
    /// Returns the level breached at `price`, skipping sides that already fired.
    /// Stop-loss wins when both would fire.
    pub fn breached_at(&self, price: Decimal) -> Option<TriggerKind> {
        let (sl_breached, tp_breached) = match self.side {
            PositionSide::Long => (price <= self.stop_price, price >= self.take_profit_price),
            PositionSide::Short => (price >= self.stop_price, price <= self.take_profit_price),
        };

        if sl_breached && !self.sl_hit {
            Some(TriggerKind::StopLoss)
        } else if tp_breached && !self.tp_hit {
            Some(TriggerKind::TakeProfit)
        } else {
            None
        }
    }

    /// True if `candidate` is tighter than the current stop.
    pub fn is_tighter_stop(&self, candidate: Decimal) -> bool {
        match self.side {
            PositionSide::Long => candidate > self.stop_price,
            PositionSide::Short => candidate < self.stop_price,
        }
    }
}

/// Stop and target distances from entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distances {
    pub stop: Decimal,
    pub take_profit: Decimal,
}

/// Derives SL/TP distances from ATR, or from the percent fallback when ATR
/// is missing or not positive. Both are floored at `min_distance`.
pub fn distances(config: &ProtectionConfig, entry_price: Decimal, atr: Option<Decimal>) -> Distances {
    let (stop, take_profit) = match atr.filter(|a| *a > Decimal::ZERO) {
        Some(atr) => (atr * config.sl_multiplier, atr * config.tp_multiplier),
        None => (
            entry_price * config.sl_percent_fallback / Decimal::ONE_HUNDRED,
            entry_price * config.tp_percent_fallback / Decimal::ONE_HUNDRED,
        ),
    };

    Distances {
        stop: stop.max(config.min_distance),
        take_profit: take_profit.max(config.min_distance),
    }
}

/// Trailing distance: ATR times the trail multiplier, or the stop-loss
/// percent of `price` without ATR. Floored like the entry distances.
pub fn trail_distance(config: &ProtectionConfig, price: Decimal, atr: Option<Decimal>) -> Decimal {
    let distance = match atr.filter(|a| *a > Decimal::ZERO) {
        Some(atr) => atr * config.trail_multiplier,
        None => price * config.sl_percent_fallback / Decimal::ONE_HUNDRED,
    };
    distance.max(config.min_distance)
}

/// Computes fresh levels for a position. The result is `Pending` until placed.
pub fn calculate_levels(
    config: &ProtectionConfig,
    position_id: &str,
    symbol: &str,
    side: PositionSide,
    entry_price: Decimal,
    quantity: Decimal,
    atr: Option<Decimal>,
) -> ProtectiveLevels {
    let d = distances(config, entry_price, atr);
    let sign = side.sign();
    let now = Utc::now();

    // A distance at or beyond the entry price would put the level at or
    // below zero; such a level falls back to the percent distance.
    let stop_price = positive_level(
        symbol,
        "stop_loss",
        entry_price - sign * d.stop,
        entry_price - sign * entry_price * config.sl_percent_fallback / Decimal::ONE_HUNDRED,
    );
    let take_profit_price = positive_level(
        symbol,
        "take_profit",
        entry_price + sign * d.take_profit,
        entry_price + sign * entry_price * config.tp_percent_fallback / Decimal::ONE_HUNDRED,
    );

    ProtectiveLevels {
        position_id: position_id.to_string(),
        symbol: symbol.to_string(),
        side,
        entry_price,
        quantity,
        atr: atr.filter(|a| *a > Decimal::ZERO),
        stop_price,
        take_profit_price,
        sl_hit: false,
        tp_hit: false,
        mode: ProtectionMode::Pending,
        created_at: now,
        updated_at: now,
    }
}

fn positive_level(symbol: &str, kind: &str, level: Decimal, fallback: Decimal) -> Decimal {
    if level > Decimal::ZERO {
        return level;
    }
    warn!(symbol, kind, level = %level, fallback = %fallback, "level not positive, using percent distance");
    fallback
}
