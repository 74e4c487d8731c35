//! Net exposure per symbol.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::OrderSide;

/// PositionSide is the direction of a net exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens (or adds to) a position on this side.
    pub fn entry_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position on this side.
    pub fn exit_side(self) -> OrderSide {
        self.entry_side().opposite()
    }

    /// +1 for long, -1 for short. Multiplies a price move into PnL.
    pub fn sign(self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl From<OrderSide> for PositionSide {
    fn from(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

impl FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "long" | "buy" => Ok(PositionSide::Long),
            "short" | "sell" => Ok(PositionSide::Short),
            _ => Err(format!("unknown position side: {}", s)),
        }
    }
}

/// Position is the local mirror of the exchange's net exposure in one symbol.
///
/// Zero-quantity positions are never stored; closing a position deletes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// USD value of the position at its entry price.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    /// Returns true if `other` describes a materially different exposure.
    pub fn drifted_from(&self, other: &Position, tolerance: Decimal) -> bool {
        self.side != other.side
            || (self.quantity - other.quantity).abs() > tolerance
            || self.entry_price != other.entry_price
    }
}
