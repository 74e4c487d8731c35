//! Upstream inputs produced outside the control plane.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::PositionSide;

/// Signal is a trade proposal produced by strategy logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: PositionSide,
    pub entry_price: Decimal,
    /// Invalidation price of the idea; drives position sizing.
    pub stop_price: Decimal,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    pub strategy_id: String,
    pub confidence: f64,
}

impl Signal {
    /// Distance between entry and stop; zero when the signal is degenerate.
    pub fn stop_distance(&self) -> Decimal {
        (self.entry_price - self.stop_price).abs()
    }
}

/// MarketUpdate carries the latest price and ATR from the feature pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketUpdate {
    pub symbol: String,
    pub price: Decimal,
    #[serde(default)]
    pub atr: Option<Decimal>,
}
