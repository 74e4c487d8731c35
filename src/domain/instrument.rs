//! Instrument trading rules (tick size, lot step, minimums).

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// InstrumentRules are the exchange-imposed constraints for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRules {
    pub symbol: String,
    pub tick_size: Decimal,
    pub qty_step: Decimal,
    pub min_order_qty: Decimal,
    /// Minimum order value in quote currency; zero when not enforced.
    pub min_notional: Decimal,
}

impl InstrumentRules {
    /// Rounds a price to the nearest tick.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        round_to_step(price, self.tick_size, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Rounds a quantity down to the lot step so we never over-size.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        round_to_step(qty, self.qty_step, RoundingStrategy::ToZero)
    }

    /// Validates an order against the minimum size and value.
    pub fn validate(&self, qty: Decimal, price: Decimal) -> Result<(), String> {
        if qty <= Decimal::ZERO {
            return Err(format!("{}: quantity {} must be positive", self.symbol, qty));
        }
        if qty < self.min_order_qty {
            return Err(format!(
                "{}: quantity {} below minimum {}",
                self.symbol, qty, self.min_order_qty
            ));
        }
        let notional = qty * price;
        if !self.min_notional.is_zero() && notional < self.min_notional {
            return Err(format!(
                "{}: notional {} below minimum {}",
                self.symbol, notional, self.min_notional
            ));
        }
        Ok(())
    }
}

fn round_to_step(value: Decimal, step: Decimal, strategy: RoundingStrategy) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let steps = (value / step).round_dp_with_strategy(0, strategy);
    (steps * step).normalize()
}
