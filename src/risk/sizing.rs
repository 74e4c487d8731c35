//! Fixed-fractional position sizing.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::InstrumentRules;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingError {
    #[error("stop distance is zero (entry {entry}, stop {stop})")]
    ZeroStopDistance { entry: Decimal, stop: Decimal },

    #[error("balance {0} is not positive")]
    NoBalance(Decimal),

    #[error("{0}")]
    InstrumentRule(String),
}

/// Quantity that loses `risk_percent` of `balance` if price moves from
/// `entry` to `stop`, rounded down to the lot step and checked against the
/// instrument minimums.
pub fn position_size(
    balance: Decimal,
    risk_percent: Decimal,
    entry: Decimal,
    stop: Decimal,
    rules: &InstrumentRules,
) -> Result<Decimal, SizingError> {
    if balance <= Decimal::ZERO {
        return Err(SizingError::NoBalance(balance));
    }
    let distance = (entry - stop).abs();
    if distance.is_zero() {
        return Err(SizingError::ZeroStopDistance { entry, stop });
    }

    let risk_amount = balance * risk_percent / Decimal::ONE_HUNDRED;
    let qty = rules.round_qty(risk_amount / distance);
    rules.validate(qty, entry).map_err(SizingError::InstrumentRule)?;
    Ok(qty)
}
