//! Messages consumed by the decision loop and what became of them.

use serde::{Deserialize, Serialize};

use crate::domain::{MarketUpdate, Signal};
use crate::protection::ProtectionMode;
use crate::risk::Decision;

/// One upstream message, newline-delimited JSON on stdin:
///
/// ```json
/// {"type":"market","symbol":"BTCUSDT","price":"30100","atr":"480"}
/// {"type":"signal","symbol":"BTCUSDT","direction":"long","entry_price":"30000","stop_price":"29500","strategy_id":"breakout","confidence":0.7}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotInput {
    Signal(Signal),
    Market(MarketUpdate),
}

/// What the decision loop did with a signal.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    /// Entry placed. `protection` is `None` when the position is unprotected
    /// and the breaker has been tripped.
    Submitted {
        order_id: String,
        quantity: rust_decimal::Decimal,
        protection: Option<ProtectionMode>,
    },
    /// Risk engine blocked this trade.
    Denied(Decision),
    /// Risk engine halted trading; the kill switch is now active.
    Stopped(Decision),
    /// Not evaluated or not placed, with the reason.
    Skipped(String),
}
