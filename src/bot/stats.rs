//! Runtime statistics for the bot.

use rust_decimal::Decimal;

/// Runtime statistics for the bot.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub signals_received: u64,
    pub signals_allowed: u64,
    pub signals_denied: u64,
    pub signals_stopped: u64,
    pub signals_skipped: u64,
    pub orders_submitted: u64,
    pub orders_failed: u64,
    pub exits_submitted: u64,
    pub reconciliation_passes: u64,
    pub reconciliation_corrections: u64,
    /// Realized PnL of trades closed while running.
    pub realized_pnl: Decimal,
}
