//! Exchange integration abstractions and implementations.

pub mod bybit;
mod utils;

#[cfg(test)]
pub(crate) mod mock;

use crate::domain::{Category, Execution, InstrumentRules, Order, OrderSide, OrderType, Position};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

pub use bybit::BybitExchange;

/// Exchange errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    /// The request did not complete in time. The exchange may or may not
    /// have applied it.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// The exchange failed on its side (5xx or an internal error code).
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Insufficient balance or margin for the operation.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Request parameters violate exchange rules.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Order not found (or already terminal).
    #[error("order {0} not found")]
    OrderNotFound(String),

    /// An order with this idempotency key already exists on the exchange.
    #[error("duplicate idempotency key {0}")]
    DuplicateOrder(String),

    /// The exchange does not offer this capability for the product.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Any other rejection with the exchange's return code.
    #[error("rejected {code}: {message}")]
    Rejected { code: i64, message: String },

    /// Response could not be understood.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExchangeError {
    /// Transient errors are worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout(_)
                | ExchangeError::Connection(_)
                | ExchangeError::Server { .. }
                | ExchangeError::RateLimited(_)
        )
    }
}

/// Result type for exchange operations.
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// A new order as sent to the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub category: Category,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Required for limit orders.
    pub price: Option<Decimal>,
    /// Client-assigned key the exchange deduplicates on.
    pub idempotency_key: String,
    pub reduce_only: bool,
}

/// Exchange acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub idempotency_key: String,
}

/// Position-attached stop-loss / take-profit. A zero price clears that side;
/// `None` leaves it untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingStopRequest {
    pub category: Category,
    pub symbol: String,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Exchange trait defines the request/response contract the control plane
/// needs from a derivatives exchange.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Name returns the unique identifier of this exchange (e.g., "bybit").
    fn name(&self) -> &str;

    /// Submits a new order. Returns DuplicateOrder if the idempotency key was
    /// already used.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    /// Cancels an open order by its exchange id.
    /// Returns OrderNotFound if the order doesn't exist or is already terminal.
    async fn cancel_order(&self, category: Category, symbol: &str, order_id: &str) -> Result<()>;

    /// Cancels every open order, optionally for one symbol only.
    /// Returns the number of orders cancelled.
    async fn cancel_all_orders(&self, category: Category, symbol: Option<&str>) -> Result<usize>;

    /// Lists orders that are still working.
    async fn open_orders(&self, category: Category) -> Result<Vec<Order>>;

    /// Looks up a recent order (open or not) by its idempotency key.
    async fn order_by_key(
        &self,
        category: Category,
        symbol: &str,
        idempotency_key: &str,
    ) -> Result<Option<Order>>;

    /// Lists non-zero positions.
    async fn positions(&self, category: Category) -> Result<Vec<Position>>;

    /// Lists fills executed at or after `since`.
    async fn executions(&self, category: Category, since: DateTime<Utc>) -> Result<Vec<Execution>>;

    /// Sets or clears the native protective stop on a position.
    /// Returns Unsupported when the product has no position-attached stops.
    async fn set_trading_stop(&self, request: &TradingStopRequest) -> Result<()>;

    /// Fetches tick size, lot step and minimums for a symbol.
    async fn instrument_rules(&self, category: Category, symbol: &str) -> Result<InstrumentRules>;

    /// Returns the account equity in the settlement coin.
    async fn wallet_balance(&self) -> Result<Decimal>;

    /// Last traded price of a symbol.
    async fn last_price(&self, category: Category, symbol: &str) -> Result<Decimal>;
}
