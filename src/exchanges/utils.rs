//! Common parsing helpers for exchange payloads.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::{ExchangeError, Result};
use crate::domain::{OrderSide, OrderStatus, OrderType};

/// Parses a decimal string; empty strings read as zero. Anything else that
/// is not a number is an error, never a silent zero.
pub fn parse_decimal(value: &str) -> Result<Decimal> {
    if value.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(value)
        .map_err(|e| ExchangeError::Internal(format!("malformed decimal {:?}: {}", value, e)))
}

/// Parses a decimal string where empty or zero means absent.
pub fn parse_optional_decimal(value: &str) -> Result<Option<Decimal>> {
    let d = parse_decimal(value)?;
    Ok(if d.is_zero() { None } else { Some(d) })
}

/// Parses a millisecond timestamp string.
pub fn parse_millis(value: &str) -> DateTime<Utc> {
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

/// Parses order side from string.
pub fn parse_order_side(side: &str) -> Option<OrderSide> {
    match side.to_uppercase().as_str() {
        "BUY" => Some(OrderSide::Buy),
        "SELL" => Some(OrderSide::Sell),
        _ => None,
    }
}

/// Formats an order side the way the exchange expects ("Buy"/"Sell").
pub fn format_order_side(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "Buy",
        OrderSide::Sell => "Sell",
    }
}

/// Parses order type from string.
pub fn parse_order_type(order_type: &str) -> OrderType {
    match order_type.to_uppercase().as_str() {
        "MARKET" => OrderType::Market,
        _ => OrderType::Limit,
    }
}

pub fn format_order_type(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Limit => "Limit",
        OrderType::Market => "Market",
    }
}

/// Maps exchange order states to OrderStatus.
pub fn parse_order_status(state: &str) -> OrderStatus {
    match state {
        "New" | "Untriggered" | "Created" | "Triggered" => OrderStatus::New,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Rejected" => OrderStatus::Rejected,
        // Cancelled, PartiallyFilledCanceled, Deactivated
        _ => OrderStatus::Cancelled,
    }
}
