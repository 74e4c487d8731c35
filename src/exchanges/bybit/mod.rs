//! Bybit v5 exchange integration.

mod client;
mod exchange;

pub use client::{Client, ClientConfig};
pub use exchange::BybitExchange;
