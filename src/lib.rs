//! Safety and execution control plane for an automated trading bot.
//!
//! Strategies emit [`domain::Signal`]s; the [`bot::Bot`] sizes them, asks the
//! risk engine, places idempotent orders, attaches protective levels and keeps
//! local state reconciled with the exchange. A circuit breaker and a persisted
//! kill switch halt new entries when something goes wrong.

pub mod bot;
pub mod config;
pub mod domain;
pub mod exchanges;
pub mod orders;
pub mod protection;
pub mod reconciliation;
pub mod risk;
pub mod safety;
pub mod storage;

#[cfg(test)]
mod testutil;
