//! Background synchronization of local orders, fills and positions against
//! the exchange, which is always authoritative.

mod service;

pub use service::{PassOutcome, ReconciliationReport, ReconciliationService};

#[cfg(test)]
mod tests;
