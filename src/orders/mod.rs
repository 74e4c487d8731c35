//! Idempotent order placement and cancellation.

mod keys;
mod manager;
mod retry;

pub use keys::{exit_key, new_key};
pub use manager::{OrderError, OrderManager, OrderRef, SubmitRequest};
pub use retry::{RetryError, with_retry};
