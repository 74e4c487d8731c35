//! Domain models for orders, fills, positions and upstream signals.

mod instrument;
mod order;
mod position;
mod signal;

pub use instrument::InstrumentRules;
pub use order::{Category, Execution, Order, OrderSide, OrderStatus, OrderType};
pub use position::{Position, PositionSide};
pub use signal::{MarketUpdate, Signal};
