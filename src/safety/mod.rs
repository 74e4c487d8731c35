//! Trading halts: the in-memory circuit breaker and the persisted kill switch.

mod circuit_breaker;
mod kill_switch;

pub use circuit_breaker::{BreakerEvent, BreakerState, CircuitBreaker, RecoveryOutcome};
pub use kill_switch::{
    ACTIVATION_KEY, AUDIT_COMPONENT, ActivateOutcome, KillSwitch, KillSwitchRecord, ResetOutcome,
};
