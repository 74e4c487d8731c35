//! Risk decision engine: a fixed battery of limit checks over a snapshot,
//! folded into ALLOW / DENY / STOP.

mod checks;
mod engine;
mod sizing;

pub use checks::{CheckKind, CheckResult, Severity};
pub use engine::{Decision, RiskAssessment, RiskEngine, RiskStateSnapshot};
pub use sizing::{SizingError, position_size};
