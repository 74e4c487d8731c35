//! Protective stop-loss / take-profit levels: calculation, native or
//! virtual enforcement, trailing and partial-fill handling.

mod levels;
mod manager;

pub use levels::{
    Distances, ProtectionMode, ProtectiveLevels, TriggerKind, calculate_levels, distances,
    trail_distance,
};
pub use manager::{ProtectionError, ProtectionManager, TrailingUpdate, Trigger};

#[cfg(test)]
mod tests;
