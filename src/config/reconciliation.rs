//! Reconciliation configuration.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

use super::duration;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_EXECUTION_LOOKBACK: Duration = Duration::from_secs(24 * 3600);

/// Settings for syncing local state with the exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Time between periodic passes (default: 30s).
    #[serde(default, with = "duration")]
    pub interval: Duration,
    /// Run one pass before the decision loop starts.
    #[serde(default = "default_true")]
    pub on_startup: bool,
    /// Size differences at or below this are not drift.
    #[serde(default = "default_tolerance")]
    pub position_tolerance: Decimal,
    /// Consecutive passes with position drift before escalating.
    #[serde(default = "default_escalation_passes")]
    pub drift_escalation_passes: u32,
    /// How far back fills are fetched (default: 24h).
    #[serde(default, with = "duration")]
    pub execution_lookback: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_INTERVAL,
            on_startup: true,
            position_tolerance: default_tolerance(),
            drift_escalation_passes: default_escalation_passes(),
            execution_lookback: DEFAULT_EXECUTION_LOOKBACK,
        }
    }
}

impl ReconciliationConfig {
    pub fn interval(&self) -> Duration {
        duration::or_default(self.interval, DEFAULT_INTERVAL)
    }

    pub fn execution_lookback(&self) -> Duration {
        duration::or_default(self.execution_lookback, DEFAULT_EXECUTION_LOOKBACK)
    }
}

fn default_true() -> bool {
    true
}

fn default_tolerance() -> Decimal {
    Decimal::new(1, 8)
}

fn default_escalation_passes() -> u32 {
    3
}
