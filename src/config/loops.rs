//! Decision and monitor loop timing.

use serde::Deserialize;
use std::time::Duration;

use super::duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_RISK_MONITOR_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(300);

/// Loop intervals for the bot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoopConfig {
    /// Kill switch / breaker / virtual level poll (default: 2s).
    #[serde(default, with = "duration")]
    pub poll_interval: Duration,
    /// Background risk evaluation (default: 10s).
    #[serde(default, with = "duration")]
    pub risk_monitor_interval: Duration,
    /// How long stop() waits for each background task (default: 10s).
    #[serde(default, with = "duration")]
    pub shutdown_timeout: Duration,
    /// Statistics log interval (default: 5m).
    #[serde(default, with = "duration")]
    pub stats_interval: Duration,
}

impl LoopConfig {
    pub fn poll_interval(&self) -> Duration {
        duration::or_default(self.poll_interval, DEFAULT_POLL_INTERVAL)
    }

    pub fn risk_monitor_interval(&self) -> Duration {
        duration::or_default(self.risk_monitor_interval, DEFAULT_RISK_MONITOR_INTERVAL)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        duration::or_default(self.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn stats_interval(&self) -> Duration {
        duration::or_default(self.stats_interval, DEFAULT_STATS_INTERVAL)
    }
}
