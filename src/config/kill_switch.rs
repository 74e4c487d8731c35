//! Kill switch configuration.

use serde::Deserialize;

/// Emergency stop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct KillSwitchConfig {
    /// Token required to reset an active switch (loaded from
    /// `KILL_SWITCH_RESET_TOKEN`). Empty disables reset.
    #[serde(skip)]
    pub reset_token: String,
    /// Cancel every open order when the switch is activated.
    #[serde(default = "default_true")]
    pub cancel_orders_on_activate: bool,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            reset_token: String::new(),
            cancel_orders_on_activate: true,
        }
    }
}

fn default_true() -> bool {
    true
}
