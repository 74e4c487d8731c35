//! Bot configuration.

use crate::config::Config;

/// Bot construction options.
pub struct BotConfig {
    /// Application configuration.
    pub app_config: Config,
    /// Application version, logged at startup.
    pub version: String,
}
