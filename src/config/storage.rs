//! Storage configuration.

use serde::Deserialize;

/// Local persisted store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_path")]
    pub path: String,
    /// Maximum number of pooled connections.
    pub max_connections: Option<u32>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            max_connections: None,
        }
    }
}

fn default_path() -> String {
    "trade_guard.db".to_string()
}
