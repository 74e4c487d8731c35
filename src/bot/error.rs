//! Bot error types.

use crate::config::ConfigError;
use crate::protection::ProtectionError;
use crate::storage::StorageError;

/// Bot error type.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("bot is already running")]
    AlreadyRunning,
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("protection error: {0}")]
    Protection(String),
    #[error("reconciliation could not use the store: {0}")]
    Reconciliation(String),
}

impl BotError {
    /// The local store is unusable; trading must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::Storage(_) | BotError::Reconciliation(_))
    }
}

impl From<ProtectionError> for BotError {
    fn from(err: ProtectionError) -> Self {
        match err {
            ProtectionError::Storage(e) => BotError::Storage(e),
            other => BotError::Protection(other.to_string()),
        }
    }
}
