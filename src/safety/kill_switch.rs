//! Persisted emergency stop.
//!
//! The activation record lives in the key-value store, so a restarted process
//! sees it immediately. Only [`KillSwitch::reset`] with the configured token
//! removes it; the record's age never matters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::storage::{AuditEntry, Storage, StorageError};

/// Key-value key holding the active record.
pub const ACTIVATION_KEY: &str = "kill_switch.activation";

/// Audit log component name.
pub const AUDIT_COMPONENT: &str = "kill_switch";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchRecord {
    pub reason: String,
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActivateOutcome {
    Activated,
    /// Nothing changed; carries the record already in force.
    AlreadyActive(KillSwitchRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Reset,
    /// Wrong or unconfigured token; state unchanged.
    InvalidToken,
    NotActive,
}

pub struct KillSwitch {
    storage: Arc<dyn Storage>,
    reset_token: String,
    /// Serializes activate/reset.
    write_lock: Mutex<()>,
}

impl KillSwitch {
    pub fn new(storage: Arc<dyn Storage>, reset_token: impl Into<String>) -> Self {
        Self {
            storage,
            reset_token: reset_token.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the active record, if any.
    ///
    /// An unreadable record still counts as active.
    pub async fn status(&self) -> Result<Option<KillSwitchRecord>, StorageError> {
        let Some(raw) = self.storage.config_get(ACTIVATION_KEY).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<KillSwitchRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(error = %e, "unreadable kill switch record, treating as active");
                Ok(Some(KillSwitchRecord {
                    reason: format!("unreadable record: {}", raw),
                    activated_at: DateTime::<Utc>::MIN_UTC,
                }))
            }
        }
    }

    pub async fn is_active(&self) -> Result<bool, StorageError> {
        Ok(self.status().await?.is_some())
    }

    /// Activates the switch. A second activation keeps the first record.
    pub async fn activate(&self, reason: &str) -> Result<ActivateOutcome, StorageError> {
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.status().await? {
            info!(reason = %reason, active_reason = %existing.reason, "kill switch already active");
            return Ok(ActivateOutcome::AlreadyActive(existing));
        }

        let record = KillSwitchRecord {
            reason: reason.to_string(),
            activated_at: Utc::now(),
        };
        let raw = serde_json::to_string(&record)
            .map_err(|e| StorageError::InvalidData(e.to_string()))?;

        self.storage.config_set(ACTIVATION_KEY, &raw).await?;
        self.storage
            .append_audit(AUDIT_COMPONENT, "activated", reason)
            .await?;

        error!(reason = %reason, "KILL SWITCH ACTIVATED, all new orders blocked");
        Ok(ActivateOutcome::Activated)
    }

    /// Clears the switch if `token` matches the configured reset token.
    /// An empty configured token disables reset entirely.
    pub async fn reset(&self, token: &str) -> Result<ResetOutcome, StorageError> {
        let _guard = self.write_lock.lock().await;

        if self.reset_token.is_empty() || token != self.reset_token {
            warn!("kill switch reset rejected: invalid token");
            self.storage
                .append_audit(AUDIT_COMPONENT, "reset_rejected", "invalid token")
                .await?;
            return Ok(ResetOutcome::InvalidToken);
        }

        let Some(record) = self.status().await? else {
            return Ok(ResetOutcome::NotActive);
        };

        let removed = self.storage.config_delete_prefix(ACTIVATION_KEY).await?;
        self.storage
            .append_audit(
                AUDIT_COMPONENT,
                "reset",
                &format!("cleared activation from {} ({})", record.activated_at, record.reason),
            )
            .await?;

        warn!(removed, reason = %record.reason, "kill switch reset, trading may resume");
        Ok(ResetOutcome::Reset)
    }

    /// Activation and reset history, oldest first.
    pub async fn history(&self) -> Result<Vec<AuditEntry>, StorageError> {
        self.storage.audit_entries(AUDIT_COMPONENT).await
    }
}
