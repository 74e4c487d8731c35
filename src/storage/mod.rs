//! Local persisted state: orders, fills, positions, protective levels,
//! key-value settings and the audit log.

mod sqlite;

pub use sqlite::{SqliteStorage, SqliteStorageConfig};

use crate::domain::{Execution, Order, OrderStatus, Position};
use crate::protection::ProtectiveLevels;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// One row of the append-only audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub id: i64,
    /// Component that wrote the entry (e.g. "kill_switch").
    pub component: String,
    /// Event kind within the component (e.g. "activated").
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Storage is the single handle every component persists through.
///
/// Implementations must serialize writes per row; callers never hold a
/// transaction across an exchange call.
#[async_trait]
pub trait Storage: Send + Sync {
    // ---- orders ----

    /// Inserts a new order. Fails with `Duplicate` if the order id or the
    /// idempotency key already exists.
    async fn insert_order(&self, order: &Order) -> Result<(), StorageError>;

    /// Inserts or fully replaces an order keyed by its exchange id.
    async fn upsert_order(&self, order: &Order) -> Result<(), StorageError>;

    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, StorageError>;

    async fn get_order_by_key(&self, key: &str) -> Result<Option<Order>, StorageError>;

    /// Orders that are neither filled, cancelled nor rejected.
    async fn active_orders(&self) -> Result<Vec<Order>, StorageError>;

    /// Updates status and filled quantity. Returns false if the order is unknown.
    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        filled_quantity: Decimal,
    ) -> Result<bool, StorageError>;

    // ---- executions ----

    /// Appends a fill. Returns false if the execution id was already recorded.
    async fn insert_execution(&self, execution: &Execution) -> Result<bool, StorageError>;

    async fn executions_for_order(&self, order_id: &str) -> Result<Vec<Execution>, StorageError>;

    async fn execution_count(&self) -> Result<i64, StorageError>;

    // ---- positions ----

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, StorageError>;

    async fn positions(&self) -> Result<Vec<Position>, StorageError>;

    async fn upsert_position(&self, position: &Position) -> Result<(), StorageError>;

    /// Returns false if there was nothing to delete.
    async fn delete_position(&self, symbol: &str) -> Result<bool, StorageError>;

    // ---- protective levels ----

    async fn save_levels(&self, levels: &ProtectiveLevels) -> Result<(), StorageError>;

    async fn get_levels(&self, position_id: &str) -> Result<Option<ProtectiveLevels>, StorageError>;

    async fn all_levels(&self) -> Result<Vec<ProtectiveLevels>, StorageError>;

    async fn delete_levels(&self, position_id: &str) -> Result<bool, StorageError>;

    // ---- key-value configuration ----

    async fn config_get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn config_set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Deletes every key starting with `prefix`. Returns the number removed.
    async fn config_delete_prefix(&self, prefix: &str) -> Result<u64, StorageError>;

    /// All entries whose key starts with `prefix`, sorted by key.
    async fn config_entries(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError>;

    // ---- audit log ----

    async fn append_audit(
        &self,
        component: &str,
        kind: &str,
        message: &str,
    ) -> Result<(), StorageError>;

    /// Entries for a component, oldest first.
    async fn audit_entries(&self, component: &str) -> Result<Vec<AuditEntry>, StorageError>;

    /// Closes the storage connection.
    async fn close(&self) -> Result<(), StorageError>;
}

/// StorageError represents errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}
