//! Shared fixtures for unit tests.

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use tempfile::TempDir;

use crate::storage::{SqliteStorage, SqliteStorageConfig, Storage};

pub(crate) fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// On-disk SQLite in a temp dir. Keep the TempDir alive for the test.
pub(crate) async fn temp_storage() -> (TempDir, Arc<dyn Storage>) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let storage = SqliteStorage::new(SqliteStorageConfig {
        path: path.to_string_lossy().to_string(),
        max_connections: 2,
    })
    .await
    .unwrap();
    (dir, Arc::new(storage))
}
