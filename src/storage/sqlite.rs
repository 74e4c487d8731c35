//! SQLite implementation of Storage.

use crate::domain::{Category, Execution, Order, OrderSide, OrderStatus, OrderType, Position, PositionSide};
use crate::protection::{ProtectionMode, ProtectiveLevels};
use crate::storage::{AuditEntry, Storage, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::{debug, info};

/// SqliteStorage implements Storage using SQLite.
pub struct SqliteStorage {
    pool: Pool<Sqlite>,
}

/// SqliteStorageConfig holds SQLite storage configuration.
#[derive(Debug, Clone)]
pub struct SqliteStorageConfig {
    /// Path to the SQLite database file.
    pub path: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            path: "trade_guard.db".to_string(),
            max_connections: 5,
        }
    }
}

impl From<&crate::config::StorageConfig> for SqliteStorageConfig {
    fn from(cfg: &crate::config::StorageConfig) -> Self {
        Self {
            path: cfg.path.clone(),
            max_connections: cfg.max_connections.filter(|n| *n > 0).unwrap_or(5),
        }
    }
}

impl SqliteStorage {
    /// Opens (or creates) the database and runs migrations.
    pub async fn new(config: SqliteStorageConfig) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let storage = Self { pool };

        storage.migrate().await?;

        info!(path = %config.path, "SQLite storage initialized");
        Ok(storage)
    }

    /// Runs database migrations to create the schema.
    async fn migrate(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                idempotency_key TEXT UNIQUE,
                category TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                price TEXT,
                quantity TEXT NOT NULL,
                filled_quantity TEXT NOT NULL,
                status TEXT NOT NULL,
                reduce_only INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)",
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                execution_id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                fee TEXT NOT NULL,
                is_maker INTEGER NOT NULL,
                executed_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_executions_order ON executions(order_id)",
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS protective_levels (
                position_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                atr TEXT,
                stop_price TEXT NOT NULL,
                take_profit_price TEXT NOT NULL,
                sl_hit INTEGER NOT NULL,
                tp_hit INTEGER NOT NULL,
                mode TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                component TEXT NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_audit_component ON audit_log(component)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

const ORDER_COLUMNS: &str = "order_id, idempotency_key, category, symbol, side, order_type, \
     price, quantity, filled_quantity, status, reduce_only, created_at, updated_at";

const EXECUTION_COLUMNS: &str =
    "execution_id, order_id, symbol, side, price, quantity, fee, is_maker, executed_at";

const LEVELS_COLUMNS: &str = "position_id, symbol, side, entry_price, quantity, atr, stop_price, \
     take_profit_price, sl_hit, tp_hit, mode, created_at, updated_at";

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_order(&self, order: &Order) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO orders ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            ORDER_COLUMNS
        );
        let result = bind_order(sqlx::query(&sql), order).execute(&self.pool).await;

        match result {
            Ok(_) => {
                debug!(order_id = %order.order_id, symbol = %order.symbol, "Order saved");
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StorageError::Duplicate(
                format!(
                    "order {} / key {}",
                    order.order_id,
                    order.idempotency_key.as_deref().unwrap_or("-")
                ),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_order(&self, order: &Order) -> Result<(), StorageError> {
        let sql = format!(
            r#"
            INSERT INTO orders ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(order_id) DO UPDATE SET
                idempotency_key = COALESCE(excluded.idempotency_key, orders.idempotency_key),
                price = excluded.price,
                quantity = excluded.quantity,
                filled_quantity = excluded.filled_quantity,
                status = excluded.status,
                reduce_only = excluded.reduce_only,
                updated_at = excluded.updated_at
            "#,
            ORDER_COLUMNS
        );
        bind_order(sqlx::query(&sql), order)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<Option<Order>, StorageError> {
        let sql = format!("SELECT {} FROM orders WHERE order_id = ?", ORDER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_order_row).transpose()
    }

    async fn get_order_by_key(&self, key: &str) -> Result<Option<Order>, StorageError> {
        let sql = format!("SELECT {} FROM orders WHERE idempotency_key = ?", ORDER_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_order_row).transpose()
    }

    async fn active_orders(&self) -> Result<Vec<Order>, StorageError> {
        let sql = format!(
            "SELECT {} FROM orders WHERE status IN ('New', 'PartiallyFilled') ORDER BY created_at",
            ORDER_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(parse_order_row).collect()
    }

    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        filled_quantity: Decimal,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE orders SET status = ?1, filled_quantity = ?2, updated_at = ?3 WHERE order_id = ?4",
        )
        .bind(status.to_string())
        .bind(filled_quantity.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<bool, StorageError> {
        let sql = format!(
            "INSERT INTO executions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(execution_id) DO NOTHING",
            EXECUTION_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(&execution.execution_id)
            .bind(&execution.order_id)
            .bind(&execution.symbol)
            .bind(execution.side.to_string())
            .bind(execution.price.to_string())
            .bind(execution.quantity.to_string())
            .bind(execution.fee.to_string())
            .bind(execution.is_maker)
            .bind(execution.executed_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn executions_for_order(&self, order_id: &str) -> Result<Vec<Execution>, StorageError> {
        let sql = format!(
            "SELECT {} FROM executions WHERE order_id = ? ORDER BY executed_at",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_execution_row).collect()
    }

    async fn execution_count(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM executions")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, StorageError> {
        let row = sqlx::query(
            "SELECT symbol, side, quantity, entry_price, unrealized_pnl, updated_at \
             FROM positions WHERE symbol = ?",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_position_row).transpose()
    }

    async fn positions(&self) -> Result<Vec<Position>, StorageError> {
        let rows = sqlx::query(
            "SELECT symbol, side, quantity, entry_price, unrealized_pnl, updated_at \
             FROM positions ORDER BY symbol",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_position_row).collect()
    }

    async fn upsert_position(&self, position: &Position) -> Result<(), StorageError> {
        if position.quantity <= Decimal::ZERO {
            return Err(StorageError::InvalidData(format!(
                "position {} has non-positive quantity {}",
                position.symbol, position.quantity
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO positions (symbol, side, quantity, entry_price, unrealized_pnl, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(symbol) DO UPDATE SET
                side = excluded.side,
                quantity = excluded.quantity,
                entry_price = excluded.entry_price,
                unrealized_pnl = excluded.unrealized_pnl,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&position.symbol)
        .bind(position.side.to_string())
        .bind(position.quantity.to_string())
        .bind(position.entry_price.to_string())
        .bind(position.unrealized_pnl.to_string())
        .bind(position.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_position(&self, symbol: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM positions WHERE symbol = ?")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_levels(&self, levels: &ProtectiveLevels) -> Result<(), StorageError> {
        let sql = format!(
            r#"
            INSERT INTO protective_levels ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(position_id) DO UPDATE SET
                quantity = excluded.quantity,
                atr = excluded.atr,
                stop_price = excluded.stop_price,
                take_profit_price = excluded.take_profit_price,
                sl_hit = excluded.sl_hit,
                tp_hit = excluded.tp_hit,
                mode = excluded.mode,
                updated_at = excluded.updated_at
            "#,
            LEVELS_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&levels.position_id)
            .bind(&levels.symbol)
            .bind(levels.side.to_string())
            .bind(levels.entry_price.to_string())
            .bind(levels.quantity.to_string())
            .bind(levels.atr.map(|a| a.to_string()))
            .bind(levels.stop_price.to_string())
            .bind(levels.take_profit_price.to_string())
            .bind(levels.sl_hit)
            .bind(levels.tp_hit)
            .bind(levels.mode.to_string())
            .bind(levels.created_at.to_rfc3339())
            .bind(levels.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_levels(&self, position_id: &str) -> Result<Option<ProtectiveLevels>, StorageError> {
        let sql = format!(
            "SELECT {} FROM protective_levels WHERE position_id = ?",
            LEVELS_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(position_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_levels_row).transpose()
    }

    async fn all_levels(&self) -> Result<Vec<ProtectiveLevels>, StorageError> {
        let sql = format!(
            "SELECT {} FROM protective_levels ORDER BY created_at",
            LEVELS_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(parse_levels_row).collect()
    }

    async fn delete_levels(&self, position_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM protective_levels WHERE position_id = ?")
            .bind(position_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn config_get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    async fn config_set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn config_delete_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM config WHERE substr(key, 1, length(?1)) = ?1")
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn config_entries(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        let rows = sqlx::query(
            "SELECT key, value FROM config WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
            .collect()
    }

    async fn append_audit(
        &self,
        component: &str,
        kind: &str,
        message: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO audit_log (component, kind, message, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(component)
        .bind(kind)
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_entries(&self, component: &str) -> Result<Vec<AuditEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, component, kind, message, created_at FROM audit_log \
             WHERE component = ? ORDER BY id",
        )
        .bind(component)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AuditEntry {
                    id: row.try_get("id")?,
                    component: row.try_get("component")?,
                    kind: row.try_get("kind")?,
                    message: row.try_get("message")?,
                    created_at: parse_time(row, "created_at")?,
                })
            })
            .collect()
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }
}

fn bind_order<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    order: &'q Order,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&order.order_id)
        .bind(order.idempotency_key.as_deref())
        .bind(order.category.to_string())
        .bind(&order.symbol)
        .bind(order.side.to_string())
        .bind(order.order_type.to_string())
        .bind(order.price.map(|p| p.to_string()))
        .bind(order.quantity.to_string())
        .bind(order.filled_quantity.to_string())
        .bind(order.status.to_string())
        .bind(order.reduce_only)
        .bind(order.created_at.to_rfc3339())
        .bind(order.updated_at.to_rfc3339())
}

fn parse_decimal(row: &SqliteRow, column: &str) -> Result<Decimal, StorageError> {
    let raw: String = row.try_get(column)?;
    Decimal::from_str(&raw)
        .map_err(|e| StorageError::InvalidData(format!("Invalid {}: {}", column, e)))
}

fn parse_optional_decimal(row: &SqliteRow, column: &str) -> Result<Option<Decimal>, StorageError> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| {
        Decimal::from_str(&s)
            .map_err(|e| StorageError::InvalidData(format!("Invalid {}: {}", column, e)))
    })
    .transpose()
}

fn parse_time(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, StorageError> {
    let raw: String = row.try_get(column)?;
    Ok(DateTime::parse_from_rfc3339(&raw)
        .map_err(|e| StorageError::InvalidData(format!("Invalid {}: {}", column, e)))?
        .with_timezone(&Utc))
}

fn parse_enum<T: FromStr<Err = String>>(row: &SqliteRow, column: &str) -> Result<T, StorageError> {
    let raw: String = row.try_get(column)?;
    T::from_str(&raw).map_err(StorageError::InvalidData)
}

/// Parses an order from a database row.
fn parse_order_row(row: &SqliteRow) -> Result<Order, StorageError> {
    Ok(Order {
        order_id: row.try_get("order_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        category: parse_enum::<Category>(row, "category")?,
        symbol: row.try_get("symbol")?,
        side: parse_enum::<OrderSide>(row, "side")?,
        order_type: parse_enum::<OrderType>(row, "order_type")?,
        price: parse_optional_decimal(row, "price")?,
        quantity: parse_decimal(row, "quantity")?,
        filled_quantity: parse_decimal(row, "filled_quantity")?,
        status: parse_enum::<OrderStatus>(row, "status")?,
        reduce_only: row.try_get("reduce_only")?,
        created_at: parse_time(row, "created_at")?,
        updated_at: parse_time(row, "updated_at")?,
    })
}

fn parse_execution_row(row: &SqliteRow) -> Result<Execution, StorageError> {
    Ok(Execution {
        execution_id: row.try_get("execution_id")?,
        order_id: row.try_get("order_id")?,
        symbol: row.try_get("symbol")?,
        side: parse_enum::<OrderSide>(row, "side")?,
        price: parse_decimal(row, "price")?,
        quantity: parse_decimal(row, "quantity")?,
        fee: parse_decimal(row, "fee")?,
        is_maker: row.try_get("is_maker")?,
        executed_at: parse_time(row, "executed_at")?,
    })
}

fn parse_position_row(row: &SqliteRow) -> Result<Position, StorageError> {
    Ok(Position {
        symbol: row.try_get("symbol")?,
        side: parse_enum::<PositionSide>(row, "side")?,
        quantity: parse_decimal(row, "quantity")?,
        entry_price: parse_decimal(row, "entry_price")?,
        unrealized_pnl: parse_decimal(row, "unrealized_pnl")?,
        updated_at: parse_time(row, "updated_at")?,
    })
}

fn parse_levels_row(row: &SqliteRow) -> Result<ProtectiveLevels, StorageError> {
    Ok(ProtectiveLevels {
        position_id: row.try_get("position_id")?,
        symbol: row.try_get("symbol")?,
        side: parse_enum::<PositionSide>(row, "side")?,
        entry_price: parse_decimal(row, "entry_price")?,
        quantity: parse_decimal(row, "quantity")?,
        atr: parse_optional_decimal(row, "atr")?,
        stop_price: parse_decimal(row, "stop_price")?,
        take_profit_price: parse_decimal(row, "take_profit_price")?,
        sl_hit: row.try_get("sl_hit")?,
        tp_hit: row.try_get("tp_hit")?,
        mode: parse_enum::<ProtectionMode>(row, "mode")?,
        created_at: parse_time(row, "created_at")?,
        updated_at: parse_time(row, "updated_at")?,
    })
}
