use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::levels::{ProtectionMode, ProtectiveLevels, TriggerKind, trail_distance};
use crate::config::ProtectionConfig;
use crate::domain::Category;
use crate::exchanges::{Exchange, ExchangeError, TradingStopRequest};
use crate::safety::CircuitBreaker;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum ProtectionError {
    #[error("no protective levels for position {0}")]
    UnknownPosition(String),

    /// Neither native nor virtual protection is in force. The breaker has
    /// already been tripped.
    #[error("position {position_id} is unprotected: {reason}")]
    Unprotected { position_id: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A virtual level fired.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub position_id: String,
    pub symbol: String,
    pub kind: TriggerKind,
    /// Level that was crossed.
    pub level: Decimal,
    /// Price that crossed it.
    pub price: Decimal,
    /// Quantity to close.
    pub quantity: Decimal,
}

/// Result of a trailing stop update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingUpdate {
    pub updated: bool,
    pub stop_price: Decimal,
}

/// Keeps SL/TP state per position and enforces it natively or virtually.
///
/// Every mutation is written through to storage while the map lock is held,
/// so concurrent callers never interleave partial updates.
pub struct ProtectionManager {
    config: ProtectionConfig,
    category: Category,
    exchange: Arc<dyn Exchange>,
    storage: Arc<dyn Storage>,
    breaker: Arc<CircuitBreaker>,
    levels: Mutex<HashMap<String, ProtectiveLevels>>,
}

impl ProtectionManager {
    pub fn new(
        config: ProtectionConfig,
        category: Category,
        exchange: Arc<dyn Exchange>,
        storage: Arc<dyn Storage>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            config,
            category,
            exchange,
            storage,
            breaker,
            levels: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    /// Loads persisted levels. Returns how many were restored.
    pub async fn load(&self) -> Result<usize, ProtectionError> {
        let stored = self.storage.all_levels().await?;
        let mut levels = self.levels.lock().await;
        for l in stored {
            levels.insert(l.position_id.clone(), l);
        }
        info!(count = levels.len(), "protective levels restored");
        Ok(levels.len())
    }

    /// Starts tracking freshly calculated levels.
    pub async fn register(&self, levels: ProtectiveLevels) -> Result<(), ProtectionError> {
        let mut map = self.levels.lock().await;
        self.storage.save_levels(&levels).await?;
        info!(
            position_id = %levels.position_id,
            symbol = %levels.symbol,
            side = %levels.side,
            entry = %levels.entry_price,
            atr = ?levels.atr,
            stop = %levels.stop_price,
            take_profit = %levels.take_profit_price,
            "protective levels calculated"
        );
        map.insert(levels.position_id.clone(), levels);
        Ok(())
    }

    pub async fn get(&self, position_id: &str) -> Option<ProtectiveLevels> {
        self.levels.lock().await.get(position_id).cloned()
    }

    pub async fn all(&self) -> Vec<ProtectiveLevels> {
        self.levels.lock().await.values().cloned().collect()
    }

    /// Places exchange-native stops, falling back to virtual monitoring.
    ///
    /// If neither path is available the breaker is tripped and
    /// `Unprotected` is returned.
    pub async fn place_protective_orders(&self, position_id: &str) -> Result<ProtectionMode, ProtectionError> {
        let mut map = self.levels.lock().await;
        let levels = map
            .get_mut(position_id)
            .ok_or_else(|| ProtectionError::UnknownPosition(position_id.to_string()))?;

        let native_failure = if self.config.native_enabled {
            let request = TradingStopRequest {
                category: self.category,
                symbol: levels.symbol.clone(),
                stop_loss: Some(levels.stop_price),
                take_profit: Some(levels.take_profit_price),
            };
            match self.exchange.set_trading_stop(&request).await {
                Ok(()) => None,
                Err(e) => Some(e),
            }
        } else {
            Some(ExchangeError::Unsupported("native protection disabled".to_string()))
        };

        let mode = match native_failure {
            None => ProtectionMode::Native,
            Some(e) if self.config.virtual_enabled => {
                match &e {
                    ExchangeError::Unsupported(reason) => {
                        info!(position_id, reason = %reason, "native stops unavailable, monitoring virtually")
                    }
                    other => {
                        warn!(position_id, error = %other, "native stop placement failed, monitoring virtually")
                    }
                }
                ProtectionMode::Virtual
            }
            Some(e) => {
                let reason = format!(
                    "native placement failed ({}) and virtual monitoring is disabled",
                    e
                );
                error!(position_id, symbol = %levels.symbol, reason = %reason, "position unprotected");
                self.breaker
                    .trip(&format!("unprotected position {}: {}", position_id, reason), Utc::now());
                return Err(ProtectionError::Unprotected {
                    position_id: position_id.to_string(),
                    reason,
                });
            }
        };

        levels.mode = mode;
        levels.updated_at = Utc::now();
        self.storage.save_levels(levels).await?;

        info!(
            position_id,
            mode = %mode,
            stop = %levels.stop_price,
            take_profit = %levels.take_profit_price,
            "protection in force"
        );
        Ok(mode)
    }

    /// Checks a virtually monitored position against `price`.
    ///
    /// Returns at most one trigger per call; a side that already fired
    /// never fires again. Positions protected natively never trigger here.
    pub async fn check_virtual_levels(
        &self,
        position_id: &str,
        price: Decimal,
        current_qty: Decimal,
    ) -> Result<Option<Trigger>, ProtectionError> {
        let mut map = self.levels.lock().await;
        let Some(levels) = map.get_mut(position_id) else {
            return Ok(None);
        };
        if levels.mode != ProtectionMode::Virtual || current_qty <= Decimal::ZERO {
            return Ok(None);
        }

        let Some(kind) = levels.breached_at(price) else {
            return Ok(None);
        };

        let level = match kind {
            TriggerKind::StopLoss => {
                levels.sl_hit = true;
                levels.stop_price
            }
            TriggerKind::TakeProfit => {
                levels.tp_hit = true;
                levels.take_profit_price
            }
        };
        levels.updated_at = Utc::now();
        self.storage.save_levels(levels).await?;

        warn!(
            position_id,
            symbol = %levels.symbol,
            kind = %kind,
            level = %level,
            price = %price,
            quantity = %current_qty,
            "virtual level triggered"
        );

        Ok(Some(Trigger {
            position_id: position_id.to_string(),
            symbol: levels.symbol.clone(),
            kind,
            level,
            price,
            quantity: current_qty,
        }))
    }

    /// Ratchets the stop toward `price`. A move that would loosen the stop
    /// leaves state untouched and reports `updated: false`.
    pub async fn update_trailing_stop(
        &self,
        position_id: &str,
        price: Decimal,
    ) -> Result<TrailingUpdate, ProtectionError> {
        let mut map = self.levels.lock().await;
        let levels = map
            .get_mut(position_id)
            .ok_or_else(|| ProtectionError::UnknownPosition(position_id.to_string()))?;

        let not_updated = TrailingUpdate {
            updated: false,
            stop_price: levels.stop_price,
        };
        if !self.config.trailing_enabled || levels.sl_hit {
            return Ok(not_updated);
        }

        let distance = trail_distance(&self.config, price, levels.atr);
        let candidate = price - levels.side.sign() * distance;
        if !levels.is_tighter_stop(candidate) {
            return Ok(not_updated);
        }

        if levels.mode == ProtectionMode::Native {
            let request = TradingStopRequest {
                category: self.category,
                symbol: levels.symbol.clone(),
                stop_loss: Some(candidate),
                take_profit: None,
            };
            if let Err(e) = self.exchange.set_trading_stop(&request).await {
                if !self.config.virtual_enabled {
                    warn!(position_id, error = %e, "trailing stop not moved on exchange");
                    return Ok(not_updated);
                }
                // The looser exchange stop stays as a backstop.
                warn!(position_id, error = %e, "trailing stop push failed, switching to virtual monitoring");
                levels.mode = ProtectionMode::Virtual;
            }
        }

        let previous = levels.stop_price;
        levels.stop_price = candidate;
        levels.updated_at = Utc::now();
        self.storage.save_levels(levels).await?;

        debug!(position_id, from = %previous, to = %candidate, price = %price, "trailing stop moved");
        Ok(TrailingUpdate {
            updated: true,
            stop_price: candidate,
        })
    }

    /// Shrinks the protected quantity. Prices stay where they are.
    /// A zero remainder drops the levels.
    pub async fn handle_partial_fill(
        &self,
        position_id: &str,
        filled_qty: Decimal,
        remaining_qty: Decimal,
    ) -> Result<(), ProtectionError> {
        if remaining_qty <= Decimal::ZERO {
            self.remove(position_id).await?;
            return Ok(());
        }

        let mut map = self.levels.lock().await;
        let levels = map
            .get_mut(position_id)
            .ok_or_else(|| ProtectionError::UnknownPosition(position_id.to_string()))?;

        levels.quantity = remaining_qty;
        levels.updated_at = Utc::now();
        self.storage.save_levels(levels).await?;

        info!(
            position_id,
            filled = %filled_qty,
            remaining = %remaining_qty,
            stop = %levels.stop_price,
            "partial fill, protected quantity reduced"
        );
        Ok(())
    }

    /// Stops tracking a position. Returns false if it was unknown.
    pub async fn remove(&self, position_id: &str) -> Result<bool, ProtectionError> {
        let mut map = self.levels.lock().await;
        let existed = map.remove(position_id).is_some();
        let deleted = self.storage.delete_levels(position_id).await?;
        if existed || deleted {
            debug!(position_id, "protective levels removed");
        }
        Ok(existed || deleted)
    }

    /// Drops every level set attached to `symbol`. Returns how many went.
    pub async fn remove_for_symbol(&self, symbol: &str) -> Result<usize, ProtectionError> {
        let mut map = self.levels.lock().await;
        let ids: Vec<String> = map
            .values()
            .filter(|l| l.symbol == symbol)
            .map(|l| l.position_id.clone())
            .collect();

        for id in &ids {
            self.storage.delete_levels(id).await?;
            map.remove(id);
        }
        if !ids.is_empty() {
            info!(symbol, count = ids.len(), "protective levels dropped for closed position");
        }
        Ok(ids.len())
    }

    /// Position ids with levels on `symbol`.
    pub async fn positions_for_symbol(&self, symbol: &str) -> Vec<String> {
        self.levels
            .lock()
            .await
            .values()
            .filter(|l| l.symbol == symbol)
            .map(|l| l.position_id.clone())
            .collect()
    }
}
