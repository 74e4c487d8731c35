use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ReconciliationConfig, RetryPolicy};
use crate::domain::{Category, Order, OrderStatus, Position};
use crate::exchanges::{Exchange, ExchangeError};
use crate::orders::with_retry;
use crate::safety::CircuitBreaker;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
enum SyncError {
    #[error("exchange: {0}")]
    Exchange(ExchangeError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of one sub-routine within a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Completed { mutations: usize },
    /// `fatal` is set when the local store could not be read or written.
    Failed { error: String, fatal: bool },
}

impl PassOutcome {
    pub fn mutations(&self) -> usize {
        match self {
            PassOutcome::Completed { mutations } => *mutations,
            PassOutcome::Failed { .. } => 0,
        }
    }

    fn from_result(result: Result<usize, SyncError>) -> Self {
        match result {
            Ok(mutations) => PassOutcome::Completed { mutations },
            Err(e) => PassOutcome::Failed {
                fatal: matches!(e, SyncError::Storage(_)),
                error: e.to_string(),
            },
        }
    }
}

impl fmt::Display for PassOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassOutcome::Completed { mutations } => write!(f, "ok ({} changes)", mutations),
            PassOutcome::Failed { error, .. } => write!(f, "failed: {}", error),
        }
    }
}

/// Outcome of one full reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconciliationReport {
    pub started_at: DateTime<Utc>,
    pub positions: PassOutcome,
    pub executions: PassOutcome,
    pub orders: PassOutcome,
    /// Local positions the exchange no longer holds, as they were last
    /// recorded. Already deleted from the store.
    pub closed_positions: Vec<Position>,
    /// Persistent drift tripped the circuit breaker during this pass.
    pub escalated: bool,
}

impl ReconciliationReport {
    pub fn mutations(&self) -> usize {
        self.positions.mutations() + self.executions.mutations() + self.orders.mutations()
    }

    pub fn closed_symbols(&self) -> Vec<&str> {
        self.closed_positions.iter().map(|p| p.symbol.as_str()).collect()
    }

    /// A sub-routine could not use the local store.
    pub fn has_fatal_failure(&self) -> bool {
        [&self.positions, &self.executions, &self.orders]
            .iter()
            .any(|o| matches!(o, PassOutcome::Failed { fatal: true, .. }))
    }
}

#[derive(Default)]
struct PositionSync {
    mutations: usize,
    /// An existing local row disagreed on side or size.
    material_drift: bool,
    closed: Vec<Position>,
}

/// Mirrors exchange truth into the local store.
///
/// Passes are serialized; the periodic loop, on-demand triggers and the
/// startup pass never run concurrently.
pub struct ReconciliationService {
    config: ReconciliationConfig,
    category: Category,
    exchange: Arc<dyn Exchange>,
    storage: Arc<dyn Storage>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    drift_streak: AtomicU32,
    pass_lock: Mutex<()>,
}

impl ReconciliationService {
    pub fn new(
        config: ReconciliationConfig,
        category: Category,
        exchange: Arc<dyn Exchange>,
        storage: Arc<dyn Storage>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            config,
            category,
            exchange,
            storage,
            breaker,
            retry,
            attempt_timeout,
            drift_streak: AtomicU32::new(0),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// Runs positions, then executions, then orders. A failing sub-routine
    /// is reported and the next one still runs.
    pub async fn run_pass(&self) -> ReconciliationReport {
        let _guard = self.pass_lock.lock().await;
        let started_at = Utc::now();

        let (positions, closed_positions, material_drift) = match self.sync_positions().await {
            Ok(sync) => (
                PassOutcome::Completed { mutations: sync.mutations },
                sync.closed,
                Some(sync.material_drift),
            ),
            Err(e) => (PassOutcome::from_result(Err(e)), Vec::new(), None),
        };
        let executions = PassOutcome::from_result(self.sync_executions(started_at).await);
        let orders = PassOutcome::from_result(self.sync_orders().await);

        let escalated = match material_drift {
            Some(drifted) => self.track_drift(drifted),
            None => false,
        };

        let report = ReconciliationReport {
            started_at,
            positions,
            executions,
            orders,
            closed_positions,
            escalated,
        };

        let elapsed_ms = (Utc::now() - started_at).num_milliseconds();
        if report.has_fatal_failure() {
            error!(
                positions = %report.positions,
                executions = %report.executions,
                orders = %report.orders,
                "reconciliation could not use the local store"
            );
        } else if report.mutations() > 0 {
            info!(
                positions = %report.positions,
                executions = %report.executions,
                orders = %report.orders,
                closed = ?report.closed_symbols(),
                elapsed_ms,
                "reconciliation corrected local state"
            );
        } else {
            debug!(
                positions = %report.positions,
                executions = %report.executions,
                orders = %report.orders,
                elapsed_ms,
                "reconciliation pass clean"
            );
        }
        report
    }

    /// Updates the consecutive drift counter. Returns true when it reached
    /// the escalation threshold and the breaker was tripped.
    fn track_drift(&self, drifted: bool) -> bool {
        if !drifted {
            self.drift_streak.store(0, Ordering::SeqCst);
            return false;
        }
        let streak = self.drift_streak.fetch_add(1, Ordering::SeqCst) + 1;
        let threshold = self.config.drift_escalation_passes.max(1);
        warn!(streak, threshold, "position drift persisted across passes");
        if streak < threshold {
            return false;
        }
        self.drift_streak.store(0, Ordering::SeqCst);
        let reason = format!("position drift in {} consecutive reconciliation passes", streak);
        error!(streak, "escalating persistent drift to circuit breaker");
        self.breaker.trip(&reason, Utc::now());
        true
    }

    async fn fetch<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        with_retry(&self.retry, self.attempt_timeout, operation, op)
            .await
            .map_err(|e| SyncError::Exchange(e.into_inner()))
    }

    async fn sync_positions(&self) -> Result<PositionSync, SyncError> {
        let remote = self
            .fetch("positions", || self.exchange.positions(self.category))
            .await?;
        let local: HashMap<String, Position> = self
            .storage
            .positions()
            .await?
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();

        let tolerance = self.config.position_tolerance;
        let mut sync = PositionSync::default();
        let mut seen = HashSet::new();

        for mut position in remote {
            if position.quantity <= Decimal::ZERO {
                continue;
            }
            seen.insert(position.symbol.clone());

            match local.get(&position.symbol) {
                None => {
                    warn!(
                        symbol = %position.symbol,
                        side = %position.side,
                        quantity = %position.quantity,
                        entry = %position.entry_price,
                        "exchange position missing locally, recording it"
                    );
                }
                Some(existing) if existing.drifted_from(&position, tolerance) => {
                    let sized_differently = existing.side != position.side
                        || (existing.quantity - position.quantity).abs() > tolerance;
                    sync.material_drift |= sized_differently;
                    warn!(
                        symbol = %position.symbol,
                        local_side = %existing.side,
                        local_qty = %existing.quantity,
                        local_entry = %existing.entry_price,
                        exchange_side = %position.side,
                        exchange_qty = %position.quantity,
                        exchange_entry = %position.entry_price,
                        "position drift corrected from exchange"
                    );
                }
                Some(_) => continue,
            }

            position.updated_at = Utc::now();
            self.storage.upsert_position(&position).await?;
            sync.mutations += 1;
        }

        for (symbol, stale) in local {
            if seen.contains(&symbol) {
                continue;
            }
            if self.storage.delete_position(&symbol).await? {
                warn!(
                    symbol = %symbol,
                    side = %stale.side,
                    quantity = %stale.quantity,
                    entry = %stale.entry_price,
                    "local position closed on exchange, removed"
                );
                sync.mutations += 1;
                sync.closed.push(stale);
            }
        }

        Ok(sync)
    }

    async fn sync_executions(&self, now: DateTime<Utc>) -> Result<usize, SyncError> {
        let lookback = TimeDelta::from_std(self.config.execution_lookback()).unwrap_or(TimeDelta::days(1));
        let since = now - lookback;

        let fills = self
            .fetch("executions", || self.exchange.executions(self.category, since))
            .await?;

        let mut inserted = 0;
        for fill in &fills {
            if self.storage.insert_execution(fill).await? {
                debug!(
                    execution_id = %fill.execution_id,
                    order_id = %fill.order_id,
                    symbol = %fill.symbol,
                    price = %fill.price,
                    quantity = %fill.quantity,
                    "fill backfilled"
                );
                inserted += 1;
            }
        }
        if inserted > 0 {
            info!(fetched = fills.len(), inserted, since = %since, "missed fills recovered");
        }
        Ok(inserted)
    }

    async fn sync_orders(&self) -> Result<usize, SyncError> {
        let fetched_at = Utc::now();
        let remote = self
            .fetch("open_orders", || self.exchange.open_orders(self.category))
            .await?;
        let open_ids: HashSet<&str> = remote.iter().map(|o| o.order_id.as_str()).collect();

        let mut mutations = 0;

        for order in &remote {
            match self.storage.get_order(&order.order_id).await? {
                None => {
                    warn!(
                        order_id = %order.order_id,
                        symbol = %order.symbol,
                        side = %order.side,
                        quantity = %order.quantity,
                        status = %order.status,
                        "exchange order missing locally, recording it"
                    );
                    self.storage.upsert_order(order).await?;
                    mutations += 1;
                }
                Some(local)
                    if local.status != order.status || local.filled_quantity != order.filled_quantity =>
                {
                    info!(
                        order_id = %order.order_id,
                        local_status = %local.status,
                        local_filled = %local.filled_quantity,
                        exchange_status = %order.status,
                        exchange_filled = %order.filled_quantity,
                        "order status corrected from exchange"
                    );
                    self.storage
                        .update_order_status(&order.order_id, order.status, order.filled_quantity)
                        .await?;
                    mutations += 1;
                }
                Some(_) => {}
            }
        }

        for local in self.storage.active_orders().await? {
            // Placed after the snapshot was requested; the next pass sees it.
            if local.created_at >= fetched_at || open_ids.contains(local.order_id.as_str()) {
                continue;
            }
            self.close_vanished(&local).await?;
            mutations += 1;
        }

        Ok(mutations)
    }

    /// Marks an order the exchange no longer lists as open. Recorded fills
    /// decide between Filled and Cancelled.
    async fn close_vanished(&self, order: &Order) -> Result<(), SyncError> {
        let filled: Decimal = self
            .storage
            .executions_for_order(&order.order_id)
            .await?
            .iter()
            .map(|e| e.quantity)
            .sum();
        let filled = filled.max(order.filled_quantity);
        let status = if filled >= order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::Cancelled
        };

        warn!(
            order_id = %order.order_id,
            symbol = %order.symbol,
            quantity = %order.quantity,
            filled = %filled,
            status = %status,
            "active order gone from exchange, marked terminal"
        );
        self.storage
            .update_order_status(&order.order_id, status, filled)
            .await?;
        Ok(())
    }

    /// Periodic loop. Also runs a pass whenever `trigger` is notified.
    /// Exits when `shutdown` flips or the report receiver is dropped.
    pub async fn run(
        self: Arc<Self>,
        trigger: Arc<Notify>,
        reports: mpsc::Sender<ReconciliationReport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = self.config.interval();
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately; the startup pass covers it.
        ticker.tick().await;

        info!(interval = ?period, "reconciliation loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = trigger.notified() => debug!("on-demand reconciliation requested"),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            let report = self.run_pass().await;
            if reports.send(report).await.is_err() {
                warn!("report receiver dropped, stopping reconciliation loop");
                break;
            }
        }

        info!("reconciliation loop stopped");
    }
}
