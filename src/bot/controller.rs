//! Decision logic shared by the main loop and the background risk monitor.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::input::SignalOutcome;
use super::{BotError, Stats};
use crate::config::{Config, RetryPolicy};
use crate::domain::{Category, InstrumentRules, MarketUpdate, Order, Position, Signal};
use crate::exchanges::{Exchange, ExchangeError};
use crate::orders::{OrderError, OrderManager, SubmitRequest, exit_key, new_key, with_retry};
use crate::protection::{ProtectionError, ProtectionManager, ProtectionMode, Trigger, calculate_levels};
use crate::reconciliation::{ReconciliationReport, ReconciliationService};
use crate::risk::{Decision, RiskEngine, RiskStateSnapshot, position_size};
use crate::safety::{ActivateOutcome, BreakerState, CircuitBreaker, KillSwitch, RecoveryOutcome};
use crate::storage::{Storage, StorageError};

/// Audit log component for circuit breaker transitions.
pub const BREAKER_AUDIT_COMPONENT: &str = "circuit_breaker";

pub(crate) struct Controller {
    pub(crate) cfg: Config,
    category: Category,
    exchange: Arc<dyn Exchange>,
    storage: Arc<dyn Storage>,
    retry: RetryPolicy,
    attempt_timeout: Duration,

    pub(crate) orders: OrderManager,
    pub(crate) protection: ProtectionManager,
    pub(crate) risk: RiskEngine,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) kill_switch: Arc<KillSwitch>,
    pub(crate) reconciliation: Arc<ReconciliationService>,
    /// Wakes the reconciliation loop for an on-demand pass.
    pub(crate) reconcile_now: Arc<Notify>,

    market: Mutex<HashMap<String, MarketUpdate>>,
    rules: Mutex<HashMap<String, InstrumentRules>>,
    equity: Mutex<Option<Decimal>>,
    /// Virtual exits whose order could not be placed yet, by position id.
    pending_exits: Mutex<HashMap<String, Trigger>>,
    /// Symbols closed by a virtual exit, with the exit time. The stored row
    /// stays until reconciliation sees the position gone.
    exited: Mutex<HashMap<String, DateTime<Utc>>>,
    /// A breaker KILL_SWITCH has been copied to the persisted kill switch.
    breaker_trip_mirrored: Mutex<bool>,
    pub(crate) stats: Mutex<Stats>,
}

impl Controller {
    pub(crate) fn new(cfg: Config, exchange: Arc<dyn Exchange>, storage: Arc<dyn Storage>) -> Self {
        let category = cfg.exchange.category;
        let retry = cfg.execution.retry_policy();
        let attempt_timeout = cfg.execution.attempt_timeout();

        let breaker = Arc::new(CircuitBreaker::new(cfg.circuit_breaker.clone()));
        let kill_switch = Arc::new(KillSwitch::new(
            storage.clone(),
            cfg.kill_switch.reset_token.clone(),
        ));
        let orders = OrderManager::new(
            exchange.clone(),
            storage.clone(),
            kill_switch.clone(),
            retry,
            attempt_timeout,
        );
        let protection = ProtectionManager::new(
            cfg.protection.clone(),
            category,
            exchange.clone(),
            storage.clone(),
            breaker.clone(),
        );
        let reconciliation = Arc::new(ReconciliationService::new(
            cfg.reconciliation.clone(),
            category,
            exchange.clone(),
            storage.clone(),
            breaker.clone(),
            retry,
            attempt_timeout,
        ));

        Self {
            risk: RiskEngine::new(cfg.risk.clone()),
            cfg,
            category,
            exchange,
            storage,
            retry,
            attempt_timeout,
            orders,
            protection,
            breaker,
            kill_switch,
            reconciliation,
            reconcile_now: Arc::new(Notify::new()),
            market: Mutex::new(HashMap::new()),
            rules: Mutex::new(HashMap::new()),
            equity: Mutex::new(None),
            pending_exits: Mutex::new(HashMap::new()),
            exited: Mutex::new(HashMap::new()),
            breaker_trip_mirrored: Mutex::new(false),
            stats: Mutex::new(Stats::default()),
        }
    }

    pub(crate) fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    async fn fetch<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        with_retry(&self.retry, self.attempt_timeout, operation, op)
            .await
            .map_err(|e| e.into_inner())
    }

    async fn account_equity(&self) -> Result<Decimal, ExchangeError> {
        let equity = self
            .fetch("wallet_balance", || self.exchange.wallet_balance())
            .await?;
        *self.equity.lock().await = Some(equity);
        Ok(equity)
    }

    async fn instrument_rules(&self, symbol: &str) -> Result<InstrumentRules, ExchangeError> {
        if let Some(rules) = self.rules.lock().await.get(symbol) {
            return Ok(rules.clone());
        }
        let rules = self
            .fetch("instrument_rules", || self.exchange.instrument_rules(self.category, symbol))
            .await?;
        self.rules
            .lock()
            .await
            .insert(symbol.to_string(), rules.clone());
        Ok(rules)
    }

    async fn open_notional(&self) -> Result<Decimal, StorageError> {
        Ok(self.storage.positions().await?.iter().map(|p| p.notional()).sum())
    }

    async fn skip(&self, symbol: &str, reason: String) -> SignalOutcome {
        info!(symbol, reason = %reason, "signal skipped");
        self.stats.lock().await.signals_skipped += 1;
        SignalOutcome::Skipped(reason)
    }

    /// Runs one signal through the safety gates, the risk engine, the order
    /// manager and protective level placement.
    pub(crate) async fn handle_signal(&self, signal: Signal) -> Result<SignalOutcome, BotError> {
        self.stats.lock().await.signals_received += 1;
        let symbol = signal.symbol.as_str();

        info!(
            symbol,
            direction = %signal.direction,
            entry = %signal.entry_price,
            stop = %signal.stop_price,
            take_profit = ?signal.take_profit,
            strategy = %signal.strategy_id,
            confidence = signal.confidence,
            "signal received"
        );

        if !self.cfg.symbols.iter().any(|s| s == symbol) {
            return Ok(self.skip(symbol, format!("{} is not a configured symbol", symbol)).await);
        }
        if let Some(record) = self.kill_switch.status().await? {
            return Ok(self.skip(symbol, format!("kill switch active: {}", record.reason)).await);
        }
        let state = self.breaker.state();
        if state != BreakerState::Active {
            return Ok(self.skip(symbol, format!("circuit breaker {}", state)).await);
        }
        if self.storage.get_position(symbol).await?.is_some()
            || !self.protection.positions_for_symbol(symbol).await.is_empty()
        {
            return Ok(self.skip(symbol, format!("{} already has an open position", symbol)).await);
        }

        let balance = match self.account_equity().await {
            Ok(b) => b,
            Err(e) => return Ok(self.skip(symbol, format!("balance unavailable: {}", e)).await),
        };
        let rules = match self.instrument_rules(symbol).await {
            Ok(r) => r,
            Err(e) => return Ok(self.skip(symbol, format!("instrument rules unavailable: {}", e)).await),
        };
        let risk_percent = self.risk.config().risk_per_trade_percent;
        let quantity = match position_size(balance, risk_percent, signal.entry_price, signal.stop_price, &rules) {
            Ok(q) => q,
            Err(e) => {
                warn!(
                    symbol,
                    balance = %balance,
                    risk_percent = %risk_percent,
                    entry = %signal.entry_price,
                    stop = %signal.stop_price,
                    error = %e,
                    "signal could not be sized"
                );
                return Ok(self.skip(symbol, format!("sizing failed: {}", e)).await);
            }
        };

        let now = Utc::now();
        let snapshot = RiskStateSnapshot::from_account(
            balance,
            self.open_notional().await?,
            quantity * signal.entry_price,
            self.breaker.realized_today(now),
            balance,
        );
        let assessment = self.risk.evaluate(&snapshot);

        match &assessment.decision {
            Decision::Allow => {}
            Decision::Deny { .. } => {
                warn!(
                    symbol,
                    balance = %snapshot.account_balance,
                    open_notional = %snapshot.open_notional,
                    proposed_notional = %snapshot.proposed_notional,
                    leverage = %snapshot.leverage,
                    realized_today = %snapshot.realized_pnl_today,
                    decision = %assessment.decision,
                    "signal denied by risk engine"
                );
                self.stats.lock().await.signals_denied += 1;
                return Ok(SignalOutcome::Denied(assessment.decision));
            }
            Decision::Stop { .. } => {
                error!(
                    symbol,
                    balance = %snapshot.account_balance,
                    open_notional = %snapshot.open_notional,
                    proposed_notional = %snapshot.proposed_notional,
                    leverage = %snapshot.leverage,
                    realized_today = %snapshot.realized_pnl_today,
                    decision = %assessment.decision,
                    "risk engine halted trading"
                );
                self.stats.lock().await.signals_stopped += 1;
                self.halt(&format!("risk {} on {}", assessment.decision, symbol))
                    .await?;
                return Ok(SignalOutcome::Stopped(assessment.decision));
            }
        }
        self.stats.lock().await.signals_allowed += 1;

        let request = SubmitRequest::market(self.category, symbol, signal.direction.entry_side(), quantity);
        let order = match self.orders.submit(request).await {
            Ok(order) => order,
            Err(OrderError::Storage(e)) => return Err(e.into()),
            Err(e) => {
                self.stats.lock().await.orders_failed += 1;
                warn!(symbol, quantity = %quantity, error = %e, "entry order not placed");
                return Ok(self.skip(symbol, format!("entry failed: {}", e)).await);
            }
        };
        self.stats.lock().await.orders_submitted += 1;

        let protection = self.protect_entry(&signal, &order, &rules).await?;
        self.reconcile_now.notify_one();

        Ok(SignalOutcome::Submitted {
            order_id: order.order_id,
            quantity,
            protection,
        })
    }

    /// Calculates, registers and places levels for a fresh entry. The entry
    /// order id doubles as the position id.
    async fn protect_entry(
        &self,
        signal: &Signal,
        order: &Order,
        rules: &InstrumentRules,
    ) -> Result<Option<ProtectionMode>, BotError> {
        let atr = self
            .market
            .lock()
            .await
            .get(&signal.symbol)
            .and_then(|m| m.atr);

        let mut levels = calculate_levels(
            self.protection.config(),
            &order.order_id,
            &signal.symbol,
            signal.direction,
            signal.entry_price,
            order.quantity,
            atr,
        );
        // An explicit target on the profitable side wins over the ATR target.
        if let Some(tp) = signal.take_profit {
            if (tp - signal.entry_price) * signal.direction.sign() > Decimal::ZERO {
                levels.take_profit_price = tp;
            }
        }
        levels.stop_price = rules.round_price(levels.stop_price);
        levels.take_profit_price = rules.round_price(levels.take_profit_price);

        self.protection.register(levels).await?;

        match self.protection.place_protective_orders(&order.order_id).await {
            Ok(mode) => Ok(Some(mode)),
            Err(ProtectionError::Unprotected { position_id, reason }) => {
                error!(position_id = %position_id, reason = %reason, "entry left without protection");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Feeds a price/ATR update: volatility check, virtual SL/TP and trailing.
    pub(crate) async fn handle_market(&self, update: MarketUpdate) -> Result<(), BotError> {
        if let Some(atr) = update.atr.filter(|a| *a > Decimal::ZERO) {
            if self.breaker.record_atr(atr, Utc::now()) {
                warn!(symbol = %update.symbol, atr = %atr, "volatility halt started");
            }
        }
        self.market
            .lock()
            .await
            .insert(update.symbol.clone(), update.clone());

        for position_id in self.protection.positions_for_symbol(&update.symbol).await {
            let Some(levels) = self.protection.get(&position_id).await else {
                continue;
            };
            if let Some(trigger) = self
                .protection
                .check_virtual_levels(&position_id, update.price, levels.quantity)
                .await?
            {
                self.exit(trigger).await?;
                continue;
            }
            self.protection
                .update_trailing_stop(&position_id, update.price)
                .await?;
        }
        Ok(())
    }

    /// Closes a position after a virtual trigger with a reduce-only market
    /// order. A failed exit is kept and retried on the next poll under the
    /// same key.
    async fn exit(&self, trigger: Trigger) -> Result<(), BotError> {
        let Some(levels) = self.protection.get(&trigger.position_id).await else {
            self.pending_exits.lock().await.remove(&trigger.position_id);
            return Ok(());
        };

        let request = SubmitRequest::market(
            self.category,
            &trigger.symbol,
            levels.side.exit_side(),
            trigger.quantity,
        )
        .with_key(exit_key(&trigger.position_id, trigger.kind.as_str()))
        .reduce_only();

        match self.orders.submit(request).await {
            Ok(order) => {
                let pnl = (trigger.price - levels.entry_price) * trigger.quantity * levels.side.sign();
                info!(
                    position_id = %trigger.position_id,
                    symbol = %trigger.symbol,
                    kind = %trigger.kind,
                    level = %trigger.level,
                    price = %trigger.price,
                    quantity = %trigger.quantity,
                    order_id = %order.order_id,
                    pnl = %pnl,
                    "position closed by virtual level"
                );
                self.pending_exits.lock().await.remove(&trigger.position_id);
                self.exited.lock().await.insert(trigger.symbol.clone(), Utc::now());
                self.protection.remove(&trigger.position_id).await?;
                self.stats.lock().await.exits_submitted += 1;
                self.record_pnl(pnl).await;
                self.reconcile_now.notify_one();
            }
            Err(OrderError::Storage(e)) => return Err(e.into()),
            Err(e) => {
                error!(
                    position_id = %trigger.position_id,
                    symbol = %trigger.symbol,
                    kind = %trigger.kind,
                    quantity = %trigger.quantity,
                    error = %e,
                    "exit order failed, retrying on next poll"
                );
                self.pending_exits
                    .lock()
                    .await
                    .insert(trigger.position_id.clone(), trigger);
            }
        }
        Ok(())
    }

    /// Feeds a closed trade into the breaker. Unknown equity counts as zero,
    /// so any loss then breaches the daily budget.
    async fn record_pnl(&self, pnl: Decimal) {
        let cached = *self.equity.lock().await;
        let equity = match cached {
            Some(e) => e,
            None => self.account_equity().await.unwrap_or_else(|e| {
                warn!(error = %e, "equity unknown while recording trade");
                Decimal::ZERO
            }),
        };
        self.stats.lock().await.realized_pnl += pnl;
        if self.breaker.record_trade(pnl, equity, Utc::now()) {
            warn!(pnl = %pnl, equity = %equity, "trade result tripped the circuit breaker");
        }
    }

    async fn exit_price_estimate(&self, symbol: &str) -> Option<Decimal> {
        if let Some(update) = self.market.lock().await.get(symbol) {
            return Some(update.price);
        }
        self.fetch("last_price", || self.exchange.last_price(self.category, symbol))
            .await
            .map_err(|e| warn!(symbol, error = %e, "last price unavailable"))
            .ok()
    }

    /// Applies a reconciliation report: drops levels of positions closed on
    /// the exchange and shrinks levels of partially closed ones.
    pub(crate) async fn apply_report(&self, report: ReconciliationReport) -> Result<(), BotError> {
        {
            let mut stats = self.stats.lock().await;
            stats.reconciliation_passes += 1;
            stats.reconciliation_corrections += report.mutations() as u64;
        }
        if report.has_fatal_failure() {
            return Err(BotError::Reconciliation(format!(
                "positions: {}, executions: {}, orders: {}",
                report.positions, report.executions, report.orders
            )));
        }

        for closed in &report.closed_positions {
            self.exited.lock().await.remove(&closed.symbol);
            let ids = self.protection.positions_for_symbol(&closed.symbol).await;
            if ids.is_empty() {
                continue;
            }
            {
                let mut pending = self.pending_exits.lock().await;
                for id in &ids {
                    pending.remove(id);
                }
            }
            self.protection.remove_for_symbol(&closed.symbol).await?;

            match self.exit_price_estimate(&closed.symbol).await {
                Some(price) => {
                    let pnl = (price - closed.entry_price) * closed.quantity * closed.side.sign();
                    info!(
                        symbol = %closed.symbol,
                        side = %closed.side,
                        quantity = %closed.quantity,
                        entry = %closed.entry_price,
                        exit_estimate = %price,
                        pnl = %pnl,
                        "position closed on exchange"
                    );
                    self.record_pnl(pnl).await;
                }
                None => warn!(symbol = %closed.symbol, "position closed on exchange, PnL not recorded"),
            }
        }

        self.sync_protected_quantities().await?;
        self.protect_unprotected_positions().await
    }

    async fn sync_protected_quantities(&self) -> Result<(), BotError> {
        for levels in self.protection.all().await {
            let Some(position) = self.storage.get_position(&levels.symbol).await? else {
                continue;
            };
            if position.quantity < levels.quantity {
                self.protection
                    .handle_partial_fill(
                        &levels.position_id,
                        levels.quantity - position.quantity,
                        position.quantity,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Attaches levels to stored positions that have none: an entry whose
    /// acknowledgement was lost, or a position opened before this run. A
    /// position that cannot be protected trips the breaker.
    pub(crate) async fn protect_unprotected_positions(&self) -> Result<(), BotError> {
        for position in self.storage.positions().await? {
            if position.quantity <= Decimal::ZERO
                || !self.protection.positions_for_symbol(&position.symbol).await.is_empty()
            {
                continue;
            }
            {
                let mut exited = self.exited.lock().await;
                match exited.get(&position.symbol) {
                    // Row predates the exit; the close has not been seen yet.
                    Some(at) if position.updated_at <= *at => continue,
                    Some(_) => {
                        exited.remove(&position.symbol);
                    }
                    None => {}
                }
            }
            self.adopt_position(&position).await?;
        }
        Ok(())
    }

    async fn adopt_position(&self, position: &Position) -> Result<(), BotError> {
        let symbol = &position.symbol;
        if position.entry_price <= Decimal::ZERO {
            let reason = format!("unprotected position {}: no entry price", symbol);
            error!(symbol = %symbol, quantity = %position.quantity, "position without levels and without entry price");
            self.breaker.trip(&reason, Utc::now());
            return Ok(());
        }

        let atr = self.market.lock().await.get(symbol).and_then(|m| m.atr);
        let position_id = format!("adopted-{}", new_key());
        let mut levels = calculate_levels(
            self.protection.config(),
            &position_id,
            symbol,
            position.side,
            position.entry_price,
            position.quantity,
            atr,
        );
        match self.instrument_rules(symbol).await {
            Ok(rules) => {
                levels.stop_price = rules.round_price(levels.stop_price);
                levels.take_profit_price = rules.round_price(levels.take_profit_price);
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "instrument rules unavailable, levels left unrounded"),
        }

        warn!(
            symbol = %symbol,
            side = %position.side,
            quantity = %position.quantity,
            entry = %position.entry_price,
            atr = ?atr,
            stop = %levels.stop_price,
            take_profit = %levels.take_profit_price,
            position_id = %position_id,
            "position has no protective levels, adopting it"
        );

        self.protection.register(levels).await?;
        match self.protection.place_protective_orders(&position_id).await {
            Ok(_) => Ok(()),
            Err(ProtectionError::Unprotected { position_id, reason }) => {
                error!(position_id = %position_id, reason = %reason, "adopted position left without protection");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Periodic safety poll: volatility recovery, breaker audit and kill
    /// switch mirroring, pending exits.
    pub(crate) async fn poll(&self) -> Result<(), BotError> {
        let now = Utc::now();
        match self.breaker.try_recover(now) {
            RecoveryOutcome::Recovered => info!("volatility halt lifted"),
            RecoveryOutcome::NotReady { remaining } => {
                debug!(remaining = ?remaining, "volatility halt cooling down")
            }
            RecoveryOutcome::NotHalted | RecoveryOutcome::ManualResetRequired => {}
        }

        self.pump_breaker_events().await?;

        let kill_switch_active = self.kill_switch.is_active().await?;
        if !kill_switch_active && self.breaker.state() == BreakerState::KillSwitch {
            let mut mirrored = self.breaker_trip_mirrored.lock().await;
            if *mirrored {
                // The persisted switch was reset by an operator.
                self.breaker.manual_reset("kill switch reset by operator", now);
                *mirrored = false;
                drop(mirrored);
                self.pump_breaker_events().await?;
            }
        }

        let pending: Vec<Trigger> = self.pending_exits.lock().await.values().cloned().collect();
        for trigger in pending {
            self.exit(trigger).await?;
        }
        Ok(())
    }

    /// Writes new breaker transitions to the audit log. A KILL_SWITCH
    /// transition also activates the persisted kill switch.
    async fn pump_breaker_events(&self) -> Result<(), BotError> {
        for event in self.breaker.take_new_events() {
            self.storage
                .append_audit(BREAKER_AUDIT_COMPONENT, &event.state.to_string(), &event.reason)
                .await?;
            if event.state == BreakerState::KillSwitch {
                self.halt(&format!("circuit breaker: {}", event.reason)).await?;
                *self.breaker_trip_mirrored.lock().await = true;
            }
        }
        Ok(())
    }

    /// Activates the kill switch and, when configured, cancels every open
    /// order. Position-attached stops stay in place.
    pub(crate) async fn halt(&self, reason: &str) -> Result<(), BotError> {
        match self.kill_switch.activate(reason).await? {
            ActivateOutcome::Activated => {
                if self.cfg.kill_switch.cancel_orders_on_activate {
                    match self.orders.cancel_all(self.category, None).await {
                        Ok(_) => {}
                        Err(OrderError::Storage(e)) => return Err(e.into()),
                        Err(e) => error!(error = %e, "open orders not cancelled after halt"),
                    }
                }
            }
            ActivateOutcome::AlreadyActive(_) => {}
        }
        Ok(())
    }

    /// Evaluates current exposure without a proposed trade.
    pub(crate) async fn monitor_risk(&self) -> Result<(), BotError> {
        if self.kill_switch.is_active().await? {
            return Ok(());
        }
        let balance = match self.account_equity().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "risk monitor skipped, balance unavailable");
                return Ok(());
            }
        };

        let snapshot = RiskStateSnapshot::from_account(
            balance,
            self.open_notional().await?,
            Decimal::ZERO,
            self.breaker.realized_today(Utc::now()),
            balance,
        );
        let assessment = self.risk.evaluate(&snapshot);

        match &assessment.decision {
            Decision::Allow => debug!(
                balance = %snapshot.account_balance,
                open_notional = %snapshot.open_notional,
                leverage = %snapshot.leverage,
                "risk monitor ok"
            ),
            Decision::Deny { .. } => warn!(
                balance = %snapshot.account_balance,
                open_notional = %snapshot.open_notional,
                leverage = %snapshot.leverage,
                realized_today = %snapshot.realized_pnl_today,
                decision = %assessment.decision,
                "open exposure breaches a limit, new entries will be denied"
            ),
            Decision::Stop { .. } => {
                error!(
                    balance = %snapshot.account_balance,
                    open_notional = %snapshot.open_notional,
                    leverage = %snapshot.leverage,
                    realized_today = %snapshot.realized_pnl_today,
                    decision = %assessment.decision,
                    "risk monitor halted trading"
                );
                self.halt(&format!("risk monitor {}", assessment.decision)).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn log_stats(&self) {
        let stats = self.stats.lock().await.clone();
        info!(
            signals = stats.signals_received,
            allowed = stats.signals_allowed,
            denied = stats.signals_denied,
            stopped = stats.signals_stopped,
            skipped = stats.signals_skipped,
            orders = stats.orders_submitted,
            failed_orders = stats.orders_failed,
            exits = stats.exits_submitted,
            reconciliations = stats.reconciliation_passes,
            corrections = stats.reconciliation_corrections,
            realized_pnl = %stats.realized_pnl,
            breaker = %self.breaker.state(),
            "Bot statistics"
        );
    }
}
