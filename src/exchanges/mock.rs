//! In-memory exchange for tests. Deduplicates on idempotency key like a real
//! venue and lets a test script failures per operation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::{Category, Execution, InstrumentRules, Order, OrderStatus, Position};
use crate::exchanges::{Exchange, ExchangeError, OrderAck, OrderRequest, Result, TradingStopRequest};

#[derive(Default)]
struct State {
    orders: HashMap<String, Order>,
    keys: HashMap<String, String>,
    positions: Vec<Position>,
    executions: Vec<Execution>,
    next_id: u64,
    /// Returned (in order) by place_order before touching state.
    place_failures: VecDeque<ExchangeError>,
    /// Returned by place_order after the order was accepted.
    place_lost_acks: VecDeque<ExchangeError>,
    trading_stop_error: Option<ExchangeError>,
    positions_error: Option<ExchangeError>,
    trading_stops: Vec<TradingStopRequest>,
    place_calls: usize,
    cancel_all_calls: usize,
    balance: Decimal,
    prices: HashMap<String, Decimal>,
}

pub(crate) struct MockExchange {
    state: Mutex<State>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                balance: Decimal::new(10_000, 0),
                ..State::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn fail_next_place(&self, err: ExchangeError) {
        self.state().place_failures.push_back(err);
    }

    /// The next place_order is applied but the caller sees `err`.
    pub fn lose_next_ack(&self, err: ExchangeError) {
        self.state().place_lost_acks.push_back(err);
    }

    pub fn set_trading_stop_error(&self, err: Option<ExchangeError>) {
        self.state().trading_stop_error = err;
    }

    pub fn set_positions_error(&self, err: Option<ExchangeError>) {
        self.state().positions_error = err;
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        self.state().positions = positions;
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state().balance = balance;
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.state().prices.insert(symbol.to_string(), price);
    }

    pub fn add_execution(&self, execution: Execution) {
        self.state().executions.push(execution);
    }

    /// Drops an order from the venue as if it filled or was cancelled remotely.
    pub fn remove_order(&self, order_id: &str) {
        self.state().orders.remove(order_id);
    }

    pub fn insert_order(&self, order: Order) {
        let mut state = self.state();
        if let Some(key) = &order.idempotency_key {
            state.keys.insert(key.clone(), order.order_id.clone());
        }
        state.orders.insert(order.order_id.clone(), order);
    }

    pub fn place_calls(&self) -> usize {
        self.state().place_calls
    }

    pub fn cancel_all_calls(&self) -> usize {
        self.state().cancel_all_calls
    }

    pub fn order_count(&self) -> usize {
        self.state().orders.len()
    }

    pub fn trading_stops(&self) -> Vec<TradingStopRequest> {
        self.state().trading_stops.clone()
    }
}

#[async_trait]
impl Exchange for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let mut state = self.state();
        state.place_calls += 1;

        if let Some(err) = state.place_failures.pop_front() {
            return Err(err);
        }
        if state.keys.contains_key(&request.idempotency_key) {
            return Err(ExchangeError::DuplicateOrder(request.idempotency_key.clone()));
        }

        state.next_id += 1;
        let order_id = format!("ex-{}", state.next_id);
        let now = Utc::now();
        state.keys.insert(request.idempotency_key.clone(), order_id.clone());
        state.orders.insert(
            order_id.clone(),
            Order {
                order_id: order_id.clone(),
                idempotency_key: Some(request.idempotency_key.clone()),
                category: request.category,
                symbol: request.symbol.clone(),
                side: request.side,
                order_type: request.order_type,
                price: request.price,
                quantity: request.quantity,
                filled_quantity: Decimal::ZERO,
                status: OrderStatus::New,
                reduce_only: request.reduce_only,
                created_at: now,
                updated_at: now,
            },
        );

        if let Some(err) = state.place_lost_acks.pop_front() {
            return Err(err);
        }

        Ok(OrderAck {
            order_id,
            idempotency_key: request.idempotency_key.clone(),
        })
    }

    async fn cancel_order(&self, _category: Category, _symbol: &str, order_id: &str) -> Result<()> {
        match self.state().orders.remove(order_id) {
            Some(_) => Ok(()),
            None => Err(ExchangeError::OrderNotFound(order_id.to_string())),
        }
    }

    async fn cancel_all_orders(&self, _category: Category, symbol: Option<&str>) -> Result<usize> {
        let mut state = self.state();
        state.cancel_all_calls += 1;
        let before = state.orders.len();
        state
            .orders
            .retain(|_, o| symbol.map(|s| s != o.symbol).unwrap_or(false));
        Ok(before - state.orders.len())
    }

    async fn open_orders(&self, _category: Category) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self.state().orders.values().cloned().collect();
        orders.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        Ok(orders)
    }

    async fn order_by_key(
        &self,
        _category: Category,
        _symbol: &str,
        idempotency_key: &str,
    ) -> Result<Option<Order>> {
        let state = self.state();
        Ok(state
            .keys
            .get(idempotency_key)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn positions(&self, _category: Category) -> Result<Vec<Position>> {
        let state = self.state();
        if let Some(err) = &state.positions_error {
            return Err(err.clone());
        }
        Ok(state.positions.clone())
    }

    async fn executions(&self, _category: Category, since: DateTime<Utc>) -> Result<Vec<Execution>> {
        Ok(self
            .state()
            .executions
            .iter()
            .filter(|e| e.executed_at >= since)
            .cloned()
            .collect())
    }

    async fn set_trading_stop(&self, request: &TradingStopRequest) -> Result<()> {
        let mut state = self.state();
        if let Some(err) = &state.trading_stop_error {
            return Err(err.clone());
        }
        state.trading_stops.push(request.clone());
        Ok(())
    }

    async fn instrument_rules(&self, _category: Category, symbol: &str) -> Result<InstrumentRules> {
        Ok(InstrumentRules {
            symbol: symbol.to_string(),
            tick_size: Decimal::new(1, 1),
            qty_step: Decimal::new(1, 3),
            min_order_qty: Decimal::new(1, 3),
            min_notional: Decimal::new(5, 0),
        })
    }

    async fn wallet_balance(&self) -> Result<Decimal> {
        Ok(self.state().balance)
    }

    async fn last_price(&self, _category: Category, symbol: &str) -> Result<Decimal> {
        self.state()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::InvalidParameter(format!("no ticker for {}", symbol)))
    }
}
