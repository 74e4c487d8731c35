use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{error, info, warn};

use super::keys::new_key;
use super::retry::{RetryError, with_retry};
use crate::config::RetryPolicy;
use crate::domain::{Category, Order, OrderSide, OrderStatus, OrderType};
use crate::exchanges::{Exchange, ExchangeError, OrderRequest};
use crate::safety::KillSwitch;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("kill switch active: {0}")]
    KillSwitchActive(String),

    #[error("invalid order: {0}")]
    InvalidRequest(String),

    /// Non-transient rejection; not retried.
    #[error("rejected: {0}")]
    Rejected(ExchangeError),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ExchangeError },

    #[error("unknown order {0}")]
    UnknownOrder(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<RetryError> for OrderError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Fatal(e) => OrderError::Rejected(e),
            RetryError::Exhausted { attempts, last } => OrderError::RetriesExhausted { attempts, last },
        }
    }
}

/// One logical order submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub category: Category,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    /// Generated when absent; reuse it to retry the same logical order.
    pub idempotency_key: Option<String>,
    /// Reduce-only orders pass the kill switch.
    pub reduce_only: bool,
}

impl SubmitRequest {
    pub fn market(category: Category, symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            category,
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            idempotency_key: None,
            reduce_only: false,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// How to address an order for cancellation.
#[derive(Debug, Clone, Copy)]
pub enum OrderRef<'a> {
    Id(&'a str),
    Key(&'a str),
}

/// Places and cancels orders idempotently and records them locally.
pub struct OrderManager {
    exchange: Arc<dyn Exchange>,
    storage: Arc<dyn Storage>,
    kill_switch: Arc<KillSwitch>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl OrderManager {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        storage: Arc<dyn Storage>,
        kill_switch: Arc<KillSwitch>,
        retry: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            exchange,
            storage,
            kill_switch,
            retry,
            attempt_timeout,
        }
    }

    /// Submits an order. The idempotency key is fixed before the first
    /// network call and reused by every retry, so one logical request never
    /// yields two exchange orders.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Order, OrderError> {
        validate(&request)?;

        if !request.reduce_only {
            if let Some(record) = self.kill_switch.status().await? {
                warn!(symbol = %request.symbol, reason = %record.reason, "order blocked by kill switch");
                return Err(OrderError::KillSwitchActive(record.reason));
            }
        }

        let key = request.idempotency_key.clone().unwrap_or_else(new_key);

        if let Some(existing) = self.storage.get_order_by_key(&key).await? {
            info!(
                key = %key,
                order_id = %existing.order_id,
                status = %existing.status,
                "idempotency key already recorded, not resubmitting"
            );
            return Ok(existing);
        }

        let exchange_request = OrderRequest {
            category: request.category,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            idempotency_key: key.clone(),
            reduce_only: request.reduce_only,
        };

        let result = with_retry(&self.retry, self.attempt_timeout, "place_order", || {
            self.exchange.place_order(&exchange_request)
        })
        .await;

        let order = match result {
            Ok(ack) => {
                let now = Utc::now();
                Order {
                    order_id: ack.order_id,
                    idempotency_key: Some(key.clone()),
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
                }
            }
            Err(RetryError::Fatal(ExchangeError::DuplicateOrder(_))) => {
                // An earlier attempt reached the exchange but its ack was lost.
                self.recover_duplicate(&exchange_request).await?
            }
            Err(err) => {
                let err = OrderError::from(err);
                error!(
                    symbol = %request.symbol,
                    side = %request.side,
                    order_type = %request.order_type,
                    quantity = %request.quantity,
                    price = ?request.price,
                    key = %key,
                    reduce_only = request.reduce_only,
                    error = %err,
                    "order submission failed"
                );
                return Err(err);
            }
        };

        self.persist_new(&order).await?;

        info!(
            order_id = %order.order_id,
            key = %key,
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            quantity = %order.quantity,
            price = ?order.price,
            reduce_only = order.reduce_only,
            "order placed"
        );
        Ok(order)
    }

    async fn recover_duplicate(&self, request: &OrderRequest) -> Result<Order, OrderError> {
        let lookup = with_retry(&self.retry, self.attempt_timeout, "order_by_key", || {
            self.exchange
                .order_by_key(request.category, &request.symbol, &request.idempotency_key)
        })
        .await?;

        match lookup {
            Some(order) => {
                warn!(
                    key = %request.idempotency_key,
                    order_id = %order.order_id,
                    "exchange already holds this key, adopting its order"
                );
                Ok(order)
            }
            None => Err(OrderError::Rejected(ExchangeError::DuplicateOrder(
                request.idempotency_key.clone(),
            ))),
        }
    }

    async fn persist_new(&self, order: &Order) -> Result<(), OrderError> {
        match self.storage.insert_order(order).await {
            Ok(()) => Ok(()),
            // Reconciliation may have mirrored the order first.
            Err(StorageError::Duplicate(_)) => Ok(self.storage.upsert_order(order).await?),
            Err(e) => Err(e.into()),
        }
    }

    /// Cancels one order. An order the exchange no longer knows is marked
    /// cancelled locally.
    pub async fn cancel(&self, target: OrderRef<'_>) -> Result<Order, OrderError> {
        let local = match target {
            OrderRef::Id(id) => self.storage.get_order(id).await?,
            OrderRef::Key(key) => self.storage.get_order_by_key(key).await?,
        };
        let mut order = local.ok_or_else(|| {
            OrderError::UnknownOrder(match target {
                OrderRef::Id(id) | OrderRef::Key(id) => id.to_string(),
            })
        })?;

        if order.status.is_terminal() {
            return Ok(order);
        }

        let result = with_retry(&self.retry, self.attempt_timeout, "cancel_order", || {
            self.exchange
                .cancel_order(order.category, &order.symbol, &order.order_id)
        })
        .await;

        match result {
            Ok(()) => info!(order_id = %order.order_id, symbol = %order.symbol, "order cancelled"),
            Err(RetryError::Fatal(ExchangeError::OrderNotFound(_))) => warn!(
                order_id = %order.order_id,
                "order unknown to exchange, marking cancelled"
            ),
            Err(err) => {
                let err = OrderError::from(err);
                error!(order_id = %order.order_id, error = %err, "cancel failed");
                return Err(err);
            }
        }

        self.storage
            .update_order_status(&order.order_id, OrderStatus::Cancelled, order.filled_quantity)
            .await?;
        order.status = OrderStatus::Cancelled;
        Ok(order)
    }

    /// Cancels every open order (optionally one symbol) and marks local
    /// active orders cancelled. Returns the exchange's count.
    pub async fn cancel_all(&self, category: Category, symbol: Option<&str>) -> Result<usize, OrderError> {
        let cancelled = with_retry(&self.retry, self.attempt_timeout, "cancel_all_orders", || {
            self.exchange.cancel_all_orders(category, symbol)
        })
        .await
        .map_err(|e| {
            let err = OrderError::from(e);
            error!(symbol = ?symbol, error = %err, "cancel all failed");
            err
        })?;

        let mut marked = 0;
        for order in self.storage.active_orders().await? {
            if symbol.is_some_and(|s| s != order.symbol) {
                continue;
            }
            self.storage
                .update_order_status(&order.order_id, OrderStatus::Cancelled, order.filled_quantity)
                .await?;
            marked += 1;
        }

        warn!(symbol = ?symbol, exchange_cancelled = cancelled, local_marked = marked, "all orders cancelled");
        Ok(cancelled)
    }
}

fn validate(request: &SubmitRequest) -> Result<(), OrderError> {
    if request.symbol.is_empty() {
        return Err(OrderError::InvalidRequest("symbol is required".into()));
    }
    if request.quantity <= Decimal::ZERO {
        return Err(OrderError::InvalidRequest(format!(
            "quantity {} must be positive",
            request.quantity
        )));
    }
    match (request.order_type, request.price) {
        (OrderType::Limit, None) => Err(OrderError::InvalidRequest("limit order needs a price".into())),
        (_, Some(p)) if p <= Decimal::ZERO => {
            Err(OrderError::InvalidRequest(format!("price {} must be positive", p)))
        }
        _ => Ok(()),
    }
}
