//! Tests for the reconciliation service.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc, watch};

use super::*;
use crate::config::{CircuitBreakerConfig, ReconciliationConfig, RetryPolicy};
use crate::domain::{Category, Execution, Order, OrderSide, OrderStatus, OrderType, Position, PositionSide};
use crate::exchanges::ExchangeError;
use crate::exchanges::mock::MockExchange;
use crate::safety::{BreakerState, CircuitBreaker};
use crate::storage::Storage;
use crate::testutil::{d, temp_storage};

struct Fixture {
    _dir: TempDir,
    exchange: Arc<MockExchange>,
    storage: Arc<dyn Storage>,
    breaker: Arc<CircuitBreaker>,
    service: Arc<ReconciliationService>,
}

async fn fixture() -> Fixture {
    let (dir, storage) = temp_storage().await;
    let exchange = Arc::new(MockExchange::new());
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let service = Arc::new(ReconciliationService::new(
        ReconciliationConfig::default(),
        Category::Linear,
        exchange.clone(),
        storage.clone(),
        breaker.clone(),
        RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        },
        Duration::from_secs(1),
    ));
    Fixture {
        _dir: dir,
        exchange,
        storage,
        breaker,
        service,
    }
}

fn position(symbol: &str, side: PositionSide, qty: &str, entry: &str) -> Position {
    Position {
        symbol: symbol.to_string(),
        side,
        quantity: d(qty),
        entry_price: d(entry),
        unrealized_pnl: d("0"),
        updated_at: Utc::now(),
    }
}

fn order(id: &str, qty: &str) -> Order {
    let created = Utc::now() - chrono::TimeDelta::minutes(5);
    Order {
        order_id: id.to_string(),
        idempotency_key: Some(format!("key-{}", id)),
        category: Category::Linear,
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Limit,
        price: Some(d("30000")),
        quantity: d(qty),
        filled_quantity: d("0"),
        status: OrderStatus::New,
        reduce_only: false,
        created_at: created,
        updated_at: created,
    }
}

fn fill(id: &str, order_id: &str, qty: &str) -> Execution {
    Execution {
        execution_id: id.to_string(),
        order_id: order_id.to_string(),
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Buy,
        price: d("30000"),
        quantity: d(qty),
        fee: d("0.6"),
        is_maker: false,
        executed_at: Utc::now(),
    }
}

// ==================== Positions ====================

#[tokio::test]
async fn test_missing_local_position_is_recorded_once() {
    let f = fixture().await;
    f.exchange
        .set_positions(vec![position("BTCUSDT", PositionSide::Long, "0.5", "30000")]);

    let first = f.service.run_pass().await;
    assert_eq!(first.positions, PassOutcome::Completed { mutations: 1 });

    let local = f.storage.get_position("BTCUSDT").await.unwrap().unwrap();
    assert_eq!(local.quantity, d("0.5"));
    assert_eq!(local.side, PositionSide::Long);

    let second = f.service.run_pass().await;
    assert_eq!(second.mutations(), 0);
}

#[tokio::test]
async fn test_exchange_size_overwrites_local() {
    let f = fixture().await;
    f.storage
        .upsert_position(&position("BTCUSDT", PositionSide::Long, "0.3", "30000"))
        .await
        .unwrap();
    f.exchange
        .set_positions(vec![position("BTCUSDT", PositionSide::Long, "0.5", "30100")]);

    let report = f.service.run_pass().await;
    assert_eq!(report.positions.mutations(), 1);

    let local = f.storage.get_position("BTCUSDT").await.unwrap().unwrap();
    assert_eq!(local.quantity, d("0.5"));
    assert_eq!(local.entry_price, d("30100"));
}

#[tokio::test]
async fn test_difference_within_tolerance_is_not_drift() {
    let f = fixture().await;
    f.storage
        .upsert_position(&position("BTCUSDT", PositionSide::Long, "0.500000001", "30000"))
        .await
        .unwrap();
    f.exchange
        .set_positions(vec![position("BTCUSDT", PositionSide::Long, "0.5", "30000")]);

    let report = f.service.run_pass().await;
    assert_eq!(report.mutations(), 0);
}

#[tokio::test]
async fn test_position_closed_on_exchange_is_removed() {
    let f = fixture().await;
    f.storage
        .upsert_position(&position("ETHUSDT", PositionSide::Short, "2", "2000"))
        .await
        .unwrap();

    let report = f.service.run_pass().await;
    assert_eq!(report.closed_symbols(), vec!["ETHUSDT"]);
    assert_eq!(report.closed_positions[0].quantity, d("2"));
    assert!(f.storage.get_position("ETHUSDT").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unreadable_position_list_keeps_local_rows() {
    let f = fixture().await;
    f.storage
        .upsert_position(&position("BTCUSDT", PositionSide::Long, "0.5", "30000"))
        .await
        .unwrap();
    f.exchange.set_positions_error(Some(ExchangeError::Internal(
        "position BTCUSDT size: malformed decimal \"0.5x\"".into(),
    )));

    let report = f.service.run_pass().await;

    assert!(matches!(report.positions, PassOutcome::Failed { fatal: false, .. }));
    assert!(report.closed_positions.is_empty());
    let local = f.storage.get_position("BTCUSDT").await.unwrap().unwrap();
    assert_eq!(local.quantity, d("0.5"));
}

#[tokio::test]
async fn test_persistent_drift_trips_breaker() {
    let f = fixture().await;
    f.exchange
        .set_positions(vec![position("BTCUSDT", PositionSide::Long, "0.5", "30000")]);
    f.service.run_pass().await;

    // something keeps writing a wrong size between passes
    for pass in 1..=3 {
        f.storage
            .upsert_position(&position("BTCUSDT", PositionSide::Long, "0.2", "30000"))
            .await
            .unwrap();
        let report = f.service.run_pass().await;
        assert_eq!(report.escalated, pass == 3);
    }

    assert_eq!(f.breaker.state(), BreakerState::KillSwitch);
}

#[tokio::test]
async fn test_clean_pass_resets_drift_streak() {
    let f = fixture().await;
    f.exchange
        .set_positions(vec![position("BTCUSDT", PositionSide::Long, "0.5", "30000")]);

    for _ in 0..5 {
        f.storage
            .upsert_position(&position("BTCUSDT", PositionSide::Long, "0.2", "30000"))
            .await
            .unwrap();
        f.service.run_pass().await;
        // clean pass in between
        f.service.run_pass().await;
    }

    assert_eq!(f.breaker.state(), BreakerState::Active);
}

// ==================== Executions ====================

#[tokio::test]
async fn test_missed_fills_backfilled_without_duplicates() {
    let f = fixture().await;
    f.exchange.add_execution(fill("e-1", "o-1", "0.1"));
    f.exchange.add_execution(fill("e-2", "o-1", "0.1"));
    f.storage.insert_execution(&fill("e-1", "o-1", "0.1")).await.unwrap();

    let report = f.service.run_pass().await;
    assert_eq!(report.executions, PassOutcome::Completed { mutations: 1 });
    assert_eq!(f.storage.execution_count().await.unwrap(), 2);

    let again = f.service.run_pass().await;
    assert_eq!(again.executions.mutations(), 0);
    assert_eq!(f.storage.execution_count().await.unwrap(), 2);
}

// ==================== Orders ====================

#[tokio::test]
async fn test_unknown_exchange_order_is_inserted() {
    let f = fixture().await;
    f.exchange.insert_order(order("ex-9", "0.2"));

    let report = f.service.run_pass().await;
    assert_eq!(report.orders.mutations(), 1);

    let local = f.storage.get_order("ex-9").await.unwrap().unwrap();
    assert_eq!(local.status, OrderStatus::New);
    assert_eq!(local.idempotency_key.as_deref(), Some("key-ex-9"));
}

#[tokio::test]
async fn test_vanished_order_filled_when_fills_cover_it() {
    let f = fixture().await;
    f.storage.insert_order(&order("o-1", "0.2")).await.unwrap();
    f.exchange.add_execution(fill("e-1", "o-1", "0.1"));
    f.exchange.add_execution(fill("e-2", "o-1", "0.1"));

    f.service.run_pass().await;

    let local = f.storage.get_order("o-1").await.unwrap().unwrap();
    assert_eq!(local.status, OrderStatus::Filled);
    assert_eq!(local.filled_quantity, d("0.2"));
}

#[tokio::test]
async fn test_vanished_order_cancelled_without_fills() {
    let f = fixture().await;
    f.storage.insert_order(&order("o-2", "0.2")).await.unwrap();
    f.exchange.add_execution(fill("e-3", "o-2", "0.05"));

    f.service.run_pass().await;

    let local = f.storage.get_order("o-2").await.unwrap().unwrap();
    assert_eq!(local.status, OrderStatus::Cancelled);
    assert_eq!(local.filled_quantity, d("0.05"));
    assert!(f.storage.active_orders().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_order_placed_during_pass_is_left_alone() {
    let f = fixture().await;
    let mut fresh = order("o-new", "0.1");
    fresh.created_at = Utc::now() + chrono::TimeDelta::seconds(30);
    f.storage.insert_order(&fresh).await.unwrap();

    f.service.run_pass().await;

    let local = f.storage.get_order("o-new").await.unwrap().unwrap();
    assert_eq!(local.status, OrderStatus::New);
}

// ==================== Fault isolation ====================

#[tokio::test]
async fn test_failing_subroutine_does_not_stop_others() {
    let f = fixture().await;
    f.exchange
        .set_positions_error(Some(ExchangeError::Server { code: 10016, message: "down".into() }));
    f.exchange.add_execution(fill("e-1", "o-1", "0.1"));
    f.exchange.insert_order(order("ex-1", "0.1"));

    let report = f.service.run_pass().await;

    assert!(matches!(report.positions, PassOutcome::Failed { fatal: false, .. }));
    assert_eq!(report.executions.mutations(), 1);
    assert_eq!(report.orders.mutations(), 1);
    assert!(!report.has_fatal_failure());
}

// ==================== Loop ====================

#[tokio::test]
async fn test_loop_runs_on_demand_and_stops() {
    let f = fixture().await;
    let trigger = Arc::new(Notify::new());
    let (report_tx, mut report_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(f.service.clone().run(trigger.clone(), report_tx, shutdown_rx));

    f.exchange
        .set_positions(vec![position("BTCUSDT", PositionSide::Long, "0.5", "30000")]);
    trigger.notify_one();

    let report = tokio::time::timeout(Duration::from_secs(5), report_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.positions.mutations(), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
