//! End-to-end tests of the decision loop against the in-memory exchange.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::*;
use crate::config::Config;
use crate::domain::{MarketUpdate, OrderStatus, Position, PositionSide, Signal};
use crate::exchanges::ExchangeError;
use crate::exchanges::mock::MockExchange;
use crate::orders::exit_key;
use crate::protection::ProtectionMode;
use crate::reconciliation::{PassOutcome, ReconciliationReport};
use crate::risk::Decision;
use crate::safety::BreakerState;
use crate::storage::Storage;
use crate::testutil::{d, temp_storage};

const CONFIG: &str = r#"
app:
  name: trade-guard-test
  env: development
exchange:
  name: mock
symbols:
  - BTCUSDT
execution:
  timeout: 1s
  retry:
    max_attempts: 2
    initial_delay: 1ms
    max_delay: 2ms
bot:
  poll_interval: 50ms
  risk_monitor_interval: 1h
  shutdown_timeout: 2s
"#;

struct Fixture {
    _dir: TempDir,
    exchange: Arc<MockExchange>,
    storage: Arc<dyn Storage>,
    bot: Bot,
}

fn test_config() -> Config {
    let mut cfg: Config = serde_yaml::from_str(CONFIG).unwrap();
    cfg.kill_switch.reset_token = "token".to_string();
    cfg
}

async fn fixture() -> Fixture {
    let (dir, storage) = temp_storage().await;
    let exchange = Arc::new(MockExchange::new());
    let bot = Bot::new(
        BotConfig {
            app_config: test_config(),
            version: "test".to_string(),
        },
        exchange.clone(),
        storage.clone(),
    )
    .await
    .unwrap();
    Fixture {
        _dir: dir,
        exchange,
        storage,
        bot,
    }
}

fn long_signal(entry: &str, stop: &str) -> Signal {
    Signal {
        symbol: "BTCUSDT".to_string(),
        direction: PositionSide::Long,
        entry_price: d(entry),
        stop_price: d(stop),
        take_profit: None,
        strategy_id: "breakout".to_string(),
        confidence: 0.7,
    }
}

fn market(price: &str) -> MarketUpdate {
    MarketUpdate {
        symbol: "BTCUSDT".to_string(),
        price: d(price),
        atr: None,
    }
}

fn empty_report() -> ReconciliationReport {
    ReconciliationReport {
        started_at: Utc::now(),
        positions: PassOutcome::Completed { mutations: 0 },
        executions: PassOutcome::Completed { mutations: 0 },
        orders: PassOutcome::Completed { mutations: 0 },
        closed_positions: Vec::new(),
        escalated: false,
    }
}

// ==================== Entries ====================

#[tokio::test]
async fn test_signal_places_protected_entry() {
    let f = fixture().await;

    let outcome = f.bot.controller.handle_signal(long_signal("30000", "29700")).await.unwrap();

    let SignalOutcome::Submitted { order_id, quantity, protection } = outcome else {
        panic!("expected submission, got {:?}", outcome);
    };
    // 1% of 10000 over a 300 stop distance
    assert_eq!(quantity, d("0.333"));
    assert_eq!(protection, Some(ProtectionMode::Native));

    let order = f.storage.get_order(&order_id).await.unwrap().unwrap();
    assert_eq!(order.quantity, d("0.333"));
    assert!(!order.reduce_only);

    // no ATR yet: 2% / 3% fallback
    let levels = f.bot.controller.protection.get(&order_id).await.unwrap();
    assert_eq!(levels.stop_price, d("29400"));
    assert_eq!(levels.take_profit_price, d("30900"));
    assert_eq!(f.exchange.trading_stops().len(), 1);
    assert_eq!(f.bot.stats().await.orders_submitted, 1);
}

#[tokio::test]
async fn test_signal_target_and_atr_shape_levels() {
    let f = fixture().await;
    f.bot
        .controller
        .handle_market(MarketUpdate {
            atr: Some(d("500")),
            ..market("30000")
        })
        .await
        .unwrap();

    let signal = Signal {
        take_profit: Some(d("31500")),
        ..long_signal("30000", "29700")
    };
    let SignalOutcome::Submitted { order_id, .. } = f.bot.controller.handle_signal(signal).await.unwrap() else {
        panic!("expected submission");
    };

    let levels = f.bot.controller.protection.get(&order_id).await.unwrap();
    assert_eq!(levels.stop_price, d("29250"));
    assert_eq!(levels.take_profit_price, d("31500"));
}

#[tokio::test]
async fn test_unconfigured_symbol_is_skipped() {
    let f = fixture().await;
    let signal = Signal {
        symbol: "DOGEUSDT".to_string(),
        ..long_signal("0.1", "0.09")
    };

    let outcome = f.bot.controller.handle_signal(signal).await.unwrap();
    assert!(matches!(outcome, SignalOutcome::Skipped(_)));
    assert_eq!(f.exchange.place_calls(), 0);
}

#[tokio::test]
async fn test_one_position_per_symbol() {
    let f = fixture().await;
    f.bot.controller.handle_signal(long_signal("30000", "29700")).await.unwrap();

    let second = f.bot.controller.handle_signal(long_signal("30000", "29700")).await.unwrap();
    assert!(matches!(second, SignalOutcome::Skipped(reason) if reason.contains("already has an open position")));
    assert_eq!(f.exchange.place_calls(), 1);
}

#[tokio::test]
async fn test_unprotected_entry_trips_breaker() {
    let (dir, storage) = temp_storage().await;
    let exchange = Arc::new(MockExchange::new());
    let mut cfg = test_config();
    cfg.protection.virtual_enabled = false;
    let bot = Bot::new(
        BotConfig {
            app_config: cfg,
            version: "test".to_string(),
        },
        exchange.clone(),
        storage.clone(),
    )
    .await
    .unwrap();
    exchange.set_trading_stop_error(Some(ExchangeError::Server { code: 10016, message: "down".into() }));

    let outcome = bot.controller.handle_signal(long_signal("30000", "29700")).await.unwrap();
    assert!(matches!(outcome, SignalOutcome::Submitted { protection: None, .. }));
    assert_eq!(bot.controller.breaker.state(), BreakerState::KillSwitch);

    // the next poll copies the trip into the persisted switch
    bot.controller.poll().await.unwrap();
    assert!(bot.controller.kill_switch.is_active().await.unwrap());
    drop(dir);
}

fn btc_long(qty: &str, entry: &str) -> Position {
    Position {
        symbol: "BTCUSDT".to_string(),
        side: PositionSide::Long,
        quantity: d(qty),
        entry_price: d(entry),
        unrealized_pnl: d("0"),
        updated_at: Utc::now(),
    }
}

async fn reconcile(f: &Fixture) {
    let report = f.bot.controller.reconciliation.run_pass().await;
    f.bot.controller.apply_report(report).await.unwrap();
}

#[tokio::test]
async fn test_entry_with_lost_ack_is_protected_once_seen() {
    let f = fixture().await;
    f.exchange.fail_next_place(ExchangeError::Timeout("t1".into()));
    f.exchange.lose_next_ack(ExchangeError::Timeout("t2".into()));

    let outcome = f.bot.controller.handle_signal(long_signal("30000", "29700")).await.unwrap();
    assert!(matches!(outcome, SignalOutcome::Skipped(_)));
    assert_eq!(f.exchange.order_count(), 1);

    // the entry filled on the exchange after all
    f.exchange.set_positions(vec![btc_long("0.333", "30000")]);
    for _ in 0..3 {
        reconcile(&f).await;
        f.bot.controller.poll().await.unwrap();
    }

    let ids = f.bot.controller.protection.positions_for_symbol("BTCUSDT").await;
    assert_eq!(ids.len(), 1);
    let levels = f.bot.controller.protection.get(&ids[0]).await.unwrap();
    assert_eq!(levels.quantity, d("0.333"));
    assert_eq!(levels.stop_price, d("29400"));
    assert_eq!(levels.take_profit_price, d("30900"));
    assert_eq!(levels.mode, ProtectionMode::Native);
    assert_eq!(f.exchange.trading_stops().len(), 1);
    assert_eq!(f.bot.controller.breaker.state(), BreakerState::Active);
}

#[tokio::test]
async fn test_startup_adopts_position_and_exits_virtually() {
    let f = fixture().await;
    f.exchange
        .set_trading_stop_error(Some(ExchangeError::Unsupported("spot".into())));
    f.storage.upsert_position(&btc_long("0.5", "30000")).await.unwrap();
    f.exchange.set_positions(vec![btc_long("0.5", "30000")]);

    let (tx, rx) = mpsc::channel(1);
    drop(tx);
    f.bot.start(rx).await.unwrap();
    f.bot.stop().await.unwrap();

    let ids = f.bot.controller.protection.positions_for_symbol("BTCUSDT").await;
    assert_eq!(ids.len(), 1);
    let levels = f.bot.controller.protection.get(&ids[0]).await.unwrap();
    assert_eq!(levels.mode, ProtectionMode::Virtual);
    assert_eq!(levels.stop_price, d("29400"));

    f.bot.controller.handle_market(market("20000")).await.unwrap();
    assert!(f.bot.controller.protection.positions_for_symbol("BTCUSDT").await.is_empty());
    assert_eq!(f.bot.stats().await.exits_submitted, 1);

    // the exchange has not reported the close yet; the exited position is not re-adopted
    reconcile(&f).await;
    assert!(f.bot.controller.protection.positions_for_symbol("BTCUSDT").await.is_empty());
}

#[tokio::test]
async fn test_unprotectable_position_trips_breaker() {
    let (dir, storage) = temp_storage().await;
    let exchange = Arc::new(MockExchange::new());
    let mut cfg = test_config();
    cfg.protection.virtual_enabled = false;
    let bot = Bot::new(
        BotConfig {
            app_config: cfg,
            version: "test".to_string(),
        },
        exchange.clone(),
        storage.clone(),
    )
    .await
    .unwrap();
    exchange.set_trading_stop_error(Some(ExchangeError::Server { code: 10016, message: "down".into() }));
    exchange.set_positions(vec![btc_long("0.333", "30000")]);

    let report = bot.controller.reconciliation.run_pass().await;
    bot.controller.apply_report(report).await.unwrap();

    assert_eq!(bot.controller.breaker.state(), BreakerState::KillSwitch);
    bot.controller.poll().await.unwrap();
    assert!(bot.controller.kill_switch.is_active().await.unwrap());
    drop(dir);
}

#[tokio::test]
async fn test_position_without_entry_price_trips_breaker() {
    let f = fixture().await;
    f.exchange.set_positions(vec![btc_long("0.333", "0")]);

    reconcile(&f).await;

    assert_eq!(f.bot.controller.breaker.state(), BreakerState::KillSwitch);
    assert!(f.bot.controller.protection.positions_for_symbol("BTCUSDT").await.is_empty());
}

// ==================== Safety gates ====================

#[tokio::test]
async fn test_kill_switch_blocks_signals() {
    let f = fixture().await;
    f.bot.controller.kill_switch.activate("manual").await.unwrap();

    let outcome = f.bot.controller.handle_signal(long_signal("30000", "29700")).await.unwrap();
    assert!(matches!(outcome, SignalOutcome::Skipped(reason) if reason.contains("manual")));
    assert_eq!(f.exchange.place_calls(), 0);
}

#[tokio::test]
async fn test_breaker_halt_blocks_signals() {
    let f = fixture().await;
    f.bot.controller.breaker.trip("test", Utc::now());

    let outcome = f.bot.controller.handle_signal(long_signal("30000", "29700")).await.unwrap();
    assert!(matches!(outcome, SignalOutcome::Skipped(reason) if reason.contains("KILL_SWITCH")));
    assert_eq!(f.exchange.place_calls(), 0);
}

#[tokio::test]
async fn test_risk_deny_blocks_trade_only() {
    let f = fixture().await;

    // 5 BTC: leverage 15 and notional 150000, both breached below 2x
    let outcome = f.bot.controller.handle_signal(long_signal("30000", "29980")).await.unwrap();

    let SignalOutcome::Denied(decision) = outcome else {
        panic!("expected DENY, got {:?}", outcome);
    };
    assert!(matches!(decision, Decision::Deny { .. }));
    assert!(!f.bot.controller.kill_switch.is_active().await.unwrap());
    assert_eq!(f.exchange.place_calls(), 0);
}

#[tokio::test]
async fn test_risk_stop_activates_kill_switch() {
    let f = fixture().await;

    // 10 BTC: leverage 30 against a limit of 10
    let outcome = f.bot.controller.handle_signal(long_signal("30000", "29990")).await.unwrap();

    assert!(matches!(outcome, SignalOutcome::Stopped(Decision::Stop { .. })));
    assert!(f.bot.controller.kill_switch.is_active().await.unwrap());
    assert_eq!(f.exchange.cancel_all_calls(), 1);
    assert_eq!(f.exchange.place_calls(), 0);
    assert_eq!(f.bot.stats().await.signals_stopped, 1);
}

#[tokio::test]
async fn test_monitor_stops_on_excess_exposure() {
    let f = fixture().await;
    f.storage
        .upsert_position(&Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            quantity: d("10"),
            entry_price: d("30000"),
            unrealized_pnl: d("0"),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    f.bot.controller.monitor_risk().await.unwrap();
    assert!(f.bot.controller.kill_switch.is_active().await.unwrap());
}

// ==================== Virtual protection ====================

async fn virtual_entry(f: &Fixture) -> String {
    f.exchange
        .set_trading_stop_error(Some(ExchangeError::Unsupported("spot".into())));
    match f.bot.controller.handle_signal(long_signal("30000", "29700")).await.unwrap() {
        SignalOutcome::Submitted {
            order_id,
            protection: Some(ProtectionMode::Virtual),
            ..
        } => order_id,
        other => panic!("expected virtual protection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_virtual_stop_closes_position() {
    let f = fixture().await;
    let position_id = virtual_entry(&f).await;

    f.bot.controller.handle_market(market("29300")).await.unwrap();

    let exit = f
        .storage
        .get_order_by_key(&exit_key(&position_id, "stop_loss"))
        .await
        .unwrap()
        .unwrap();
    assert!(exit.reduce_only);
    assert_eq!(exit.quantity, d("0.333"));
    assert!(f.bot.controller.protection.get(&position_id).await.is_none());

    // (29300 - 30000) * 0.333
    assert_eq!(f.bot.controller.breaker.realized_today(Utc::now()), d("-233.1"));
    assert_eq!(f.bot.stats().await.exits_submitted, 1);
}

#[tokio::test]
async fn test_failed_exit_retried_with_same_key() {
    let f = fixture().await;
    let position_id = virtual_entry(&f).await;
    f.exchange
        .fail_next_place(ExchangeError::InsufficientFunds("margin".into()));

    f.bot.controller.handle_market(market("29300")).await.unwrap();
    assert!(f.bot.controller.protection.get(&position_id).await.is_some());

    f.bot.controller.poll().await.unwrap();

    assert!(f.bot.controller.protection.get(&position_id).await.is_none());
    assert_eq!(f.exchange.place_calls(), 3);
    assert!(
        f.storage
            .get_order_by_key(&exit_key(&position_id, "stop_loss"))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_price_advance_trails_stop() {
    let f = fixture().await;
    let position_id = virtual_entry(&f).await;

    f.bot.controller.handle_market(market("30800")).await.unwrap();

    // 2% of 30800 below the new price, target not reached
    let levels = f.bot.controller.protection.get(&position_id).await.unwrap();
    assert_eq!(levels.stop_price, d("30184"));
    assert!(!levels.tp_hit);
    assert_eq!(f.exchange.place_calls(), 1);
}

// ==================== Breaker and kill switch ====================

#[tokio::test]
async fn test_breaker_trip_is_audited_and_mirrored() {
    let f = fixture().await;
    f.bot.controller.breaker.trip("3 consecutive losses", Utc::now());

    f.bot.controller.poll().await.unwrap();

    assert!(f.bot.controller.kill_switch.is_active().await.unwrap());
    let audit = f.storage.audit_entries(BREAKER_AUDIT_COMPONENT).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].kind, "KILL_SWITCH");

    // operator reset of the persisted switch re-arms the breaker
    f.bot.controller.kill_switch.reset("token").await.unwrap();
    f.bot.controller.poll().await.unwrap();

    assert_eq!(f.bot.controller.breaker.state(), BreakerState::Active);
    let audit = f.storage.audit_entries(BREAKER_AUDIT_COMPONENT).await.unwrap();
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[1].kind, "ACTIVE");
}

// ==================== Reconciliation reports ====================

#[tokio::test]
async fn test_closed_position_drops_levels_and_records_pnl() {
    let f = fixture().await;
    let SignalOutcome::Submitted { order_id, .. } =
        f.bot.controller.handle_signal(long_signal("30000", "29700")).await.unwrap()
    else {
        panic!("expected submission");
    };
    f.exchange.set_price("BTCUSDT", d("29500"));

    let report = ReconciliationReport {
        closed_positions: vec![Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            quantity: d("0.333"),
            entry_price: d("30000"),
            unrealized_pnl: d("0"),
            updated_at: Utc::now(),
        }],
        ..empty_report()
    };
    f.bot.controller.apply_report(report).await.unwrap();

    assert!(f.bot.controller.protection.get(&order_id).await.is_none());
    assert_eq!(f.bot.controller.breaker.realized_today(Utc::now()), d("-166.5"));
    assert_eq!(f.bot.stats().await.reconciliation_passes, 1);
}

#[tokio::test]
async fn test_partial_close_shrinks_protected_quantity() {
    let f = fixture().await;
    let SignalOutcome::Submitted { order_id, .. } =
        f.bot.controller.handle_signal(long_signal("30000", "29700")).await.unwrap()
    else {
        panic!("expected submission");
    };
    f.storage
        .upsert_position(&Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            quantity: d("0.2"),
            entry_price: d("30000"),
            unrealized_pnl: d("0"),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    f.bot.controller.apply_report(empty_report()).await.unwrap();

    let levels = f.bot.controller.protection.get(&order_id).await.unwrap();
    assert_eq!(levels.quantity, d("0.2"));
    assert_eq!(levels.stop_price, d("29400"));
}

#[tokio::test]
async fn test_store_failure_in_report_is_fatal() {
    let f = fixture().await;
    let report = ReconciliationReport {
        orders: PassOutcome::Failed {
            error: "disk I/O error".to_string(),
            fatal: true,
        },
        ..empty_report()
    };

    let err = f.bot.controller.apply_report(report).await.unwrap_err();
    assert!(err.is_fatal());
}

// ==================== Configuration ====================

#[tokio::test]
async fn test_risk_overrides_read_from_store() {
    let (_dir, storage) = temp_storage().await;
    storage.config_set("risk.leverage.limit", "3").await.unwrap();

    let bot = Bot::new(
        BotConfig {
            app_config: test_config(),
            version: "test".to_string(),
        },
        Arc::new(MockExchange::new()),
        storage.clone(),
    )
    .await
    .unwrap();
    assert_eq!(bot.controller.risk.config().leverage.limit, d("3"));

    storage.config_set("risk.levrage.limit", "3").await.unwrap();
    let result = Bot::new(
        BotConfig {
            app_config: test_config(),
            version: "test".to_string(),
        },
        Arc::new(MockExchange::new()),
        storage,
    )
    .await;
    assert!(matches!(result, Err(BotError::Config(_))));
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_start_processes_inputs_until_closed() {
    let f = fixture().await;
    f.exchange.set_positions(vec![Position {
        symbol: "ETHUSDT".to_string(),
        side: PositionSide::Short,
        quantity: d("1"),
        entry_price: d("2000"),
        unrealized_pnl: d("0"),
        updated_at: Utc::now(),
    }]);

    let (tx, rx) = mpsc::channel(8);
    tx.send(BotInput::Market(market("30000"))).await.unwrap();
    tx.send(BotInput::Signal(long_signal("30000", "29700"))).await.unwrap();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(5), f.bot.start(rx))
        .await
        .unwrap()
        .unwrap();
    assert!(f.bot.is_running().await);

    // startup reconciliation mirrored the exchange position
    assert!(f.storage.get_position("ETHUSDT").await.unwrap().is_some());

    let stats = f.bot.stats().await;
    assert_eq!(stats.signals_received, 1);
    assert_eq!(stats.orders_submitted, 1);
    assert!(stats.reconciliation_passes >= 1);

    f.bot.stop().await.unwrap();
    assert!(!f.bot.is_running().await);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let f = fixture().await;
    let (tx, rx) = mpsc::channel(1);
    drop(tx);
    f.bot.start(rx).await.unwrap();

    let (_tx, rx) = mpsc::channel(1);
    assert!(matches!(f.bot.start(rx).await, Err(BotError::AlreadyRunning)));
    f.bot.stop().await.unwrap();
}

#[tokio::test]
async fn test_input_json_format() {
    let signal: BotInput = serde_json::from_str(
        r#"{"type":"signal","symbol":"BTCUSDT","direction":"long","entry_price":"30000","stop_price":"29500","strategy_id":"s1","confidence":0.5}"#,
    )
    .unwrap();
    assert!(matches!(signal, BotInput::Signal(s) if s.stop_price == d("29500") && s.take_profit.is_none()));

    let update: BotInput =
        serde_json::from_str(r#"{"type":"market","symbol":"BTCUSDT","price":"30100","atr":"480"}"#).unwrap();
    assert_eq!(
        update,
        BotInput::Market(MarketUpdate {
            symbol: "BTCUSDT".to_string(),
            price: d("30100"),
            atr: Some(d("480")),
        })
    );
}

#[tokio::test]
async fn test_halt_when_already_active_leaves_orders() {
    let f = fixture().await;
    f.bot.controller.handle_signal(long_signal("30000", "29700")).await.unwrap();
    f.bot.controller.kill_switch.activate("manual").await.unwrap();
    f.bot.controller.halt("manual").await.unwrap();

    // already active: no second cancel-all
    assert_eq!(f.exchange.cancel_all_calls(), 0);
    let active = f.storage.active_orders().await.unwrap();
    assert!(active.iter().all(|o| o.status == OrderStatus::New));
}
