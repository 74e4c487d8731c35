//! Tests for the protection manager.

use super::*;
use crate::config::{CircuitBreakerConfig, ProtectionConfig};
use crate::domain::{Category, PositionSide};
use crate::exchanges::ExchangeError;
use crate::exchanges::mock::MockExchange;
use crate::safety::{BreakerState, CircuitBreaker};
use crate::testutil::{d, temp_storage};
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    exchange: Arc<MockExchange>,
    breaker: Arc<CircuitBreaker>,
    manager: ProtectionManager,
}

async fn fixture(config: ProtectionConfig) -> Fixture {
    let (dir, storage) = temp_storage().await;
    let exchange = Arc::new(MockExchange::new());
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let manager = ProtectionManager::new(
        config,
        Category::Linear,
        exchange.clone(),
        storage,
        breaker.clone(),
    );
    Fixture {
        _dir: dir,
        exchange,
        breaker,
        manager,
    }
}

async fn open_long(f: &Fixture, atr: Option<Decimal>) -> ProtectiveLevels {
    let levels = calculate_levels(
        f.manager.config(),
        "pos-1",
        "BTCUSDT",
        PositionSide::Long,
        d("30000"),
        d("0.5"),
        atr,
    );
    f.manager.register(levels.clone()).await.unwrap();
    levels
}

// ==================== Placement ====================

#[tokio::test]
async fn test_native_placement_when_supported() {
    let f = fixture(ProtectionConfig::default()).await;
    open_long(&f, Some(d("500"))).await;

    let mode = f.manager.place_protective_orders("pos-1").await.unwrap();
    assert_eq!(mode, ProtectionMode::Native);

    let stops = f.exchange.trading_stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].stop_loss, Some(d("29250")));
    assert_eq!(stops[0].take_profit, Some(d("31000")));
}

#[tokio::test]
async fn test_unsupported_native_falls_back_to_virtual() {
    let f = fixture(ProtectionConfig::default()).await;
    f.exchange
        .set_trading_stop_error(Some(ExchangeError::Unsupported("spot".into())));
    open_long(&f, Some(d("500"))).await;

    let mode = f.manager.place_protective_orders("pos-1").await.unwrap();
    assert_eq!(mode, ProtectionMode::Virtual);
    assert!(f.breaker.can_trade());
    assert_eq!(f.manager.get("pos-1").await.unwrap().mode, ProtectionMode::Virtual);
}

#[tokio::test]
async fn test_no_protection_path_trips_breaker() {
    let config = ProtectionConfig {
        virtual_enabled: false,
        ..ProtectionConfig::default()
    };
    let f = fixture(config).await;
    f.exchange.set_trading_stop_error(Some(ExchangeError::Rejected {
        code: 10001,
        message: "bad".into(),
    }));
    open_long(&f, Some(d("500"))).await;

    let err = f.manager.place_protective_orders("pos-1").await.unwrap_err();
    assert!(matches!(err, ProtectionError::Unprotected { .. }));
    assert_eq!(f.breaker.state(), BreakerState::KillSwitch);
}

#[tokio::test]
async fn test_both_paths_disabled_is_unprotected() {
    let config = ProtectionConfig {
        native_enabled: false,
        virtual_enabled: false,
        ..ProtectionConfig::default()
    };
    let f = fixture(config).await;
    open_long(&f, None).await;

    assert!(f.manager.place_protective_orders("pos-1").await.is_err());
    assert!(!f.breaker.can_trade());
    assert!(f.exchange.trading_stops().is_empty());
}

// ==================== Virtual monitoring ====================

#[tokio::test]
async fn test_virtual_trigger_fires_once() {
    let config = ProtectionConfig {
        native_enabled: false,
        ..ProtectionConfig::default()
    };
    let f = fixture(config).await;
    open_long(&f, Some(d("500"))).await;
    f.manager.place_protective_orders("pos-1").await.unwrap();

    let none = f
        .manager
        .check_virtual_levels("pos-1", d("30000"), d("0.5"))
        .await
        .unwrap();
    assert!(none.is_none());

    let trigger = f
        .manager
        .check_virtual_levels("pos-1", d("29200"), d("0.5"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(trigger.kind, TriggerKind::StopLoss);
    assert_eq!(trigger.level, d("29250"));
    assert_eq!(trigger.quantity, d("0.5"));

    let again = f
        .manager
        .check_virtual_levels("pos-1", d("29000"), d("0.5"))
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn test_native_positions_never_trigger_virtually() {
    let f = fixture(ProtectionConfig::default()).await;
    open_long(&f, Some(d("500"))).await;
    f.manager.place_protective_orders("pos-1").await.unwrap();

    let result = f
        .manager
        .check_virtual_levels("pos-1", d("20000"), d("0.5"))
        .await
        .unwrap();
    assert!(result.is_none());
}

// ==================== Trailing stop ====================

#[tokio::test]
async fn test_trailing_stop_is_a_ratchet() {
    let config = ProtectionConfig {
        native_enabled: false,
        ..ProtectionConfig::default()
    };
    let f = fixture(config).await;
    open_long(&f, Some(d("500"))).await;
    f.manager.place_protective_orders("pos-1").await.unwrap();

    let up = f.manager.update_trailing_stop("pos-1", d("30500")).await.unwrap();
    assert!(up.updated);
    assert_eq!(up.stop_price, d("30000"));

    let down = f.manager.update_trailing_stop("pos-1", d("30200")).await.unwrap();
    assert!(!down.updated);
    assert_eq!(down.stop_price, d("30000"));

    let mut last = d("30000");
    for price in ["30100", "31000", "29000", "30900", "31500", "31400"] {
        let r = f.manager.update_trailing_stop("pos-1", d(price)).await.unwrap();
        assert!(r.stop_price >= last, "stop loosened at {}", price);
        assert_eq!(r.updated, r.stop_price > last);
        last = r.stop_price;
    }
    assert_eq!(last, d("31000"));
}

#[tokio::test]
async fn test_trailing_stop_short_only_moves_down() {
    let f = fixture(ProtectionConfig::default()).await;
    let levels = calculate_levels(
        f.manager.config(),
        "pos-s",
        "ETHUSDT",
        PositionSide::Short,
        d("2000"),
        d("1"),
        Some(d("20")),
    );
    f.manager.register(levels).await.unwrap();
    f.manager.place_protective_orders("pos-s").await.unwrap();

    // stop starts at 2030
    let r = f.manager.update_trailing_stop("pos-s", d("1990")).await.unwrap();
    assert!(r.updated);
    assert_eq!(r.stop_price, d("2010"));

    let r = f.manager.update_trailing_stop("pos-s", d("2005")).await.unwrap();
    assert!(!r.updated);

    // native mode pushes the new stop
    let pushed = f.exchange.trading_stops();
    assert_eq!(pushed.last().unwrap().stop_loss, Some(d("2010")));
    assert_eq!(pushed.last().unwrap().take_profit, None);
}

// ==================== Partial fills and removal ====================

#[tokio::test]
async fn test_partial_fill_keeps_prices() {
    let f = fixture(ProtectionConfig::default()).await;
    let original = open_long(&f, Some(d("500"))).await;

    f.manager
        .handle_partial_fill("pos-1", d("0.2"), d("0.3"))
        .await
        .unwrap();
    let l = f.manager.get("pos-1").await.unwrap();
    assert_eq!(l.quantity, d("0.3"));
    assert_eq!(l.stop_price, original.stop_price);
    assert_eq!(l.take_profit_price, original.take_profit_price);

    f.manager
        .handle_partial_fill("pos-1", d("0.3"), Decimal::ZERO)
        .await
        .unwrap();
    assert!(f.manager.get("pos-1").await.is_none());
}

#[tokio::test]
async fn test_levels_survive_reload() {
    let (dir, storage) = temp_storage().await;
    let exchange = Arc::new(MockExchange::new());
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let manager = ProtectionManager::new(
        ProtectionConfig::default(),
        Category::Linear,
        exchange.clone(),
        storage.clone(),
        breaker.clone(),
    );
    let levels = calculate_levels(
        manager.config(),
        "pos-9",
        "BTCUSDT",
        PositionSide::Long,
        d("30000"),
        d("1"),
        Some(d("100")),
    );
    manager.register(levels).await.unwrap();
    manager.place_protective_orders("pos-9").await.unwrap();

    let restored = ProtectionManager::new(
        ProtectionConfig::default(),
        Category::Linear,
        exchange,
        storage,
        breaker,
    );
    assert_eq!(restored.load().await.unwrap(), 1);
    assert_eq!(restored.get("pos-9").await.unwrap().mode, ProtectionMode::Native);

    assert_eq!(restored.remove_for_symbol("BTCUSDT").await.unwrap(), 1);
    assert!(restored.all().await.is_empty());
    drop(dir);
}
