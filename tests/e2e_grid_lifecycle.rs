//! End-to-end grid lifecycle scenarios driven against `MockExchange`, mirroring the
//! teacher's `tests/e2e_trading_flow.rs` style: build the real application graph, inject
//! price events, sleep to let the actor mailboxes drain, then assert on observable state.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::sleep;

use gridcore::application::controller::Controller;
use gridcore::application::risk_supervisor::RiskConfig;
use gridcore::domain::errors::CoreError;
use gridcore::domain::grid::types::GridParameters;
use gridcore::domain::ports::Exchange;
use gridcore::infrastructure::mock_exchange::MockExchange;
use gridcore::infrastructure::store::NullStore;

const SETTLE: Duration = Duration::from_millis(60);

fn lenient_risk_config() -> RiskConfig {
    RiskConfig {
        max_drawdown_pct: dec!(99),
        max_api_error_pct: dec!(99),
        volatility_threshold_pct: dec!(99),
        volatility_breaker_count: 99,
        max_position_pct: dec!(99),
        equity_poll_interval: Duration::from_secs(3600),
        ..RiskConfig::default()
    }
}

fn six_level_params(symbol: &str, stop_loss: Option<Decimal>) -> GridParameters {
    GridParameters {
        symbol: symbol.to_string(),
        lower_price: dec!(90000),
        upper_price: dec!(96000),
        grid_count: 6,
        total_investment: dec!(6000),
        stop_loss,
        take_profit: None,
        btc_filter_enabled: false,
        fee_bps: 0,
    }
}

async fn harness(symbol: &str) -> (Arc<Controller>, Arc<MockExchange>) {
    let exchange = Arc::new(MockExchange::new(vec![symbol.to_string()], dec!(100_000), 7));
    let (controller, kill_rx) = Controller::new(
        exchange.clone(),
        Arc::new(NullStore),
        lenient_risk_config(),
        50,
        Duration::from_secs(5),
    );
    tokio::spawn(controller.clone().run_kill_listener(kill_rx));
    (controller, exchange)
}

/// Scenario 1: cold start, monotonic drop then rise. Each tick moves exactly one grid
/// spacing so exactly one level transitions per step, keeping the expected counts exact.
#[tokio::test]
async fn cold_start_drop_then_rise_nets_positive_pnl() {
    let symbol = "GRIDUSDT";
    let (controller, exchange) = harness(symbol).await;
    controller.deploy(six_level_params(symbol, Some(dec!(80000)))).await.unwrap();

    exchange.set_price(symbol, dec!(95750)).await;
    controller.broadcast_tick(symbol, dec!(95750));
    sleep(SETTLE).await;

    let start_result = controller.start(symbol).await.unwrap();
    assert_eq!(start_result.orders_placed, 5, "levels 0..4 should get initial buys below the crossing rung");

    for price in [dec!(94500), dec!(93500), dec!(92500)] {
        exchange.set_price(symbol, price).await;
        controller.broadcast_tick(symbol, price);
        sleep(SETTLE).await;
    }
    let mid = controller.grid_snapshot(symbol).await.unwrap();
    assert_eq!(mid.total_buys, 3, "one buy should fill per spacing-sized downward step");

    for price in [dec!(93500), dec!(94500), dec!(95500)] {
        exchange.set_price(symbol, price).await;
        controller.broadcast_tick(symbol, price);
        sleep(SETTLE).await;
    }

    let snap = controller.grid_snapshot(symbol).await.unwrap();
    assert_eq!(snap.total_buys, 3);
    assert_eq!(snap.total_sells, 3, "every filled level should round-trip back to a sell on the rise");
    assert!(snap.realized_pnl > Decimal::ZERO, "a full buy-low/sell-high cycle with zero fees must be profitable");
    assert!(!snap.stop_loss_tripped);
}

/// Scenario 2: stop-loss trip is sticky and blocks further starts until acknowledged.
#[tokio::test]
async fn stop_loss_trip_blocks_restart() {
    let symbol = "SLUSDT";
    let (controller, exchange) = harness(symbol).await;
    controller.deploy(six_level_params(symbol, Some(dec!(89000)))).await.unwrap();

    exchange.set_price(symbol, dec!(95750)).await;
    controller.broadcast_tick(symbol, dec!(95750));
    sleep(SETTLE).await;
    controller.start(symbol).await.unwrap();

    exchange.set_price(symbol, dec!(88500)).await;
    controller.broadcast_tick(symbol, dec!(88500));
    sleep(SETTLE).await;

    let snap = controller.grid_snapshot(symbol).await.unwrap();
    assert!(snap.stop_loss_tripped);

    let err = controller.start(symbol).await.unwrap_err();
    assert!(matches!(err, CoreError::StopLossTripped { .. }));

    controller.acknowledge_stop_loss(symbol).await.unwrap();
    let snap = controller.grid_snapshot(symbol).await.unwrap();
    assert!(!snap.stop_loss_tripped);
}

/// Scenario 5: rebalance cancels every cancellable order, then places a fresh initial set
/// at the (unchanged) current price.
#[tokio::test]
async fn rebalance_cancels_then_replaces_orders() {
    let symbol = "REBUSDT";
    let (controller, exchange) = harness(symbol).await;
    controller.deploy(six_level_params(symbol, Some(dec!(80000)))).await.unwrap();

    exchange.set_price(symbol, dec!(95750)).await;
    controller.broadcast_tick(symbol, dec!(95750));
    sleep(SETTLE).await;
    let start_result = controller.start(symbol).await.unwrap();
    assert_eq!(start_result.orders_placed, 5);

    let result = controller.rebalance(symbol).await.unwrap();
    assert_eq!(result.orders_cancelled, 5, "every resting buy is cancellable pre-rebalance");
    assert_eq!(result.orders_placed, 5, "price is unchanged, so the same initial set re-places");

    let snap = controller.grid_snapshot(symbol).await.unwrap();
    assert_eq!(snap.status, gridcore::application::grid_worker::WorkerStatusWire::Running);
}

/// Scenario 6: crash-restart reconciliation adopts matching resting orders and cancels a
/// stray order left over from a previous process.
#[tokio::test]
async fn reconciliation_adopts_matches_and_cancels_stray() {
    let symbol = "RECUSDT";
    let exchange = Arc::new(MockExchange::new(vec![symbol.to_string()], dec!(100_000), 3));

    // current_prices defaults to zero, so these placements never immediately cross.
    exchange.set_price(symbol, dec!(130000)).await;
    let legacy0 = exchange.place_limit(symbol, gridcore::domain::grid::types::OrderSide::Buy, dec!(90500), dec!(0.01), "legacy-0").await.unwrap();
    let legacy1 = exchange.place_limit(symbol, gridcore::domain::grid::types::OrderSide::Buy, dec!(91500), dec!(0.01), "legacy-1").await.unwrap();
    let stray = exchange.place_limit(symbol, gridcore::domain::grid::types::OrderSide::Buy, dec!(120000), dec!(0.01), "legacy-stray").await.unwrap();

    let (controller, kill_rx) = Controller::new(
        exchange.clone(),
        Arc::new(NullStore),
        lenient_risk_config(),
        50,
        Duration::from_secs(5),
    );
    tokio::spawn(controller.clone().run_kill_listener(kill_rx));

    controller.deploy(six_level_params(symbol, None)).await.unwrap();
    controller.broadcast_tick(symbol, dec!(95750));
    sleep(SETTLE).await;

    let result = controller.start(symbol).await.unwrap();
    assert_eq!(result.orders_cancelled, 1, "the stray order has no matching level");
    assert_eq!(result.orders_placed, 3, "levels 2..4 had no resting order to adopt");

    let open = exchange.open_orders(symbol).await.unwrap();
    assert_eq!(open.len(), 5, "two adopted + three newly placed = five open buys");
    assert!(!open.iter().any(|o| o.order_id == stray));

    let legacy0_status = exchange.order_status(&legacy0).await.unwrap();
    assert_eq!(legacy0_status.state, gridcore::domain::ports::OrderState::New);
    let legacy1_status = exchange.order_status(&legacy1).await.unwrap();
    assert_eq!(legacy1_status.state, gridcore::domain::ports::OrderState::New);
    let stray_status = exchange.order_status(&stray).await.unwrap();
    assert_eq!(stray_status.state, gridcore::domain::ports::OrderState::Cancelled);
}
