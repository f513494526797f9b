//! End-to-end risk-supervisor and webhook-routing scenarios, same harness style as
//! `e2e_grid_lifecycle.rs`.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::time::sleep;

use gridcore::application::alert_router::{AlertRouter, WebhookAlert};
use gridcore::application::controller::Controller;
use gridcore::application::risk_supervisor::RiskConfig;
use gridcore::domain::errors::CoreError;
use gridcore::domain::grid::types::GridParameters;
use gridcore::infrastructure::mock_exchange::MockExchange;
use gridcore::infrastructure::store::NullStore;
use hmac::Mac;
use sha2::Sha256;

type HmacSha256 = hmac::Hmac<Sha256>;

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

const SETTLE: Duration = Duration::from_millis(60);

fn minimal_params(symbol: &str) -> GridParameters {
    GridParameters {
        symbol: symbol.to_string(),
        lower_price: dec!(90),
        upper_price: dec!(110),
        grid_count: 2,
        total_investment: dec!(100),
        stop_loss: None,
        take_profit: None,
        btc_filter_enabled: false,
        fee_bps: 0,
    }
}

/// Scenario 3: two symbols each swing past the volatility threshold; once both breakers
/// are active the kill switch latches and every worker is blocked from starting.
#[tokio::test]
async fn volatility_breakers_on_two_symbols_trip_kill_switch() {
    let exchange = Arc::new(MockExchange::new(vec!["AAA".into(), "BBB".into()], dec!(10_000), 11));
    let risk_config = RiskConfig {
        volatility_threshold_pct: dec!(5),
        volatility_breaker_count: 2,
        equity_poll_interval: Duration::from_secs(3600),
        ..RiskConfig::default()
    };
    let (controller, kill_rx) = Controller::new(exchange, Arc::new(NullStore), risk_config, 50, Duration::from_secs(5));
    tokio::spawn(controller.clone().run_kill_listener(kill_rx));

    controller.deploy(minimal_params("AAA")).await.unwrap();
    controller.deploy(minimal_params("BBB")).await.unwrap();

    let swing = [dec!(100), dec!(100), dec!(100), dec!(100), dec!(100), dec!(120)];
    for price in swing {
        controller.broadcast_tick("AAA", price);
        sleep(Duration::from_millis(10)).await;
    }
    sleep(SETTLE).await;

    let risk = controller.risk_snapshot().await;
    assert_eq!(risk.volatility_breakers, 1, "only AAA has swung so far");
    assert!(!risk.kill_switch_triggered);

    for price in swing {
        controller.broadcast_tick("BBB", price);
        sleep(Duration::from_millis(10)).await;
    }
    sleep(SETTLE).await;

    let risk = controller.risk_snapshot().await;
    assert_eq!(risk.volatility_breakers, 2);
    assert!(risk.kill_switch_triggered);
    assert!(risk.kill_switch_reason.as_ref().unwrap().contains("volatility"));
    assert!(controller.is_killed().await);

    let err = controller.start("AAA").await.unwrap_err();
    assert!(matches!(err, CoreError::KilledByRisk { .. }), "kill switch must block every start, not just the tripping symbol");
}

/// Scenario 4: webhook routing. A validly signed "buy" alert resumes the grid and places
/// orders; a tampered signature is rejected before any controller call is made.
#[tokio::test]
async fn webhook_buy_resumes_grid_and_tampered_signature_is_rejected() {
    let symbol = "WHUSDT";
    let exchange = Arc::new(MockExchange::new(vec![symbol.to_string()], dec!(10_000), 5));
    let risk_config = RiskConfig { equity_poll_interval: Duration::from_secs(3600), ..RiskConfig::default() };
    let (controller, kill_rx) = Controller::new(exchange.clone(), Arc::new(NullStore), risk_config, 50, Duration::from_secs(5));
    tokio::spawn(controller.clone().run_kill_listener(kill_rx));
    controller.deploy(minimal_params(symbol)).await.unwrap();

    exchange.set_price(symbol, dec!(97250)).await;
    controller.broadcast_tick(symbol, dec!(97250));
    sleep(SETTLE).await;

    let router = AlertRouter::new("wh-secret".to_string(), 50, Arc::new(NullStore));
    let body = br#"{"symbol":"WHUSDT","action":"buy","price":97250}"#;

    let valid_sig = sign("wh-secret", body);
    assert!(router.verify_signature(body, &valid_sig));

    let bad_sig = sign("wrong-secret", body);
    assert!(!router.verify_signature(body, &bad_sig), "a signature computed with the wrong secret must not verify");

    let alert: WebhookAlert = serde_json::from_slice(body).unwrap();
    let (operation, result) = router.route(&controller, alert).await.unwrap();
    assert_eq!(operation, "resume");
    assert!(result.orders_placed >= 1);

    let history = router.history(Some(symbol), 10).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].mapped_operation, "resume");
}
