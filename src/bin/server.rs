//! Process entry point: loads configuration, wires the exchange/store/risk/controller
//! stack, deploys the configured symbols, and serves the control-plane HTTP API.
//!
//! Bootstrap shape grounded on the teacher's `bin/server.rs`: init tracing first, load
//! config, construct the dependency graph, then block on `axum::serve` with a graceful
//! shutdown on SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridcore::application::alert_router::AlertRouter;
use gridcore::application::controller::Controller;
use gridcore::application::risk_supervisor::RiskConfig;
use gridcore::config::{Config, Mode};
use gridcore::domain::ports::{Exchange, PriceSource, Store};
use gridcore::infrastructure::http::server::{router, AppState};
use gridcore::infrastructure::metrics::GridMetrics;
use gridcore::infrastructure::mock_exchange::MockExchange;
use gridcore::infrastructure::rest_exchange::{RestExchange, RestExchangeConfig, UnimplementedStream};
use gridcore::infrastructure::store::{InMemoryStore, NullStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    info!(mode = ?config.mode, symbols = ?config.symbols, "starting gridcore");

    let (exchange, price_source): (Arc<dyn Exchange>, Arc<dyn PriceSource>) = match config.mode {
        Mode::Mock => {
            let mock = Arc::new(MockExchange::new(config.symbols.clone(), Decimal::from(10_000), 1));
            (mock.clone(), mock)
        }
        Mode::Live => {
            let rest = Arc::new(RestExchange::new(RestExchangeConfig {
                base_url: config.exchange_base_url.clone(),
                api_key: config.exchange_api_key.clone(),
                api_secret: config.exchange_api_secret.clone(),
            }));
            (rest, Arc::new(UnimplementedStream))
        }
    };

    let store: Arc<dyn Store> = match &config.store_url {
        Some(_) => Arc::new(InMemoryStore::new(4096)),
        None => Arc::new(NullStore),
    };
    let alert_store = store.clone();

    let risk_config = RiskConfig {
        max_drawdown_pct: config.max_drawdown_pct,
        max_api_error_pct: config.max_api_error_pct,
        volatility_threshold_pct: config.volatility_threshold_pct,
        volatility_breaker_count: config.volatility_breaker_count,
        max_position_pct: config.max_position_pct,
        equity_poll_interval: config.equity_poll_interval(),
        btc_symbol: config.btc_symbol.clone(),
        ..RiskConfig::default()
    };

    let (controller, kill_rx) = Controller::new(
        exchange,
        store,
        risk_config,
        config.max_exchange_calls_per_sec,
        config.order_timeout(),
    );

    tokio::spawn(controller.clone().run_kill_listener(kill_rx));

    // Grid geometry isn't known at process start; operators deploy it per symbol via
    // POST /api/deploy. Price ticks are pumped for every configured symbol regardless,
    // so a grid deployed later immediately has a populated price history.
    for symbol in config.symbols.iter() {
        tokio::spawn(controller.clone().pump_price_source(price_source.clone(), symbol.clone()));
    }

    let alert_router = Arc::new(AlertRouter::new(config.webhook_secret.clone(), config.alert_history_capacity, alert_store));
    let metrics = Arc::new(GridMetrics::new().context("registering prometheus metrics")?);
    let app = router(AppState { controller, alert_router, metrics });

    let listener = tokio::net::TcpListener::bind(&config.http_bind_addr)
        .await
        .with_context(|| format!("binding {}", config.http_bind_addr))?;
    info!(addr = %config.http_bind_addr, "control-plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    warn!("gridcore shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
