//! Capability traits the grid core depends on but does not implement.
//!
//! Concrete adapters live under `infrastructure`; the core is written only against
//! these traits so it runs identically against a mock or a live exchange.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::errors::ExchangeError;
use crate::domain::grid::types::OrderSide;

/// An order's lifecycle state as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    New,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub state: OrderState,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub qty: Decimal,
}

/// A single price observation, fanned out to every `GridWorker` and the `RiskSupervisor`.
/// Correlated to a worker by `symbol` rather than a positional index: two independent
/// counters (deploy order vs. price-source subscription order) can't silently drift apart.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    pub ts: DateTime<Utc>,
}

/// Minimal order-execution capability the grid core requires of an exchange.
///
/// `client_tag` makes `place_limit` idempotent: a resubmission of the same tag after a
/// crash-restart must not create a duplicate order.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn place_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
        client_tag: &str,
    ) -> Result<String, ExchangeError>;

    async fn cancel(&self, order_id: &str) -> Result<(), ExchangeError>;

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, ExchangeError>;

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn wallet_equity(&self) -> Result<Decimal, ExchangeError>;
}

/// Streaming price source. The core subscribes once per symbol at startup.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Subscribe to a symbol, returning a receiver of ticks for it alone.
    async fn subscribe(&self, symbol: &str) -> Result<tokio::sync::mpsc::Receiver<Tick>, ExchangeError>;
}

/// Append-only persistence sink. A `NullStore` satisfies this trait so the core runs
/// correctly with no persistence configured at all.
#[async_trait]
pub trait Store: Send + Sync {
    async fn record_trade(&self, symbol: &str, side: OrderSide, price: Decimal, qty: Decimal, pnl: Decimal);
    async fn record_grid_snapshot(&self, symbol: &str, snapshot_json: &str);
    async fn record_kill_event(&self, reason: &str);
    async fn record_alert(&self, symbol: &str, action: &str);
}
