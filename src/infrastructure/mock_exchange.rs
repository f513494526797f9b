//! Deterministic in-memory exchange + price source used by tests and by the service when
//! no exchange credentials are configured.
//!
//! Grounded on `infrastructure/mock.rs`'s `MockMarketDataService`/`MockExecutionService`:
//! a hand-rolled seeded walk (not the `rand` crate) so test runs are byte-for-byte
//! reproducible, and immediate local fill simulation against the walked price.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::domain::errors::ExchangeError;
use crate::domain::grid::types::OrderSide;
use crate::domain::ports::{Exchange, OpenOrder, OrderState, OrderStatus, PriceSource, Tick};

/// Small linear-congruential generator. Deterministic across platforms, unlike relying on
/// `rand`'s default OS entropy source, which is the point of a reproducible mock.
struct Lcg(u64);

impl Lcg {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0
    }

    /// Uniform value in `[-1.0, 1.0)`.
    fn next_signed_unit(&mut self) -> f64 {
        let v = (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
        v * 2.0 - 1.0
    }
}

#[derive(Debug, Clone)]
struct MockOrder {
    symbol: String,
    side: OrderSide,
    price: Decimal,
    qty: Decimal,
    state: OrderState,
    filled_qty: Decimal,
    avg_price: Decimal,
}

pub struct MockExchange {
    orders: RwLock<HashMap<String, MockOrder>>,
    current_prices: RwLock<HashMap<String, Decimal>>,
    equity: RwLock<Decimal>,
    seed: u64,
}

impl MockExchange {
    pub fn new(symbols: Vec<String>, initial_equity: Decimal, seed: u64) -> Self {
        let current_prices = symbols.into_iter().map(|s| (s, Decimal::ZERO)).collect();
        Self {
            orders: RwLock::new(HashMap::new()),
            current_prices: RwLock::new(current_prices),
            equity: RwLock::new(initial_equity),
            seed,
        }
    }

    /// Updates the last-known price for `symbol` and fills any resting order whose limit
    /// the new price has crossed.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.current_prices.write().await.insert(symbol.to_string(), price);
        let mut orders = self.orders.write().await;
        for order in orders.values_mut() {
            if order.symbol != symbol || order.state != OrderState::New {
                continue;
            }
            let crossed = match order.side {
                OrderSide::Buy => price <= order.price,
                OrderSide::Sell => price >= order.price,
            };
            if crossed {
                order.state = OrderState::Filled;
                order.filled_qty = order.qty;
                order.avg_price = order.price;
            }
        }
    }

    pub async fn apply_realized_pnl(&self, pnl: Decimal) {
        *self.equity.write().await += pnl;
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn place_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
        client_tag: &str,
    ) -> Result<String, ExchangeError> {
        // Idempotent under client_tag: resubmitting the same tag returns the existing order.
        // The delimiter before the uuid matters: without it "BTCUSDT-Buy-5-1" would match as
        // a prefix of "BTCUSDT-Buy-5-10", corrupting epoch isolation past ten restarts.
        let prefix = format!("{client_tag}#");
        {
            let orders = self.orders.read().await;
            if let Some((id, _)) = orders.iter().find(|(id, _)| id.starts_with(&prefix)) {
                return Ok(id.clone());
            }
        }
        let order_id = format!("{client_tag}#{}", Uuid::new_v4());
        let current = self.current_prices.read().await.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let crossed = match side {
            OrderSide::Buy => !current.is_zero() && current <= price,
            OrderSide::Sell => !current.is_zero() && current >= price,
        };
        let order = MockOrder {
            symbol: symbol.to_string(),
            side,
            price,
            qty,
            state: if crossed { OrderState::Filled } else { OrderState::New },
            filled_qty: if crossed { qty } else { Decimal::ZERO },
            avg_price: if crossed { price } else { Decimal::ZERO },
        };
        self.orders.write().await.insert(order_id.clone(), order);
        Ok(order_id)
    }

    async fn cancel(&self, order_id: &str) -> Result<(), ExchangeError> {
        let mut orders = self.orders.write().await;
        match orders.get_mut(order_id) {
            Some(order) if order.state == OrderState::New => {
                order.state = OrderState::Cancelled;
                Ok(())
            }
            Some(_) => Ok(()), // already terminal; cancel is a no-op
            None => Err(ExchangeError::NotFound(order_id.to_string())),
        }
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, ExchangeError> {
        let orders = self.orders.read().await;
        let order = orders.get(order_id).ok_or_else(|| ExchangeError::NotFound(order_id.to_string()))?;
        Ok(OrderStatus { state: order.state, filled_qty: order.filled_qty, avg_price: order.avg_price })
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let orders = self.orders.read().await;
        Ok(orders
            .iter()
            .filter(|(_, o)| o.symbol == symbol && o.state == OrderState::New)
            .map(|(id, o)| OpenOrder { order_id: id.clone(), symbol: o.symbol.clone(), side: o.side, price: o.price, qty: o.qty })
            .collect())
    }

    async fn wallet_equity(&self) -> Result<Decimal, ExchangeError> {
        Ok(*self.equity.read().await)
    }
}

#[async_trait]
impl PriceSource for MockExchange {
    async fn subscribe(&self, symbol: &str) -> Result<mpsc::Receiver<Tick>, ExchangeError> {
        let (tx, rx) = mpsc::channel(256);
        let start_price = self.current_prices.read().await.get(symbol).copied().unwrap_or(Decimal::from(100));
        let seed = self.seed.wrapping_add(symbol.bytes().map(u64::from).sum());
        let symbol = symbol.to_string();

        tokio::spawn(async move {
            let mut rng = Lcg(seed | 1);
            let mut price = start_price;
            loop {
                let pct = rng.next_signed_unit() * 0.004; // +/- 0.4% per step
                let delta = price * Decimal::try_from(pct).unwrap_or(Decimal::ZERO);
                price = (price + delta).max(Decimal::new(1, 2));
                let tick = Tick { symbol: symbol.clone(), price, ts: Utc::now() };
                if tx.send(tick).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        });

        Ok(rx)
    }
}

/// Convenience for tests: wrap a `MockExchange` so both `Exchange` and `PriceSource`
/// resolve to the same shared instance.
pub fn shared(exchange: MockExchange) -> Arc<MockExchange> {
    Arc::new(exchange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn place_limit_is_idempotent_under_client_tag() {
        let exchange = MockExchange::new(vec!["BTCUSDT".into()], dec!(10000), 1);
        let id1 = exchange.place_limit("BTCUSDT", OrderSide::Buy, dec!(100), dec!(1), "tag-1").await.unwrap();
        let id2 = exchange.place_limit("BTCUSDT", OrderSide::Buy, dec!(100), dec!(1), "tag-1").await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn crossing_price_fills_resting_order() {
        let exchange = MockExchange::new(vec!["BTCUSDT".into()], dec!(10000), 1);
        exchange.set_price("BTCUSDT", dec!(100)).await;
        let id = exchange.place_limit("BTCUSDT", OrderSide::Buy, dec!(99), dec!(1), "tag-2").await.unwrap();
        let status = exchange.order_status(&id).await.unwrap();
        assert_eq!(status.state, OrderState::New);

        exchange.set_price("BTCUSDT", dec!(98)).await;
        let status = exchange.order_status(&id).await.unwrap();
        assert_eq!(status.state, OrderState::Filled);
    }

    #[tokio::test]
    async fn cancel_missing_order_returns_not_found() {
        let exchange = MockExchange::new(vec!["BTCUSDT".into()], dec!(10000), 1);
        let err = exchange.cancel("missing").await.unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound(_)));
    }
}
