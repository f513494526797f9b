//! Illustrative signed-REST exchange adapter.
//!
//! Shows the shape a production transport would take — HMAC-signed requests behind a
//! circuit breaker, retried through `reqwest-middleware` — grounded on
//! `infrastructure/binance/execution.rs`. Not exercised by the test suite; the core only
//! depends on the `Exchange` trait, never on this struct directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use rust_decimal::Decimal;
use sha2::Sha256;

use crate::application::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::domain::errors::ExchangeError;
use crate::domain::grid::types::OrderSide;
use crate::domain::ports::{Exchange, OpenOrder, OrderStatus, PriceSource};

type HmacSha256 = Hmac<Sha256>;

pub struct RestExchangeConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
}

pub struct RestExchange {
    config: RestExchangeConfig,
    client: ClientWithMiddleware,
    breaker: CircuitBreaker,
}

impl RestExchange {
    pub fn new(config: RestExchangeConfig) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self { config, client, breaker: CircuitBreaker::new(5, 2, Duration::from_secs(30)) }
    }

    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Auth(e.to_string()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn classify_status(status: reqwest::StatusCode) -> ExchangeError {
        if status.as_u16() == 429 {
            ExchangeError::RateLimited
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            ExchangeError::Auth(status.to_string())
        } else if status.is_server_error() {
            ExchangeError::Transient(status.to_string())
        } else {
            ExchangeError::Invalid(status.to_string())
        }
    }
}

#[async_trait]
impl Exchange for RestExchange {
    async fn place_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
        client_tag: &str,
    ) -> Result<String, ExchangeError> {
        let query = format!(
            "symbol={symbol}&side={side:?}&price={price}&qty={qty}&clientOrderId={client_tag}&apiKey={}",
            self.config.api_key
        );
        let signature = self.sign(&query)?;
        let url = format!("{}/api/v3/order?{query}&signature={signature}", self.config.base_url);

        self.breaker
            .call(|| async {
                let resp = self.client.post(&url).send().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(Self::classify_status(resp.status()));
                }
                #[derive(serde::Deserialize)]
                struct OrderAck {
                    #[serde(rename = "orderId")]
                    order_id: String,
                }
                let ack: OrderAck = resp.json().await.map_err(|e| ExchangeError::Invalid(e.to_string()))?;
                Ok(ack.order_id)
            })
            .await
            .map_err(unwrap_breaker)
    }

    async fn cancel(&self, order_id: &str) -> Result<(), ExchangeError> {
        let query = format!("orderId={order_id}&apiKey={}", self.config.api_key);
        let signature = self.sign(&query)?;
        let url = format!("{}/api/v3/order?{query}&signature={signature}", self.config.base_url);

        self.breaker
            .call(|| async {
                let resp = self.client.delete(&url).send().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    return Err(ExchangeError::NotFound(order_id.to_string()));
                }
                if !resp.status().is_success() {
                    return Err(Self::classify_status(resp.status()));
                }
                Ok(())
            })
            .await
            .map_err(unwrap_breaker)
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, ExchangeError> {
        let query = format!("orderId={order_id}&apiKey={}", self.config.api_key);
        let signature = self.sign(&query)?;
        let url = format!("{}/api/v3/order?{query}&signature={signature}", self.config.base_url);

        self.breaker
            .call(|| async {
                let resp = self.client.get(&url).send().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(Self::classify_status(resp.status()));
                }
                resp.json::<OrderStatus>().await.map_err(|e| ExchangeError::Invalid(e.to_string()))
            })
            .await
            .map_err(unwrap_breaker)
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let query = format!("symbol={symbol}&apiKey={}", self.config.api_key);
        let signature = self.sign(&query)?;
        let url = format!("{}/api/v3/openOrders?{query}&signature={signature}", self.config.base_url);

        self.breaker
            .call(|| async {
                let resp = self.client.get(&url).send().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(Self::classify_status(resp.status()));
                }
                resp.json::<Vec<OpenOrder>>().await.map_err(|e| ExchangeError::Invalid(e.to_string()))
            })
            .await
            .map_err(unwrap_breaker)
    }

    async fn wallet_equity(&self) -> Result<Decimal, ExchangeError> {
        let query = format!("apiKey={}", self.config.api_key);
        let signature = self.sign(&query)?;
        let url = format!("{}/api/v3/account?{query}&signature={signature}", self.config.base_url);

        self.breaker
            .call(|| async {
                let resp = self.client.get(&url).send().await.map_err(|e| ExchangeError::Transient(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(Self::classify_status(resp.status()));
                }
                #[derive(serde::Deserialize)]
                struct Account {
                    #[serde(rename = "totalEquity")]
                    total_equity: Decimal,
                }
                let account: Account = resp.json().await.map_err(|e| ExchangeError::Invalid(e.to_string()))?;
                Ok(account.total_equity)
            })
            .await
            .map_err(unwrap_breaker)
    }
}

fn unwrap_breaker(err: CircuitBreakerError<ExchangeError>) -> ExchangeError {
    match err {
        CircuitBreakerError::Open => ExchangeError::Transient("circuit breaker open".into()),
        CircuitBreakerError::Inner(e) => e,
    }
}

/// A production `PriceSource` would stream order-book/trade events over WebSocket; that
/// transport is outside this core's scope (see `SPEC_FULL.md` Purpose & Scope).
pub struct UnimplementedStream;

#[async_trait]
impl PriceSource for UnimplementedStream {
    async fn subscribe(&self, _symbol: &str) -> Result<tokio::sync::mpsc::Receiver<crate::domain::ports::Tick>, ExchangeError> {
        Err(ExchangeError::Invalid("streaming transport not implemented; use MockExchange".into()))
    }
}

pub type SharedRestExchange = Arc<RestExchange>;
