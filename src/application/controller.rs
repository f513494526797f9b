//! Controller: owns the set of `GridWorker`s and the `RiskSupervisor`, serializes
//! control-plane commands, and fans kill-switch events out to every worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};

use crate::domain::errors::CoreError;
use crate::domain::grid::types::GridParameters;
use crate::domain::ports::{Exchange, PriceSource, Store, Tick};
use crate::application::grid_worker::{self, CommandResult, GridSnapshot, GridWorkerHandle};
use crate::application::rate_limiter::RateLimiter;
use crate::application::risk_supervisor::{self, RiskConfig, RiskSnapshot, RiskSupervisorHandle};

pub struct Controller {
    workers: RwLock<HashMap<String, GridWorkerHandle>>,
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn Store>,
    risk: RiskSupervisorHandle,
    rate_limiter: Arc<RateLimiter>,
    tick_tx: broadcast::Sender<Tick>,
    order_timeout: Duration,
}

impl Controller {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<dyn Store>,
        risk_config: RiskConfig,
        max_exchange_calls_per_sec: usize,
        order_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (kill_tx, kill_rx) = mpsc::channel(16);
        let risk = risk_supervisor::spawn(risk_config, exchange.clone(), kill_tx);
        let (tick_tx, _) = broadcast::channel(1024);
        let rate_limiter = Arc::new(RateLimiter::new(max_exchange_calls_per_sec, Duration::from_secs(1)));

        let controller = Arc::new(Self {
            workers: RwLock::new(HashMap::new()),
            exchange,
            store,
            risk,
            rate_limiter,
            tick_tx,
            order_timeout,
        });
        (controller, kill_rx)
    }

    /// Drives the kill-notification receiver returned by `new`: call this in a background
    /// task to forward RiskSupervisor kill events into a forced stop of every worker.
    pub async fn run_kill_listener(self: Arc<Self>, mut kill_rx: mpsc::Receiver<String>) {
        while let Some(reason) = kill_rx.recv().await {
            warn!(reason = %reason, "kill switch latched, forcing stop on all workers");
            self.kill(reason).await;
        }
    }

    pub async fn deploy(&self, params: GridParameters) -> Result<(), CoreError> {
        params.validate()?;
        let symbol = params.symbol.clone();

        let handle = grid_worker::spawn(
            params,
            self.exchange.clone(),
            self.store.clone(),
            self.risk.clone(),
            self.rate_limiter.clone(),
            self.tick_tx.subscribe(),
            self.order_timeout,
        )?;
        self.workers.write().await.insert(symbol, handle);
        Ok(())
    }

    pub async fn undeploy(&self, symbol: &str) -> Result<(), CoreError> {
        let mut workers = self.workers.write().await;
        match workers.remove(symbol) {
            Some(handle) => {
                let _ = handle.stop().await;
                Ok(())
            }
            None => Err(CoreError::UnknownSymbol(symbol.to_string())),
        }
    }

    async fn with_worker<F, Fut>(&self, symbol: &str, f: F) -> Result<CommandResult, CoreError>
    where
        F: FnOnce(GridWorkerHandle) -> Fut,
        Fut: std::future::Future<Output = Result<CommandResult, CoreError>>,
    {
        let handle = {
            let workers = self.workers.read().await;
            workers.get(symbol).cloned().ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string()))?
        };
        f(handle).await
    }

    pub async fn start(&self, symbol: &str) -> Result<CommandResult, CoreError> {
        self.with_worker(symbol, |h| async move { h.start().await }).await
    }

    pub async fn pause(&self, symbol: &str) -> Result<CommandResult, CoreError> {
        self.with_worker(symbol, |h| async move { h.pause().await }).await
    }

    pub async fn resume(&self, symbol: &str) -> Result<CommandResult, CoreError> {
        self.with_worker(symbol, |h| async move { h.resume().await }).await
    }

    pub async fn stop(&self, symbol: &str) -> Result<CommandResult, CoreError> {
        self.with_worker(symbol, |h| async move { h.stop().await }).await
    }

    pub async fn rebalance(&self, symbol: &str) -> Result<CommandResult, CoreError> {
        self.with_worker(symbol, |h| async move { h.rebalance().await }).await
    }

    pub async fn acknowledge_stop_loss(&self, symbol: &str) -> Result<(), CoreError> {
        let handle = {
            let workers = self.workers.read().await;
            workers.get(symbol).cloned().ok_or_else(|| CoreError::UnknownSymbol(symbol.to_string()))?
        };
        handle.acknowledge_stop_loss().await
    }

    async fn all_symbols(&self) -> Vec<String> {
        self.workers.read().await.keys().cloned().collect()
    }

    pub async fn start_all(&self) -> HashMap<String, Result<CommandResult, CoreError>> {
        let mut out = HashMap::new();
        for symbol in self.all_symbols().await {
            out.insert(symbol.clone(), self.start(&symbol).await);
        }
        out
    }

    pub async fn pause_all(&self) -> HashMap<String, Result<CommandResult, CoreError>> {
        let mut out = HashMap::new();
        for symbol in self.all_symbols().await {
            out.insert(symbol.clone(), self.pause(&symbol).await);
        }
        out
    }

    pub async fn resume_all(&self) -> HashMap<String, Result<CommandResult, CoreError>> {
        let mut out = HashMap::new();
        for symbol in self.all_symbols().await {
            out.insert(symbol.clone(), self.resume(&symbol).await);
        }
        out
    }

    pub async fn rebalance_all(&self) -> HashMap<String, Result<CommandResult, CoreError>> {
        let mut out = HashMap::new();
        for symbol in self.all_symbols().await {
            out.insert(symbol.clone(), self.rebalance(&symbol).await);
        }
        out
    }

    /// Preempts every worker's ordinary command queue: delivered on the dedicated kill
    /// channel the worker polls with `biased` priority.
    pub async fn kill(&self, reason: String) -> HashMap<String, CommandResult> {
        let workers = self.workers.read().await;
        let mut out = HashMap::new();
        for (symbol, handle) in workers.iter() {
            out.insert(symbol.clone(), handle.force_kill(reason.clone()).await);
        }
        self.store.record_kill_event(&reason).await;
        out
    }

    pub async fn reset_kill(&self) -> Result<(), String> {
        self.risk.reset_kill().await
    }

    pub async fn is_killed(&self) -> bool {
        self.risk.is_killed().await
    }

    pub async fn grid_snapshot(&self, symbol: &str) -> Option<GridSnapshot> {
        let handle = self.workers.read().await.get(symbol).cloned()?;
        handle.snapshot().await
    }

    pub async fn all_grid_snapshots(&self) -> HashMap<String, GridSnapshot> {
        let symbols: Vec<(String, GridWorkerHandle)> =
            self.workers.read().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut out = HashMap::new();
        for (symbol, handle) in symbols {
            if let Some(snap) = handle.snapshot().await {
                out.insert(symbol, snap);
            }
        }
        out
    }

    pub async fn risk_snapshot(&self) -> RiskSnapshot {
        self.risk.snapshot().await
    }

    pub fn broadcast_tick(&self, symbol: &str, price: Decimal) {
        let _ = self.tick_tx.send(Tick { symbol: symbol.to_string(), price, ts: Utc::now() });
    }

    /// Subscribes to a streaming `PriceSource` and fans its ticks into the shared
    /// broadcast channel every worker listens on, tagged with the symbol it carries.
    pub async fn pump_price_source(self: Arc<Self>, source: Arc<dyn PriceSource>, symbol: String) {
        let mut rx = match source.subscribe(&symbol).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "failed to subscribe to price source");
                return;
            }
        };
        while let Some(tick) = rx.recv().await {
            let _ = self.tick_tx.send(tick);
        }
        info!(symbol = %symbol, "price source stream ended");
    }
}
