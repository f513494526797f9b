//! GridWorker actor: one task per symbol owning its `GridState` exclusively.
//!
//! Mailbox/select shape grounded on the teacher's
//! `application/risk_management/risk_manager.rs` (`biased` high-priority channel ahead of
//! ordinary commands) and reconciliation/idempotency grounded on
//! `application/agents/executor.rs`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use crate::domain::errors::{CoreError, ExchangeError};
use crate::domain::grid::types::{GridLevelStatus, GridParameters, GridState, OrderSide, WorkerStatus};
use crate::domain::ports::{Exchange, OrderState, Store, Tick};
use crate::application::rate_limiter::RateLimiter;
use crate::application::risk_supervisor::RiskSupervisorHandle;

const RECONCILE_PRICE_TOLERANCE_FACTOR: i64 = 2; // half-spacing tolerance = spacing / 2

#[derive(Debug, Clone, Serialize)]
pub struct GridSnapshot {
    pub symbol: String,
    pub status: WorkerStatusWire,
    pub current_price: Decimal,
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    pub grid_count: u32,
    pub filled_levels: usize,
    pub pending_buys: usize,
    pub pending_sells: usize,
    pub total_buys: u64,
    pub total_sells: u64,
    pub realized_pnl: Decimal,
    pub last_update: Option<chrono::DateTime<Utc>>,
    pub stop_loss_tripped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatusWire {
    Stopped,
    Running,
    Paused,
    Killed,
}

impl From<WorkerStatus> for WorkerStatusWire {
    fn from(s: WorkerStatus) -> Self {
        match s {
            WorkerStatus::Stopped => Self::Stopped,
            WorkerStatus::Running => Self::Running,
            WorkerStatus::Paused => Self::Paused,
            WorkerStatus::Killed => Self::Killed,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandResult {
    pub orders_placed: usize,
    pub orders_cancelled: usize,
    pub orders_failed: usize,
}

enum GridCmd {
    Start { reply: oneshot::Sender<Result<CommandResult, CoreError>> },
    Pause { reply: oneshot::Sender<Result<CommandResult, CoreError>> },
    Resume { reply: oneshot::Sender<Result<CommandResult, CoreError>> },
    Stop { reply: oneshot::Sender<Result<CommandResult, CoreError>> },
    Rebalance { reply: oneshot::Sender<Result<CommandResult, CoreError>> },
    AcknowledgeStopLoss { reply: oneshot::Sender<Result<(), CoreError>> },
    Snapshot { reply: oneshot::Sender<GridSnapshot> },
}

/// Forced stop issued by the Controller on behalf of the RiskSupervisor's kill latch.
/// Delivered on its own channel, polled with `biased` priority ahead of ordinary commands.
pub struct KillSignal {
    pub reason: String,
    pub reply: oneshot::Sender<CommandResult>,
}

#[derive(Clone)]
pub struct GridWorkerHandle {
    pub symbol: String,
    cmd_tx: mpsc::Sender<GridCmd>,
    kill_tx: mpsc::Sender<KillSignal>,
}

impl GridWorkerHandle {
    pub async fn start(&self) -> Result<CommandResult, CoreError> {
        self.call(GridCmd::Start).await
    }

    pub async fn pause(&self) -> Result<CommandResult, CoreError> {
        self.call(GridCmd::Pause).await
    }

    pub async fn resume(&self) -> Result<CommandResult, CoreError> {
        self.call(GridCmd::Resume).await
    }

    pub async fn stop(&self) -> Result<CommandResult, CoreError> {
        self.call(GridCmd::Stop).await
    }

    pub async fn rebalance(&self) -> Result<CommandResult, CoreError> {
        self.call(GridCmd::Rebalance).await
    }

    pub async fn acknowledge_stop_loss(&self) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(GridCmd::AcknowledgeStopLoss { reply }).await;
        rx.await.unwrap_or(Err(CoreError::WorkerUnavailable(self.symbol.clone())))
    }

    pub async fn snapshot(&self) -> Option<GridSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(GridCmd::Snapshot { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn force_kill(&self, reason: String) -> CommandResult {
        let (reply, rx) = oneshot::channel();
        if self.kill_tx.send(KillSignal { reason, reply }).await.is_err() {
            return CommandResult::default();
        }
        rx.await.unwrap_or_default()
    }

    async fn call(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<CommandResult, CoreError>>) -> GridCmd,
    ) -> Result<CommandResult, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| CoreError::WorkerUnavailable(self.symbol.clone()))?;
        rx.await.map_err(|_| CoreError::WorkerUnavailable(self.symbol.clone()))?
    }
}

/// Places a single order against the shared `Exchange`/`RateLimiter`/`RiskSupervisorHandle`.
/// Free-standing (rather than a `&mut self` method) so a batch of these can run concurrently
/// via `join_all`, each pacing itself through the one shared rate limiter.
async fn place_order(
    exchange: Arc<dyn Exchange>,
    rate_limiter: Arc<RateLimiter>,
    risk: RiskSupervisorHandle,
    order_timeout: Duration,
    symbol: String,
    side: OrderSide,
    price: Decimal,
    qty: Decimal,
    client_tag: String,
) -> Result<String, ExchangeError> {
    rate_limiter.acquire().await;
    let result = match tokio::time::timeout(order_timeout, exchange.place_limit(&symbol, side, price, qty, &client_tag)).await {
        Ok(r) => r,
        Err(_) => Err(ExchangeError::Transient("place_limit deadline exceeded".into())),
    };
    risk.record_api_call(result.is_err()).await;
    result
}

struct Worker {
    state: GridState,
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn Store>,
    risk: RiskSupervisorHandle,
    rate_limiter: Arc<RateLimiter>,
    order_timeout: Duration,
}

impl Worker {
    fn snapshot(&self) -> GridSnapshot {
        let pending_buys = self.state.levels.iter().filter(|l| l.buy_order_id.is_some()).count();
        let pending_sells = self.state.levels.iter().filter(|l| l.sell_order_id.is_some()).count();
        let filled_levels = self.state.levels.iter().filter(|l| l.status.is_holding()).count();
        GridSnapshot {
            symbol: self.state.params.symbol.clone(),
            status: self.state.status.into(),
            current_price: self.state.current_price,
            lower_price: self.state.params.lower_price,
            upper_price: self.state.params.upper_price,
            grid_count: self.state.params.grid_count,
            filled_levels,
            pending_buys,
            pending_sells,
            total_buys: self.state.total_buys,
            total_sells: self.state.total_sells,
            realized_pnl: self.state.realized_pnl,
            last_update: self.state.last_tick_ts,
            stop_loss_tripped: self.state.stop_loss_tripped,
        }
    }

    async fn place(&mut self, index: usize, side: OrderSide, price: Decimal, qty: Decimal) -> Result<String, ExchangeError> {
        let tag = format!("{}-{:?}-{}-{}", self.state.params.symbol, side, index, self.state.epoch);
        place_order(
            self.exchange.clone(),
            self.rate_limiter.clone(),
            self.risk.clone(),
            self.order_timeout,
            self.state.params.symbol.clone(),
            side,
            price,
            qty,
            tag,
        )
        .await
    }

    /// Serializes the current grid state to the configured `Store`. Best-effort: a write
    /// failure (dropped by a full queue) never blocks or fails the triggering command.
    async fn persist_snapshot(&self) {
        let snapshot = self.snapshot();
        if let Ok(json) = serde_json::to_string(&snapshot) {
            self.store.record_grid_snapshot(&self.state.params.symbol, &json).await;
        }
    }

    async fn cancel(&mut self, order_id: &str) -> Result<(), ExchangeError> {
        self.rate_limiter.acquire().await;
        let result = match tokio::time::timeout(self.order_timeout, self.exchange.cancel(order_id)).await {
            Ok(r) => r,
            Err(_) => Err(ExchangeError::Transient("cancel deadline exceeded".into())),
        };
        self.risk.record_api_call(matches!(result, Err(ref e) if !matches!(e, ExchangeError::NotFound(_)))).await;
        match result {
            Err(ExchangeError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    /// Places the initial buy/sell orders implied by `current_price`, per the placement
    /// algorithm: buys below the crossing rung, sells only where a level already holds.
    /// Every level needing an order is placed concurrently via `join_all`, each call pacing
    /// itself through the shared `RateLimiter` rather than serializing one-at-a-time; results
    /// are applied back to `self.state.levels` sequentially once every placement resolves.
    async fn place_initial_orders(&mut self) -> CommandResult {
        let spacing = self.state.params.spacing();
        let lower = self.state.params.lower_price;
        let price = self.state.current_price;
        let k = if spacing.is_zero() {
            0usize
        } else {
            let raw = ((price - lower) / spacing).floor();
            let idx: i64 = raw.try_into().unwrap_or(0);
            idx.clamp(0, self.state.params.grid_count as i64 - 1) as usize
        };

        struct Job {
            index: usize,
            side: OrderSide,
            order_price: Decimal,
            qty: Decimal,
        }

        let epoch = self.state.epoch;
        let symbol = self.state.params.symbol.clone();
        let mut jobs = Vec::new();
        for (i, level) in self.state.levels.iter().enumerate() {
            if i < k && level.buy_order_id.is_none() && level.status == GridLevelStatus::Idle {
                jobs.push(Job { index: i, side: OrderSide::Buy, order_price: level.price, qty: level.quantity });
            } else if i >= k && level.holding() && level.sell_order_id.is_none() {
                let sell_price = self.next_sell_price(level.price);
                jobs.push(Job { index: i, side: OrderSide::Sell, order_price: sell_price, qty: level.quantity });
            }
        }

        let placements = jobs.iter().map(|job| {
            let tag = format!("{}-{:?}-{}-{}", symbol, job.side, job.index, epoch);
            place_order(
                self.exchange.clone(),
                self.rate_limiter.clone(),
                self.risk.clone(),
                self.order_timeout,
                symbol.clone(),
                job.side,
                job.order_price,
                job.qty,
                tag,
            )
        });
        let outcomes = join_all(placements).await;

        let mut result = CommandResult::default();
        for (job, outcome) in jobs.into_iter().zip(outcomes) {
            match outcome {
                Ok(order_id) => {
                    match job.side {
                        OrderSide::Buy => self.state.levels[job.index].set_buy_order(order_id, Utc::now()),
                        OrderSide::Sell => self.state.levels[job.index].set_sell_order(order_id, job.order_price, Utc::now()),
                    }
                    result.orders_placed += 1;
                }
                Err(e) => {
                    warn!(symbol = %symbol, level = job.index, side = ?job.side, error = %e, "initial placement failed");
                    result.orders_failed += 1;
                }
            }
        }
        result
    }

    fn next_sell_price(&self, level_price: Decimal) -> Decimal {
        let candidate = level_price + self.state.params.spacing();
        candidate.min(self.state.params.upper_price)
    }

    /// Cancels every cancellable open order. Levels that are holding a filled buy are
    /// left untouched: cancelling them would orphan the position.
    async fn cancel_all_cancellable(&mut self) -> CommandResult {
        let mut result = CommandResult::default();
        let indices = self.state.cancellable_level_indices();
        for i in indices {
            let order_id = self.state.levels[i].buy_order_id.clone().or_else(|| self.state.levels[i].sell_order_id.clone());
            if let Some(order_id) = order_id {
                match self.cancel(&order_id).await {
                    Ok(()) => {
                        self.state.levels[i].buy_order_id = None;
                        self.state.levels[i].sell_order_id = None;
                        self.state.levels[i].status = GridLevelStatus::Idle;
                        result.orders_cancelled += 1;
                    }
                    Err(e) => {
                        warn!(symbol = %self.state.params.symbol, level = i, error = %e, "cancel failed");
                        result.orders_failed += 1;
                    }
                }
            }
        }
        result
    }

    /// Adopts open exchange orders matching a known level price, cancels anything else.
    async fn reconcile(&mut self) -> CommandResult {
        let mut result = CommandResult::default();
        let open_orders = match self.exchange.open_orders(&self.state.params.symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(symbol = %self.state.params.symbol, error = %e, "reconciliation open_orders failed");
                return result;
            }
        };
        let tolerance = self.state.params.spacing() / Decimal::from(RECONCILE_PRICE_TOLERANCE_FACTOR);

        for order in open_orders {
            let matched = self
                .state
                .levels
                .iter_mut()
                .find(|l| (l.price - order.price).abs() <= tolerance);
            match matched {
                Some(level) => match order.side {
                    OrderSide::Buy if level.buy_order_id.is_none() && level.status != GridLevelStatus::Holding => {
                        level.set_buy_order(order.order_id, Utc::now());
                    }
                    OrderSide::Sell if level.sell_order_id.is_none() => {
                        level.set_sell_order(order.order_id, order.price, Utc::now());
                    }
                    _ => {
                        if self.cancel(&order.order_id).await.is_ok() {
                            result.orders_cancelled += 1;
                        }
                    }
                },
                None => {
                    if self.cancel(&order.order_id).await.is_ok() {
                        result.orders_cancelled += 1;
                        info!(symbol = %self.state.params.symbol, order_id = %order.order_id, "cancelled stray order on reconciliation");
                    }
                }
            }
        }
        result
    }

    async fn do_start(&mut self) -> Result<CommandResult, CoreError> {
        if self.state.stop_loss_tripped {
            return Err(CoreError::StopLossTripped { symbol: self.state.params.symbol.clone() });
        }
        if self.risk.is_killed().await {
            return Err(CoreError::KilledByRisk { reason: "kill switch active".into() });
        }
        self.risk
            .allow_start(
                self.state.params.symbol.clone(),
                self.state.params.total_investment,
                self.state.params.btc_filter_enabled,
            )
            .await
            .map_err(|reason| CoreError::KilledByRisk { reason })?;

        let reconcile_result = self.reconcile().await;
        let placement_result = self.place_initial_orders().await;
        self.state.status = WorkerStatus::Running;
        self.persist_snapshot().await;
        Ok(CommandResult {
            orders_placed: placement_result.orders_placed,
            orders_cancelled: reconcile_result.orders_cancelled,
            orders_failed: placement_result.orders_failed + reconcile_result.orders_failed,
        })
    }

    async fn do_pause(&mut self) -> Result<CommandResult, CoreError> {
        let result = self.cancel_all_cancellable().await;
        self.state.status = WorkerStatus::Paused;
        self.persist_snapshot().await;
        Ok(result)
    }

    async fn do_stop(&mut self) -> Result<CommandResult, CoreError> {
        let result = self.cancel_all_cancellable().await;
        self.state.next_epoch();
        self.state.status = WorkerStatus::Stopped;
        self.persist_snapshot().await;
        Ok(result)
    }

    async fn do_rebalance(&mut self) -> Result<CommandResult, CoreError> {
        let stop_result = self.do_stop().await?;
        self.state.rebuild_levels(Utc::now());
        let start_result = self.do_start().await?;
        Ok(CommandResult {
            orders_placed: start_result.orders_placed,
            orders_cancelled: stop_result.orders_cancelled,
            orders_failed: stop_result.orders_failed + start_result.orders_failed,
        })
    }

    /// Per-tick fill detection: polls order status for every live order on this symbol,
    /// flips level state, and replaces the matched-terminal side.
    async fn poll_fills(&mut self) {
        let epoch = self.state.epoch;
        let fee_bps = self.state.params.fee_bps;
        let indices: Vec<usize> = (0..self.state.levels.len()).collect();

        for i in indices {
            if epoch != self.state.epoch {
                return; // epoch bumped mid-poll (e.g. concurrent stop); discard the rest
            }
            let (buy_id, sell_id) = {
                let level = &self.state.levels[i];
                (level.buy_order_id.clone(), level.sell_order_id.clone())
            };

            if let Some(order_id) = buy_id {
                match self.exchange.order_status(&order_id).await {
                    Ok(status) => {
                        self.risk.record_api_call(false).await;
                        self.on_order_status(i, OrderSide::Buy, status, fee_bps).await;
                    }
                    Err(e) => {
                        self.risk.record_api_call(!e.is_transient() || matches!(e, ExchangeError::Transient(_))).await;
                        if !e.is_transient() {
                            self.state.levels[i].mark_faulted(Utc::now());
                            self.state.faulted_levels.insert(i);
                        }
                    }
                }
            }
            if let Some(order_id) = sell_id {
                match self.exchange.order_status(&order_id).await {
                    Ok(status) => {
                        self.risk.record_api_call(false).await;
                        self.on_order_status(i, OrderSide::Sell, status, fee_bps).await;
                    }
                    Err(e) => {
                        self.risk.record_api_call(!e.is_transient()).await;
                        if !e.is_transient() {
                            self.state.levels[i].mark_faulted(Utc::now());
                            self.state.faulted_levels.insert(i);
                        }
                    }
                }
            }
        }
    }

    async fn on_order_status(&mut self, i: usize, side: OrderSide, status: crate::domain::ports::OrderStatus, fee_bps: u32) {
        match status.state {
            OrderState::Filled => match side {
                OrderSide::Buy => {
                    self.state.levels[i].on_buy_filled(status.avg_price, Utc::now());
                    self.state.total_buys += 1;
                    let (level_price, qty) = (self.state.levels[i].price, self.state.levels[i].quantity);
                    let sell_price = self.next_sell_price(level_price);
                    match self.place(i, OrderSide::Sell, sell_price, qty).await {
                        Ok(order_id) => self.state.levels[i].set_sell_order(order_id, sell_price, Utc::now()),
                        Err(e) => warn!(level = i, error = %e, "failed to place replacement sell"),
                    }
                }
                OrderSide::Sell => {
                    let pnl = self.state.levels[i].on_sell_filled(status.avg_price, fee_bps, Utc::now());
                    self.state.realized_pnl += pnl;
                    self.state.total_sells += 1;
                    self.store
                        .record_trade(&self.state.params.symbol, OrderSide::Sell, status.avg_price, self.state.levels[i].quantity, pnl)
                        .await;
                    let (level_price, qty) = (self.state.levels[i].price, self.state.levels[i].quantity);
                    match self.place(i, OrderSide::Buy, level_price, qty).await {
                        Ok(order_id) => self.state.levels[i].set_buy_order(order_id, Utc::now()),
                        Err(e) => warn!(level = i, error = %e, "failed to place replacement buy"),
                    }
                }
            },
            OrderState::Cancelled | OrderState::Rejected => {
                self.state.levels[i].clear_for_replacement(Utc::now());
            }
            OrderState::Partial => {
                self.state.levels[i].filled_qty = status.filled_qty;
            }
            OrderState::New => {}
        }
    }

    async fn check_stop_loss(&mut self) {
        if let Some(sl) = self.state.params.stop_loss {
            if self.state.current_price <= sl && !self.state.stop_loss_tripped {
                warn!(symbol = %self.state.params.symbol, price = %self.state.current_price, "stop-loss tripped");
                self.cancel_all_cancellable().await;
                self.state.stop_loss_tripped = true;
                self.state.status = WorkerStatus::Paused;
            }
        }
    }

    async fn on_tick(&mut self, price: Decimal, ts: chrono::DateTime<Utc>) {
        if let Some(last) = self.state.last_tick_ts {
            if ts <= last {
                return; // out-of-order tick, drop
            }
        }
        self.state.current_price = price;
        self.state.last_tick_ts = Some(ts);
        self.risk.on_tick(self.state.params.symbol.clone(), price).await;

        if self.state.status != WorkerStatus::Running {
            return;
        }
        self.check_stop_loss().await;
        if self.state.status != WorkerStatus::Running {
            return;
        }
        if self.state.params.btc_filter_enabled && self.risk.btc_filter_active().await {
            self.poll_fills().await; // fills/cancels still processed; no new placements
            return;
        }
        self.poll_fills().await;
        self.place_initial_orders().await;
    }
}

pub fn spawn(
    params: GridParameters,
    exchange: Arc<dyn Exchange>,
    store: Arc<dyn Store>,
    risk: RiskSupervisorHandle,
    rate_limiter: Arc<RateLimiter>,
    mut ticks: broadcast::Receiver<Tick>,
    order_timeout: Duration,
) -> Result<GridWorkerHandle, CoreError> {
    let symbol = params.symbol.clone();
    let state = GridState::new(params, Utc::now())?;
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<GridCmd>(64);
    let (kill_tx, mut kill_rx) = mpsc::channel::<KillSignal>(4);

    let mut worker = Worker { state, exchange, store, risk, rate_limiter, order_timeout };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                Some(kill) = kill_rx.recv() => {
                    warn!(symbol = %worker.state.params.symbol, reason = %kill.reason, "forced stop by kill switch");
                    let result = worker.do_stop().await.unwrap_or_default();
                    worker.state.status = WorkerStatus::Killed;
                    let _ = kill.reply.send(result);
                }

                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        GridCmd::Start { reply } => { let _ = reply.send(worker.do_start().await); }
                        GridCmd::Pause { reply } => { let _ = reply.send(worker.do_pause().await); }
                        GridCmd::Resume { reply } => { let _ = reply.send(worker.do_start().await); }
                        GridCmd::Stop { reply } => { let _ = reply.send(worker.do_stop().await); }
                        GridCmd::Rebalance { reply } => { let _ = reply.send(worker.do_rebalance().await); }
                        GridCmd::AcknowledgeStopLoss { reply } => {
                            worker.state.stop_loss_tripped = false;
                            let _ = reply.send(Ok(()));
                        }
                        GridCmd::Snapshot { reply } => { let _ = reply.send(worker.snapshot()); }
                    }
                }

                tick = ticks.recv() => {
                    match tick {
                        Ok(t) if t.symbol == worker.state.params.symbol => worker.on_tick(t.price, t.ts).await,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(symbol = %worker.state.params.symbol, skipped = n, "tick broadcast lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                else => break,
            }
        }
    });

    Ok(GridWorkerHandle { symbol, cmd_tx, kill_tx })
}
