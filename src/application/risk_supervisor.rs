//! RiskSupervisor actor: rolling volatility, API error-rate, drawdown and the kill latch.
//!
//! One mailbox, one task, matching the teacher's risk-manager actor shape in
//! `risk_management/risk_manager.rs`: every mutation of `RiskState` happens on this task,
//! so no lock is needed around it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::domain::ports::Exchange;
use crate::domain::risk::state::RiskState;
use crate::domain::risk::volatility::{ApiErrorTracker, VolatilityWindow};

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_drawdown_pct: Decimal,
    pub max_api_error_pct: Decimal,
    pub volatility_threshold_pct: Decimal,
    pub volatility_breaker_count: u32,
    pub max_position_pct: Decimal,
    pub price_window_capacity: usize,
    pub api_error_window: usize,
    pub api_error_warmup: u64,
    pub equity_poll_interval: Duration,
    pub btc_symbol: String,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_pct: Decimal::from(30),
            max_api_error_pct: Decimal::new(20, 1), // 2.0
            volatility_threshold_pct: Decimal::from(5),
            volatility_breaker_count: 2,
            max_position_pct: Decimal::from(50),
            price_window_capacity: 100,
            api_error_window: 1000,
            api_error_warmup: 50,
            equity_poll_interval: Duration::from_secs(60),
            btc_symbol: "BTCUSDT".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct RiskSnapshot {
    pub total_equity: Decimal,
    pub initial_equity: Decimal,
    pub drawdown_percent: Decimal,
    pub api_error_rate: Decimal,
    pub volatility_breakers: u32,
    pub kill_switch_triggered: bool,
    pub kill_switch_reason: Option<String>,
    pub potential_kill_reason: Option<String>,
}

enum RiskCmd {
    Tick { symbol: String, price: Decimal },
    RecordApiCall { failed: bool },
    AllowStart { symbol: String, investment: Decimal, btc_filter_enabled: bool, reply: oneshot::Sender<Result<(), String>> },
    BtcFilterActive { reply: oneshot::Sender<bool> },
    IsKilled { reply: oneshot::Sender<bool> },
    ResetKill { reply: oneshot::Sender<Result<(), String>> },
    Snapshot { reply: oneshot::Sender<RiskSnapshot> },
}

#[derive(Clone)]
pub struct RiskSupervisorHandle {
    tx: mpsc::Sender<RiskCmd>,
}

impl RiskSupervisorHandle {
    pub async fn on_tick(&self, symbol: impl Into<String>, price: Decimal) {
        let _ = self.tx.send(RiskCmd::Tick { symbol: symbol.into(), price }).await;
    }

    pub async fn record_api_call(&self, failed: bool) {
        let _ = self.tx.send(RiskCmd::RecordApiCall { failed }).await;
    }

    pub async fn allow_start(
        &self,
        symbol: impl Into<String>,
        investment: Decimal,
        btc_filter_enabled: bool,
    ) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(RiskCmd::AllowStart { symbol: symbol.into(), investment, btc_filter_enabled, reply })
            .await;
        rx.await.unwrap_or_else(|_| Err("risk supervisor unavailable".into()))
    }

    pub async fn btc_filter_active(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RiskCmd::BtcFilterActive { reply }).await;
        rx.await.unwrap_or(false)
    }

    pub async fn is_killed(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RiskCmd::IsKilled { reply }).await;
        rx.await.unwrap_or(true)
    }

    pub async fn reset_kill(&self) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RiskCmd::ResetKill { reply }).await;
        rx.await.unwrap_or_else(|_| Err("risk supervisor unavailable".into()))
    }

    pub async fn snapshot(&self) -> RiskSnapshot {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RiskCmd::Snapshot { reply }).await;
        rx.await.unwrap_or(RiskSnapshot {
            total_equity: Decimal::ZERO,
            initial_equity: Decimal::ZERO,
            drawdown_percent: Decimal::ZERO,
            api_error_rate: Decimal::ZERO,
            volatility_breakers: 0,
            kill_switch_triggered: true,
            kill_switch_reason: Some("risk supervisor unavailable".into()),
            potential_kill_reason: None,
        })
    }
}

struct Actor {
    state: RiskState,
    config: RiskConfig,
    windows: HashMap<String, VolatilityWindow>,
    api_errors: ApiErrorTracker,
    exchange: Arc<dyn Exchange>,
    kill_notify: mpsc::Sender<String>,
}

impl Actor {
    fn volatility_breaker_count(&self) -> u32 {
        self.windows
            .values()
            .filter(|w| w.volatility_pct() > self.config.volatility_threshold_pct)
            .count() as u32
    }

    fn btc_breaker_active(&self) -> bool {
        self.windows
            .get(&self.config.btc_symbol)
            .map(|w| w.volatility_pct() > self.config.volatility_threshold_pct)
            .unwrap_or(false)
    }

    /// Returns Some(reason) if a kill condition currently holds, evaluated fresh every call.
    fn evaluate_kill_condition(&self) -> Option<String> {
        if self.state.drawdown_pct <= -self.config.max_drawdown_pct {
            return Some(format!(
                "drawdown {:.2}% breached max {:.2}%",
                self.state.drawdown_pct, self.config.max_drawdown_pct
            ));
        }
        if let Some(rate) = self.api_errors.error_rate_pct() {
            if rate >= self.config.max_api_error_pct {
                return Some(format!(
                    "API error rate {:.2}% breached max {:.2}%",
                    rate, self.config.max_api_error_pct
                ));
            }
        }
        let vb = self.volatility_breaker_count();
        if vb >= self.config.volatility_breaker_count {
            return Some(format!(
                "{} symbols over volatility threshold (limit {})",
                vb, self.config.volatility_breaker_count
            ));
        }
        None
    }

    async fn recheck_and_maybe_kill(&mut self) {
        if self.state.kill_switch {
            return;
        }
        if let Some(reason) = self.evaluate_kill_condition() {
            warn!(reason = %reason, "risk supervisor tripping kill switch");
            self.state.latch_kill(reason.clone());
            let _ = self.kill_notify.send(reason).await;
        }
    }

    async fn poll_equity(&mut self) {
        match self.exchange.wallet_equity().await {
            Ok(equity) => {
                self.state.observe_equity(equity);
                self.state.last_check_ts = Some(Utc::now());
                self.recheck_and_maybe_kill().await;
            }
            Err(e) => warn!(error = %e, "equity poll failed"),
        }
    }

    fn handle(&mut self, cmd: RiskCmd) -> Option<oneshot::Sender<RiskSnapshot>> {
        match cmd {
            RiskCmd::Tick { symbol, price } => {
                self.windows
                    .entry(symbol)
                    .or_insert_with(|| VolatilityWindow::new(self.config.price_window_capacity))
                    .push(price, Utc::now());
                self.state.volatility_breakers_active = self.volatility_breaker_count();
                None
            }
            RiskCmd::RecordApiCall { failed } => {
                self.api_errors.record(failed);
                self.state.api_calls_total = self.api_errors.total_calls();
                self.state.api_calls_failed = self.api_errors.failed_calls();
                None
            }
            RiskCmd::AllowStart { symbol, investment, btc_filter_enabled, reply } => {
                let result = self.check_allow_start(&symbol, investment, btc_filter_enabled);
                let _ = reply.send(result);
                None
            }
            RiskCmd::BtcFilterActive { reply } => {
                let _ = reply.send(self.btc_breaker_active());
                None
            }
            RiskCmd::IsKilled { reply } => {
                let _ = reply.send(self.state.kill_switch);
                None
            }
            RiskCmd::ResetKill { reply } => {
                let result = if let Some(reason) = self.evaluate_kill_condition() {
                    Err(reason)
                } else {
                    self.state.reset_kill();
                    info!("kill switch reset");
                    Ok(())
                };
                let _ = reply.send(result);
                None
            }
            RiskCmd::Snapshot { reply } => {
                Some(reply)
            }
        }
    }

    fn check_allow_start(&self, symbol: &str, investment: Decimal, btc_filter_enabled: bool) -> Result<(), String> {
        if self.state.kill_switch {
            return Err(self.state.kill_reason.clone().unwrap_or_else(|| "killed".into()));
        }
        let _ = symbol;
        if btc_filter_enabled && self.btc_breaker_active() {
            return Err("BTC volatility breaker active".into());
        }
        if !self.state.current_equity.is_zero() {
            let pct = investment / self.state.current_equity * Decimal::from(100);
            if pct > self.config.max_position_pct {
                return Err(format!(
                    "position would be {:.2}% of equity, exceeds max {:.2}%",
                    pct, self.config.max_position_pct
                ));
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            total_equity: self.state.current_equity,
            initial_equity: self.state.initial_equity.unwrap_or(Decimal::ZERO),
            drawdown_percent: self.state.drawdown_pct,
            api_error_rate: self.state.api_error_rate_pct(),
            volatility_breakers: self.state.volatility_breakers_active,
            kill_switch_triggered: self.state.kill_switch,
            kill_switch_reason: self.state.kill_reason.clone(),
            potential_kill_reason: self.evaluate_kill_condition(),
        }
    }
}

pub fn spawn(
    config: RiskConfig,
    exchange: Arc<dyn Exchange>,
    kill_notify: mpsc::Sender<String>,
) -> RiskSupervisorHandle {
    let (tx, mut rx) = mpsc::channel::<RiskCmd>(256);
    let poll_interval = config.equity_poll_interval;
    let mut actor = Actor {
        state: RiskState::default(),
        api_errors: ApiErrorTracker::new(config.api_error_window, config.api_error_warmup),
        windows: HashMap::new(),
        config,
        exchange,
        kill_notify,
    };

    tokio::spawn(async move {
        let mut equity_ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = equity_ticker.tick() => {
                    actor.poll_equity().await;
                }
                maybe_cmd = rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            let needs_recheck = !matches!(cmd, RiskCmd::Snapshot { .. } | RiskCmd::IsKilled { .. } | RiskCmd::BtcFilterActive { .. });
                            if let Some(reply) = actor.handle(cmd) {
                                let snap = actor.snapshot();
                                let _ = reply.send(snap);
                            } else if needs_recheck {
                                actor.recheck_and_maybe_kill().await;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    RiskSupervisorHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock_exchange::MockExchange;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn drawdown_trips_kill_switch() {
        let exchange = Arc::new(MockExchange::new(vec!["BTCUSDT".into()], dec!(10000), 1));
        let (kill_tx, mut kill_rx) = mpsc::channel(4);
        let mut config = RiskConfig::default();
        config.equity_poll_interval = Duration::from_millis(20);
        config.max_drawdown_pct = dec!(10);
        let handle = spawn(config, exchange.clone(), kill_tx);

        // Interval's first tick fires immediately, seeding the baseline at the starting
        // equity (10000) with zero drawdown.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_killed().await);

        // Drop equity 20%, past the 10% max_drawdown_pct configured above.
        exchange.apply_realized_pnl(dec!(-2000)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.is_killed().await);
        let reason = kill_rx.recv().await.unwrap();
        assert!(reason.contains("drawdown"));
    }

    #[tokio::test]
    async fn api_error_rate_trips_after_warmup() {
        let exchange = Arc::new(MockExchange::new(vec!["BTCUSDT".into()], dec!(10000), 1));
        let (kill_tx, mut kill_rx) = mpsc::channel(4);
        let mut config = RiskConfig::default();
        config.api_error_warmup = 10;
        config.max_api_error_pct = dec!(20);
        config.equity_poll_interval = Duration::from_secs(3600);
        let handle = spawn(config, exchange, kill_tx);

        for _ in 0..3 {
            handle.record_api_call(true).await;
        }
        for _ in 0..7 {
            handle.record_api_call(false).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_killed().await);
        let reason = kill_rx.recv().await.unwrap();
        assert!(reason.contains("API error rate"));
    }

    #[tokio::test]
    async fn btc_filter_blocks_start_when_active() {
        let exchange = Arc::new(MockExchange::new(vec!["BTCUSDT".into()], dec!(10000), 1));
        let (kill_tx, _kill_rx) = mpsc::channel(4);
        let mut config = RiskConfig::default();
        config.equity_poll_interval = Duration::from_secs(3600);
        let handle = spawn(config, exchange, kill_tx);

        for p in [dec!(100), dec!(100), dec!(100), dec!(100), dec!(100), dec!(120)] {
            handle.on_tick("BTCUSDT", p).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.btc_filter_active().await);
    }
}
