//! Prometheus metrics, pulled fresh from `GridSnapshot`/`RiskSnapshot` on every scrape.
//!
//! Grounded on the teacher's `infrastructure/observability/metrics.rs`: one `Registry`,
//! one struct of typed metric handles, a `render()` returning the text exposition format.
//! Unlike the teacher's push-based gauges (updated inline as trades happen), this core
//! has no single place trades flow through outside the per-symbol actor, so values are
//! recomputed from the `Controller`'s snapshots at scrape time instead of tracked live.

use std::collections::HashMap;

use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use rust_decimal::prelude::ToPrimitive;

use crate::application::grid_worker::{GridSnapshot, WorkerStatusWire};
use crate::application::risk_supervisor::RiskSnapshot;

pub struct GridMetrics {
    registry: Registry,
    current_price: GaugeVec,
    realized_pnl_usd: GaugeVec,
    filled_levels: IntGaugeVec,
    pending_buys: IntGaugeVec,
    pending_sells: IntGaugeVec,
    worker_status: IntGaugeVec,
    drawdown_percent: Gauge,
    api_error_rate_percent: Gauge,
    volatility_breakers_active: IntGauge,
    kill_switch_triggered: IntGauge,
}

fn worker_status_code(status: WorkerStatusWire) -> i64 {
    match status {
        WorkerStatusWire::Stopped => 0,
        WorkerStatusWire::Running => 1,
        WorkerStatusWire::Paused => 2,
        WorkerStatusWire::Killed => 3,
    }
}

impl GridMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let current_price = GaugeVec::new(
            Opts::new("gridcore_current_price", "Last observed price per symbol"),
            &["symbol"],
        )?;
        registry.register(Box::new(current_price.clone()))?;

        let realized_pnl_usd = GaugeVec::new(
            Opts::new("gridcore_realized_pnl_usd", "Cumulative realized P&L per symbol"),
            &["symbol"],
        )?;
        registry.register(Box::new(realized_pnl_usd.clone()))?;

        let filled_levels = IntGaugeVec::new(
            Opts::new("gridcore_filled_levels", "Grid levels currently holding a filled buy"),
            &["symbol"],
        )?;
        registry.register(Box::new(filled_levels.clone()))?;

        let pending_buys = IntGaugeVec::new(
            Opts::new("gridcore_pending_buys", "Grid levels with a resting buy order"),
            &["symbol"],
        )?;
        registry.register(Box::new(pending_buys.clone()))?;

        let pending_sells = IntGaugeVec::new(
            Opts::new("gridcore_pending_sells", "Grid levels with a resting sell order"),
            &["symbol"],
        )?;
        registry.register(Box::new(pending_sells.clone()))?;

        let worker_status = IntGaugeVec::new(
            Opts::new("gridcore_worker_status", "0=stopped 1=running 2=paused 3=killed"),
            &["symbol"],
        )?;
        registry.register(Box::new(worker_status.clone()))?;

        let drawdown_percent = Gauge::with_opts(Opts::new(
            "gridcore_drawdown_percent",
            "Current equity drawdown from the initial observed baseline",
        ))?;
        registry.register(Box::new(drawdown_percent.clone()))?;

        let api_error_rate_percent = Gauge::with_opts(Opts::new(
            "gridcore_api_error_rate_percent",
            "Exchange API error rate over the rolling call window",
        ))?;
        registry.register(Box::new(api_error_rate_percent.clone()))?;

        let volatility_breakers_active = IntGauge::with_opts(Opts::new(
            "gridcore_volatility_breakers_active",
            "Number of tracked symbols currently over the volatility threshold",
        ))?;
        registry.register(Box::new(volatility_breakers_active.clone()))?;

        let kill_switch_triggered = IntGauge::with_opts(Opts::new(
            "gridcore_kill_switch_triggered",
            "1 if the risk supervisor kill switch is latched",
        ))?;
        registry.register(Box::new(kill_switch_triggered.clone()))?;

        Ok(Self {
            registry,
            current_price,
            realized_pnl_usd,
            filled_levels,
            pending_buys,
            pending_sells,
            worker_status,
            drawdown_percent,
            api_error_rate_percent,
            volatility_breakers_active,
            kill_switch_triggered,
        })
    }

    /// Refreshes every gauge from the latest controller-wide snapshot and renders the
    /// Prometheus text exposition format.
    pub fn render(&self, grids: &HashMap<String, GridSnapshot>, risk: &RiskSnapshot) -> String {
        for (symbol, snap) in grids {
            let price = snap.current_price.to_f64().unwrap_or(0.0);
            let pnl = snap.realized_pnl.to_f64().unwrap_or(0.0);
            self.current_price.with_label_values(&[symbol]).set(price);
            self.realized_pnl_usd.with_label_values(&[symbol]).set(pnl);
            self.filled_levels.with_label_values(&[symbol]).set(snap.filled_levels as i64);
            self.pending_buys.with_label_values(&[symbol]).set(snap.pending_buys as i64);
            self.pending_sells.with_label_values(&[symbol]).set(snap.pending_sells as i64);
            self.worker_status.with_label_values(&[symbol]).set(worker_status_code(snap.status));
        }
        self.drawdown_percent.set(risk.drawdown_percent.to_f64().unwrap_or(0.0));
        self.api_error_rate_percent.set(risk.api_error_rate.to_f64().unwrap_or(0.0));
        self.volatility_breakers_active.set(risk.volatility_breakers as i64);
        self.kill_switch_triggered.set(if risk.kill_switch_triggered { 1 } else { 0 });

        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if encoder.encode(&families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn sample_snapshot(symbol: &str) -> GridSnapshot {
        GridSnapshot {
            symbol: symbol.to_string(),
            status: WorkerStatusWire::Running,
            current_price: dec!(100),
            lower_price: dec!(90),
            upper_price: dec!(110),
            grid_count: 4,
            filled_levels: 2,
            pending_buys: 1,
            pending_sells: 2,
            total_buys: 3,
            total_sells: 1,
            realized_pnl: dec!(12.5),
            last_update: Some(Utc::now()),
            stop_loss_tripped: false,
        }
    }

    fn sample_risk() -> RiskSnapshot {
        RiskSnapshot {
            total_equity: dec!(10000),
            initial_equity: dec!(10000),
            drawdown_percent: dec!(0),
            api_error_rate: dec!(0),
            volatility_breakers: 0,
            kill_switch_triggered: false,
            kill_switch_reason: None,
            potential_kill_reason: None,
        }
    }

    #[test]
    fn render_includes_per_symbol_gauges() {
        let metrics = GridMetrics::new().unwrap();
        let mut grids = HashMap::new();
        grids.insert("BTCUSDT".to_string(), sample_snapshot("BTCUSDT"));
        let out = metrics.render(&grids, &sample_risk());
        assert!(out.contains("gridcore_current_price"));
        assert!(out.contains("BTCUSDT"));
        assert!(out.contains("gridcore_kill_switch_triggered 0"));
    }
}
