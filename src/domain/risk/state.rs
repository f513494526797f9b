//! Aggregate risk state tracked by the `RiskSupervisor`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct RiskState {
    pub initial_equity: Option<Decimal>,
    pub current_equity: Decimal,
    pub drawdown_pct: Decimal,
    pub api_calls_total: u64,
    pub api_calls_failed: u64,
    pub volatility_breakers_active: u32,
    pub kill_switch: bool,
    pub kill_reason: Option<String>,
    pub last_check_ts: Option<DateTime<Utc>>,
}

impl Default for RiskState {
    fn default() -> Self {
        Self {
            initial_equity: None,
            current_equity: Decimal::ZERO,
            drawdown_pct: Decimal::ZERO,
            api_calls_total: 0,
            api_calls_failed: 0,
            volatility_breakers_active: 0,
            kill_switch: false,
            kill_reason: None,
            last_check_ts: None,
        }
    }
}

impl RiskState {
    /// Record a new equity reading, seeding the baseline on the first call.
    pub fn observe_equity(&mut self, equity: Decimal) {
        let baseline = *self.initial_equity.get_or_insert(equity);
        self.current_equity = equity;
        self.drawdown_pct = if baseline.is_zero() {
            Decimal::ZERO
        } else {
            (equity - baseline) / baseline * Decimal::from(100)
        };
    }

    pub fn api_error_rate_pct(&self) -> Decimal {
        if self.api_calls_total == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.api_calls_failed) * Decimal::from(100) / Decimal::from(self.api_calls_total)
    }

    pub fn latch_kill(&mut self, reason: impl Into<String>) {
        if !self.kill_switch {
            self.kill_switch = true;
            self.kill_reason = Some(reason.into());
        }
    }

    pub fn reset_kill(&mut self) {
        self.kill_switch = false;
        self.kill_reason = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn drawdown_tracks_from_first_reading() {
        let mut state = RiskState::default();
        state.observe_equity(dec!(10000));
        assert_eq!(state.drawdown_pct, Decimal::ZERO);
        state.observe_equity(dec!(7000));
        assert_eq!(state.drawdown_pct, dec!(-30));
    }

    #[test]
    fn kill_latch_is_sticky() {
        let mut state = RiskState::default();
        state.latch_kill("drawdown");
        state.latch_kill("volatility");
        assert_eq!(state.kill_reason.as_deref(), Some("drawdown"));
        state.reset_kill();
        assert!(!state.kill_switch);
        assert!(state.kill_reason.is_none());
    }
}
