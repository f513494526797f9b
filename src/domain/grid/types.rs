//! Grid data model: parameters, per-level state machine, and aggregate grid state.
//!
//! The level state machine is the load-bearing invariant of the whole engine: a level
//! whose buy has filled must never be cancelled until its matching sell has filled too,
//! or the engine leaves an unhedged position behind.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::errors::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Lifecycle of a single grid level's order pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridLevelStatus {
    /// No order resting at this level.
    Idle,
    /// A buy order is on the book, unfilled.
    BuyPending,
    /// Buy filled; sell not yet placed. Must never be cancelled out from under.
    Holding,
    /// Sell order placed against a filled buy.
    SellPending,
    /// Exchange reported a terminal error placing/cancelling this level's order.
    Faulted,
}

impl GridLevelStatus {
    /// Whether this level may be cancelled during a stop/rebalance without orphaning a
    /// filled buy.
    pub fn can_cancel(&self) -> bool {
        matches!(self, GridLevelStatus::Idle | GridLevelStatus::BuyPending)
    }

    pub fn is_holding(&self) -> bool {
        matches!(self, GridLevelStatus::Holding | GridLevelStatus::SellPending)
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, GridLevelStatus::Faulted)
    }
}

/// One price rung of the grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLevel {
    pub index: usize,
    /// The grid's fixed buy price for this rung; sells are re-derived on each buy fill.
    pub price: Decimal,
    pub quantity: Decimal,
    pub status: GridLevelStatus,
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
    /// Avg fill price of the last buy, kept to compute realized P/L on matching sell.
    pub entry_price: Option<Decimal>,
    pub active_sell_price: Option<Decimal>,
    /// Partial-fill accumulator for whichever order is currently pending.
    pub filled_qty: Decimal,
    pub last_transition_ts: DateTime<Utc>,
}

impl GridLevel {
    pub fn new(index: usize, price: Decimal, quantity: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            index,
            price,
            quantity,
            status: GridLevelStatus::Idle,
            buy_order_id: None,
            sell_order_id: None,
            entry_price: None,
            active_sell_price: None,
            filled_qty: Decimal::ZERO,
            last_transition_ts: now,
        }
    }

    pub fn set_buy_order(&mut self, order_id: String, now: DateTime<Utc>) {
        self.buy_order_id = Some(order_id);
        self.filled_qty = Decimal::ZERO;
        self.status = GridLevelStatus::BuyPending;
        self.last_transition_ts = now;
    }

    pub fn set_sell_order(&mut self, order_id: String, sell_price: Decimal, now: DateTime<Utc>) {
        self.sell_order_id = Some(order_id);
        self.active_sell_price = Some(sell_price);
        self.filled_qty = Decimal::ZERO;
        self.status = GridLevelStatus::SellPending;
        self.last_transition_ts = now;
    }

    /// Buy order reached a terminal FILLED state.
    pub fn on_buy_filled(&mut self, avg_price: Decimal, now: DateTime<Utc>) {
        self.buy_order_id = None;
        self.entry_price = Some(avg_price);
        self.filled_qty = Decimal::ZERO;
        self.status = GridLevelStatus::Holding;
        self.last_transition_ts = now;
    }

    /// Sell order reached a terminal FILLED state. Returns realized P/L net of fee bps.
    pub fn on_sell_filled(&mut self, avg_price: Decimal, fee_bps: u32, now: DateTime<Utc>) -> Decimal {
        let entry = self.entry_price.take().unwrap_or(self.price);
        self.sell_order_id = None;
        self.active_sell_price = None;
        self.filled_qty = Decimal::ZERO;
        self.status = GridLevelStatus::Idle;
        self.last_transition_ts = now;

        let gross = (avg_price - entry) * self.quantity;
        if fee_bps == 0 {
            gross
        } else {
            let fee = avg_price * self.quantity * Decimal::from(fee_bps) / Decimal::from(10_000u32);
            gross - fee
        }
    }

    pub fn mark_faulted(&mut self, now: DateTime<Utc>) {
        self.status = GridLevelStatus::Faulted;
        self.last_transition_ts = now;
    }

    /// Clear a dropped/externally-cancelled order so the next tick re-places it.
    pub fn clear_for_replacement(&mut self, now: DateTime<Utc>) {
        if !self.status.is_holding() {
            self.buy_order_id = None;
            self.sell_order_id = None;
            self.status = GridLevelStatus::Idle;
            self.last_transition_ts = now;
        }
    }

    pub fn can_cancel(&self) -> bool {
        self.status.can_cancel()
    }

    pub fn holding(&self) -> bool {
        self.status.is_holding()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Stopped,
    Running,
    Paused,
    Killed,
}

/// Immutable per-deployment configuration for one symbol's grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParameters {
    pub symbol: String,
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    pub grid_count: u32,
    pub total_investment: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub btc_filter_enabled: bool,
    pub fee_bps: u32,
}

impl GridParameters {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.upper_price <= self.lower_price {
            return Err(CoreError::InvalidParameters(
                "upper_price must be greater than lower_price".into(),
            ));
        }
        if self.lower_price <= Decimal::ZERO {
            return Err(CoreError::InvalidParameters("lower_price must be positive".into()));
        }
        if self.grid_count < 2 {
            return Err(CoreError::InvalidParameters("grid_count must be at least 2".into()));
        }
        if self.total_investment <= Decimal::ZERO {
            return Err(CoreError::InvalidParameters("total_investment must be positive".into()));
        }
        if let Some(sl) = self.stop_loss {
            if sl >= self.lower_price {
                return Err(CoreError::InvalidParameters(
                    "stop_loss must be below lower_price".into(),
                ));
            }
        }
        if let Some(tp) = self.take_profit {
            if tp <= self.upper_price {
                return Err(CoreError::InvalidParameters(
                    "take_profit must be above upper_price".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn spacing(&self) -> Decimal {
        (self.upper_price - self.lower_price) / Decimal::from(self.grid_count)
    }

    pub fn invest_per_level(&self) -> Decimal {
        self.total_investment / Decimal::from(self.grid_count)
    }

    /// Center-aligned level price: the midpoint of rung `index`'s band.
    pub fn level_price(&self, index: usize) -> Decimal {
        let half = Decimal::new(5, 1); // 0.5
        self.lower_price + (Decimal::from(index as u64) + half) * self.spacing()
    }
}

/// Aggregate runtime state for one symbol's grid.
#[derive(Debug, Clone)]
pub struct GridState {
    pub params: GridParameters,
    pub levels: Vec<GridLevel>,
    pub current_price: Decimal,
    pub status: WorkerStatus,
    pub total_buys: u64,
    pub total_sells: u64,
    pub realized_pnl: Decimal,
    pub last_tick_ts: Option<DateTime<Utc>>,
    /// Bumped on every stop/rebalance; stale exchange callbacks carrying an older epoch
    /// are discarded without mutating state.
    pub epoch: u64,
    pub stop_loss_tripped: bool,
    pub faulted_levels: HashSet<usize>,
}

impl GridState {
    pub fn new(params: GridParameters, now: DateTime<Utc>) -> Result<Self, CoreError> {
        params.validate()?;
        let qty_per_level = params.invest_per_level();
        let levels = (0..params.grid_count as usize)
            .map(|i| {
                let price = params.level_price(i);
                let quantity = if price.is_zero() { Decimal::ZERO } else { qty_per_level / price };
                GridLevel::new(i, price, quantity, now)
            })
            .collect();

        Ok(Self {
            params,
            levels,
            current_price: Decimal::ZERO,
            status: WorkerStatus::Stopped,
            total_buys: 0,
            total_sells: 0,
            realized_pnl: Decimal::ZERO,
            last_tick_ts: None,
            epoch: 0,
            stop_loss_tripped: false,
            faulted_levels: HashSet::new(),
        })
    }

    /// Rebuild all levels from the current parameters, discarding in-flight order
    /// references. Bumps the epoch so stale callbacks from before the rebuild are ignored.
    pub fn rebuild_levels(&mut self, now: DateTime<Utc>) {
        let qty_per_level = self.params.invest_per_level();
        self.levels = (0..self.params.grid_count as usize)
            .map(|i| {
                let price = self.params.level_price(i);
                let quantity = if price.is_zero() { Decimal::ZERO } else { qty_per_level / price };
                GridLevel::new(i, price, quantity, now)
            })
            .collect();
        self.faulted_levels.clear();
        self.epoch += 1;
    }

    pub fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub fn cancellable_level_indices(&self) -> Vec<usize> {
        self.levels
            .iter()
            .filter(|l| l.can_cancel() && (l.buy_order_id.is_some() || l.sell_order_id.is_some()))
            .map(|l| l.index)
            .collect()
    }

    pub fn holding_levels(&self) -> Vec<usize> {
        self.levels.iter().filter(|l| l.holding()).map(|l| l.index).collect()
    }

    pub fn open_order_count(&self) -> usize {
        self.levels
            .iter()
            .filter(|l| l.buy_order_id.is_some() || l.sell_order_id.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        "2026-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn level_transitions_prevent_cancel_after_buy_filled() {
        let mut level = GridLevel::new(0, dec!(100), dec!(1), now());
        assert!(level.can_cancel());

        level.set_buy_order("BUY-1".into(), now());
        assert_eq!(level.status, GridLevelStatus::BuyPending);
        assert!(level.can_cancel());

        level.on_buy_filled(dec!(100), now());
        assert_eq!(level.status, GridLevelStatus::Holding);
        assert!(!level.can_cancel(), "must not cancel a level holding a filled buy");

        level.set_sell_order("SELL-1".into(), dec!(102), now());
        assert_eq!(level.status, GridLevelStatus::SellPending);
        assert!(!level.can_cancel());

        let pnl = level.on_sell_filled(dec!(102), 0, now());
        assert_eq!(pnl, dec!(2));
        assert_eq!(level.status, GridLevelStatus::Idle);
        assert!(level.can_cancel());
    }

    #[test]
    fn sell_fill_nets_fee_bps() {
        let mut level = GridLevel::new(0, dec!(100), dec!(1), now());
        level.set_buy_order("BUY-1".into(), now());
        level.on_buy_filled(dec!(100), now());
        level.set_sell_order("SELL-1".into(), dec!(102), now());
        // 10 bps fee on notional 102 * 1 = 0.102
        let pnl = level.on_sell_filled(dec!(102), 10, now());
        assert_eq!(pnl, dec!(2) - dec!(0.102));
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let params = GridParameters {
            symbol: "BTCUSDT".into(),
            lower_price: dec!(100),
            upper_price: dec!(90),
            grid_count: 4,
            total_investment: dec!(1000),
            stop_loss: None,
            take_profit: None,
            btc_filter_enabled: false,
            fee_bps: 0,
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn grid_state_builds_center_aligned_levels() {
        let params = GridParameters {
            symbol: "BTCUSDT".into(),
            lower_price: dec!(95500),
            upper_price: dec!(99000),
            grid_count: 12,
            total_investment: dec!(25000),
            stop_loss: Some(dec!(94750)),
            take_profit: None,
            btc_filter_enabled: false,
            fee_bps: 0,
        };
        let state = GridState::new(params, now()).unwrap();
        assert_eq!(state.levels.len(), 12);
        // spacing = 3500/12 = 291.6666...
        let spacing = state.params.spacing();
        assert_eq!(state.levels[0].price, state.params.lower_price + spacing / dec!(2));
        assert!(state.cancellable_level_indices().is_empty());
    }

    #[test]
    fn holding_levels_survive_rebuild_tracking() {
        let params = GridParameters {
            symbol: "ETHUSDT".into(),
            lower_price: dec!(1000),
            upper_price: dec!(2000),
            grid_count: 4,
            total_investment: dec!(4000),
            stop_loss: None,
            take_profit: None,
            btc_filter_enabled: false,
            fee_bps: 0,
        };
        let mut state = GridState::new(params, now()).unwrap();
        state.levels[0].set_buy_order("B".into(), now());
        state.levels[0].on_buy_filled(dec!(1100), now());
        assert_eq!(state.holding_levels(), vec![0]);
    }
}
