//! Rolling-window statistics backing the RiskSupervisor's breakers.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Per-symbol rolling price window. Volatility is computed over the most recent
/// `min(len, VOL_SAMPLE)` prices, not the full window, so a slow drift across the full
/// window doesn't mask a sharp recent move.
const VOL_SAMPLE: usize = 10;

#[derive(Debug, Clone)]
pub struct VolatilityWindow {
    prices: VecDeque<(Decimal, DateTime<Utc>)>,
    capacity: usize,
}

impl VolatilityWindow {
    pub fn new(capacity: usize) -> Self {
        Self { prices: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, price: Decimal, ts: DateTime<Utc>) {
        self.prices.push_back((price, ts));
        while self.prices.len() > self.capacity {
            self.prices.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Max absolute deviation from the sample mean, expressed as a percentage.
    pub fn volatility_pct(&self) -> Decimal {
        let sample_len = self.prices.len().min(VOL_SAMPLE);
        if sample_len == 0 {
            return Decimal::ZERO;
        }
        let sample: Vec<Decimal> = self
            .prices
            .iter()
            .rev()
            .take(sample_len)
            .map(|(p, _)| *p)
            .collect();
        let mean = sample.iter().sum::<Decimal>() / Decimal::from(sample.len() as u64);
        if mean.is_zero() {
            return Decimal::ZERO;
        }
        sample
            .iter()
            .map(|p| ((p - mean).abs() / mean) * Decimal::from(100))
            .fold(Decimal::ZERO, Decimal::max)
    }
}

/// Ring buffer of the last N exchange call outcomes, used to derive the API error rate
/// deterministically (independent of wall-clock cadence).
#[derive(Debug, Clone)]
pub struct ApiErrorTracker {
    outcomes: VecDeque<bool>,
    capacity: usize,
    warmup_calls: u64,
}

impl ApiErrorTracker {
    pub fn new(capacity: usize, warmup_calls: u64) -> Self {
        Self { outcomes: VecDeque::with_capacity(capacity), capacity, warmup_calls }
    }

    pub fn record(&mut self, failed: bool) {
        self.outcomes.push_back(failed);
        while self.outcomes.len() > self.capacity {
            self.outcomes.pop_front();
        }
    }

    pub fn total_calls(&self) -> u64 {
        self.outcomes.len() as u64
    }

    pub fn failed_calls(&self) -> u64 {
        self.outcomes.iter().filter(|f| **f).count() as u64
    }

    /// `None` while still inside the warm-up period; the kill check must treat that as
    /// "not breached" rather than dividing by a near-zero sample.
    pub fn error_rate_pct(&self) -> Option<Decimal> {
        if self.total_calls() < self.warmup_calls {
            return None;
        }
        Some(Decimal::from(self.failed_calls()) * Decimal::from(100) / Decimal::from(self.total_calls()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn volatility_tracks_deviation_from_recent_mean() {
        let mut window = VolatilityWindow::new(100);
        for p in [100.0, 100.0, 100.0, 100.0, 100.0] {
            window.push(Decimal::try_from(p).unwrap(), ts("2026-01-01T00:00:00Z"));
        }
        assert_eq!(window.volatility_pct(), Decimal::ZERO);

        window.push(dec!(106), ts("2026-01-01T00:01:00Z"));
        // mean of 6 samples = (5*100 + 106)/6 = 101.0, deviation of 106 = 5/101*100 ~= 4.95%
        assert!(window.volatility_pct() > dec!(4.9));
        assert!(window.volatility_pct() < dec!(5.0));
    }

    #[test]
    fn error_tracker_respects_warmup_guard() {
        let mut tracker = ApiErrorTracker::new(1000, 50);
        for _ in 0..10 {
            tracker.record(true);
        }
        assert!(tracker.error_rate_pct().is_none(), "must stay None below warm-up threshold");

        for _ in 0..40 {
            tracker.record(false);
        }
        assert_eq!(tracker.total_calls(), 50);
        assert!(tracker.error_rate_pct().is_some());
        assert_eq!(tracker.error_rate_pct().unwrap(), dec!(20));
    }

    #[test]
    fn error_tracker_evicts_beyond_capacity() {
        let mut tracker = ApiErrorTracker::new(4, 0);
        tracker.record(true);
        tracker.record(true);
        tracker.record(false);
        tracker.record(false);
        tracker.record(false); // evicts first `true`
        assert_eq!(tracker.total_calls(), 4);
        assert_eq!(tracker.failed_calls(), 1);
    }
}
