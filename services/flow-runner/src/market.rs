//! Per-symbol price history built from quotes observed each cycle

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// Timestamped price observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub at: DateTime<Utc>,
    pub price: f64,
}

/// Rolling price history, bounded per symbol
#[derive(Debug, Clone)]
pub struct PriceHistory {
    series: HashMap<String, VecDeque<PricePoint>>,
    max_points: usize,
}

impl PriceHistory {
    pub fn new(max_points: usize) -> Self {
        Self {
            series: HashMap::new(),
            max_points: max_points.max(2),
        }
    }

    /// Record a price; non-finite or non-positive prices are ignored
    pub fn record(&mut self, symbol: &str, at: DateTime<Utc>, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        let series = self.series.entry(symbol.to_string()).or_default();
        if let Some(last) = series.back() {
            if at < last.at {
                return;
            }
        }
        series.push_back(PricePoint { at, price });
        while series.len() > self.max_points {
            series.pop_front();
        }
    }

    pub fn latest(&self, symbol: &str) -> Option<f64> {
        self.series.get(symbol)?.back().map(|p| p.price)
    }

    /// Closing prices, oldest first
    pub fn closes(&self, symbol: &str) -> Vec<f64> {
        self.series
            .get(symbol)
            .map(|s| s.iter().map(|p| p.price).collect())
            .unwrap_or_default()
    }

    /// Percent change from the oldest observation inside `horizon` to the
    /// latest one; `None` without two observations in the window
    pub fn change_pct(&self, symbol: &str, horizon: Duration, now: DateTime<Utc>) -> Option<f64> {
        let series = self.series.get(symbol)?;
        let latest = series.back()?;
        let cutoff = now - horizon;
        let first = series.iter().find(|p| p.at >= cutoff)?;
        if first.at == latest.at || first.price <= 0.0 {
            return None;
        }
        Some((latest.price / first.price - 1.0) * 100.0)
    }

    pub fn forget(&mut self, symbol: &str) {
        self.series.remove(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_pct_uses_horizon() {
        let now = Utc::now();
        let mut history = PriceHistory::new(100);
        history.record("SPY", now - Duration::minutes(30), 90.0);
        history.record("SPY", now - Duration::minutes(10), 100.0);
        history.record("SPY", now, 101.0);

        let change = history
            .change_pct("SPY", Duration::minutes(15), now)
            .unwrap();
        assert!((change - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_point_has_no_change() {
        let now = Utc::now();
        let mut history = PriceHistory::new(10);
        history.record("QQQ", now, 400.0);
        assert!(history
            .change_pct("QQQ", Duration::minutes(15), now)
            .is_none());
        assert!(history.change_pct("MISSING", Duration::minutes(15), now).is_none());
    }

    #[test]
    fn test_bounded_and_rejects_bad_prices() {
        let now = Utc::now();
        let mut history = PriceHistory::new(3);
        for i in 0..5 {
            history.record("IWM", now + Duration::seconds(i), 200.0 + i as f64);
        }
        history.record("IWM", now + Duration::seconds(10), f64::NAN);
        history.record("IWM", now + Duration::seconds(11), -1.0);

        assert_eq!(history.closes("IWM"), vec![202.0, 203.0, 204.0]);
        assert_eq!(history.latest("IWM"), Some(204.0));
    }
}
