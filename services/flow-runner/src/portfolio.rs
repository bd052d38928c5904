//! Portfolio view - exposure and theme accounting over open positions

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::types::{to_f64, Direction, Position, Side};

/// Maps symbols to themes; configured membership wins over provider tags
#[derive(Debug, Clone, Default)]
pub struct ThemeBook {
    by_symbol: HashMap<String, String>,
}

impl ThemeBook {
    pub fn from_config(themes: &BTreeMap<String, Vec<String>>) -> Self {
        let mut by_symbol = HashMap::new();
        for (theme, symbols) in themes {
            for symbol in symbols {
                by_symbol.insert(symbol.trim().to_ascii_uppercase(), theme.clone());
            }
        }
        Self { by_symbol }
    }

    /// Theme for a symbol, falling back to the tag carried by the data
    pub fn theme_for(&self, symbol: &str, fallback: Option<&str>) -> Option<String> {
        self.by_symbol
            .get(symbol)
            .cloned()
            .or_else(|| fallback.map(str::to_string))
    }
}

/// Account and positions as seen by the gates in one cycle
#[derive(Debug, Clone)]
pub struct Portfolio {
    pub equity: Decimal,
    pub buying_power: Decimal,
    pub positions: BTreeMap<String, Position>,
    /// Latest marks by symbol
    pub marks: HashMap<String, Decimal>,
    pub last_updated: DateTime<Utc>,
}

/// Portfolio snapshot for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub equity: Decimal,
    pub buying_power: Decimal,
    pub positions: Vec<PositionSnapshot>,
    pub long_notional: Decimal,
    pub short_notional: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub avg_entry: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub entry_score: f64,
    pub theme: Option<String>,
}

impl Portfolio {
    pub fn new(equity: Decimal, buying_power: Decimal) -> Self {
        Self {
            equity,
            buying_power,
            positions: BTreeMap::new(),
            marks: HashMap::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn with_positions<'a>(mut self, positions: impl IntoIterator<Item = &'a Position>) -> Self {
        for pos in positions {
            self.positions.insert(pos.symbol.clone(), pos.clone());
        }
        self
    }

    /// Update current prices
    pub fn mark_to_market(&mut self, prices: &HashMap<String, Decimal>) {
        for (symbol, price) in prices {
            if *price > Decimal::ZERO {
                self.marks.insert(symbol.clone(), *price);
            }
        }
        self.last_updated = Utc::now();
    }

    /// Latest mark, falling back to the entry price
    pub fn mark(&self, pos: &Position) -> Decimal {
        self.marks
            .get(&pos.symbol)
            .copied()
            .unwrap_or(pos.entry_price)
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_held(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    /// Long notional minus short notional
    pub fn net_exposure(&self) -> Decimal {
        self.positions
            .values()
            .map(|p| p.signed_notional(self.mark(p)))
            .sum()
    }

    /// Net exposure as percent of equity, after adding a proposed entry
    pub fn net_exposure_pct_with(&self, direction: Direction, notional: Decimal) -> Option<f64> {
        if self.equity <= Decimal::ZERO {
            return None;
        }
        let proposed = match direction {
            Direction::Bullish => notional,
            Direction::Bearish => -notional,
        };
        Some(to_f64((self.net_exposure() + proposed) / self.equity * Decimal::from(100)))
    }

    /// Gross notional held in `theme`
    pub fn theme_notional(&self, theme: &str, themes: &ThemeBook) -> Decimal {
        self.positions
            .values()
            .filter(|p| {
                themes
                    .theme_for(&p.symbol, p.metadata.theme.as_deref())
                    .as_deref()
                    == Some(theme)
            })
            .map(|p| p.notional(self.mark(p)))
            .sum()
    }

    /// Get portfolio snapshot
    pub fn snapshot(&self) -> PortfolioSnapshot {
        let positions: Vec<PositionSnapshot> = self
            .positions
            .values()
            .map(|pos| {
                let current_price = self.mark(pos);
                PositionSnapshot {
                    symbol: pos.symbol.clone(),
                    side: pos.side,
                    quantity: pos.qty,
                    avg_entry: pos.entry_price,
                    current_price,
                    market_value: pos.notional(current_price),
                    unrealized_pnl: pos.pnl_usd(current_price),
                    entry_score: pos.entry_score,
                    theme: pos.metadata.theme.clone(),
                }
            })
            .collect();

        let long_notional = positions
            .iter()
            .filter(|p| p.side == Side::Long)
            .map(|p| p.market_value)
            .sum();
        let short_notional = positions
            .iter()
            .filter(|p| p.side == Side::Short)
            .map(|p| p.market_value)
            .sum();
        let unrealized_pnl = positions.iter().map(|p| p.unrealized_pnl).sum();

        debug!(
            "Portfolio snapshot: {} positions, long {} short {}",
            positions.len(),
            long_notional,
            short_notional
        );

        PortfolioSnapshot {
            equity: self.equity,
            buying_power: self.buying_power,
            positions,
            long_notional,
            short_notional,
            unrealized_pnl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionMetadata;

    fn position(symbol: &str, side: Side, qty: i64, entry: i64, theme: Option<&str>) -> Position {
        Position {
            symbol: symbol.to_string(),
            side,
            qty: Decimal::from(qty),
            entry_price: Decimal::from(entry),
            entry_score: 3.0,
            entry_time: Utc::now(),
            metadata: PositionMetadata {
                theme: theme.map(str::to_string),
                ..PositionMetadata::default()
            },
        }
    }

    #[test]
    fn test_net_exposure_nets_longs_and_shorts() {
        let long = position("AAPL", Side::Long, 100, 150, None);
        let short = position("TSLA", Side::Short, 20, 250, None);
        let mut portfolio =
            Portfolio::new(Decimal::from(100_000), Decimal::from(50_000)).with_positions([&long, &short]);

        // 15,000 long - 5,000 short
        assert_eq!(portfolio.net_exposure(), Decimal::from(10_000));

        let mut prices = HashMap::new();
        prices.insert("AAPL".to_string(), Decimal::from(160));
        portfolio.mark_to_market(&prices);
        assert_eq!(portfolio.net_exposure(), Decimal::from(11_000));

        let pct = portfolio
            .net_exposure_pct_with(Direction::Bearish, Decimal::from(21_000))
            .unwrap();
        assert!((pct + 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_theme_notional_prefers_config() {
        let mut themes = BTreeMap::new();
        themes.insert("semis".to_string(), vec!["nvda".to_string(), "AMD".to_string()]);
        let book = ThemeBook::from_config(&themes);

        let nvda = position("NVDA", Side::Long, 10, 900, Some("ai"));
        let amd = position("AMD", Side::Long, 50, 160, None);
        let xom = position("XOM", Side::Long, 10, 110, Some("energy"));
        let portfolio = Portfolio::new(Decimal::from(100_000), Decimal::from(100_000))
            .with_positions([&nvda, &amd, &xom]);

        assert_eq!(portfolio.theme_notional("semis", &book), Decimal::from(17_000));
        assert_eq!(portfolio.theme_notional("energy", &book), Decimal::from(1_100));
        assert_eq!(book.theme_for("XOM", None), None);
    }

    #[test]
    fn test_snapshot_totals() {
        let long = position("MSFT", Side::Long, 10, 400, None);
        let mut portfolio =
            Portfolio::new(Decimal::from(20_000), Decimal::from(16_000)).with_positions([&long]);
        let mut prices = HashMap::new();
        prices.insert("MSFT".to_string(), Decimal::from(420));
        portfolio.mark_to_market(&prices);

        let snapshot = portfolio.snapshot();
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(snapshot.unrealized_pnl, Decimal::from(200));
        assert_eq!(snapshot.long_notional, Decimal::from(4_200));
    }
}
