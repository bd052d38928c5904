//! Exit rules for open positions
//!
//! Every rule is evaluated on every pass. All firing triggers are joined with
//! `+` into the close reason so outcome attribution sees the whole picture.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ExitConfig;
use crate::types::{to_f64, Position, Side};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum ExitTrigger {
    StopLoss { pnl_pct: f64 },
    TrailingStop { pnl_pct: f64 },
    ProfitTarget { pnl_pct: f64 },
    TimeExit { max_hold_minutes: i64 },
    SignalDecay { ratio: f64 },
    Displaced { by: String },
}

fn hold_label(minutes: i64) -> String {
    if minutes > 0 && minutes % 60 == 0 {
        format!("{}h", minutes / 60)
    } else {
        format!("{}m", minutes)
    }
}

impl fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitTrigger::StopLoss { pnl_pct } => write!(f, "stop_loss({:+.1}%)", pnl_pct),
            ExitTrigger::TrailingStop { pnl_pct } => write!(f, "trailing_stop({:+.1}%)", pnl_pct),
            ExitTrigger::ProfitTarget { pnl_pct } => write!(f, "profit_target({:+.1}%)", pnl_pct),
            ExitTrigger::TimeExit { max_hold_minutes } => {
                write!(f, "time_exit({})", hold_label(*max_hold_minutes))
            }
            ExitTrigger::SignalDecay { ratio } => write!(f, "signal_decay({:.2})", ratio),
            ExitTrigger::Displaced { by } => write!(f, "displaced({})", by),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitDecision {
    pub symbol: String,
    pub triggers: Vec<ExitTrigger>,
    pub pnl_pct: f64,
}

impl ExitDecision {
    pub fn displaced(symbol: &str, by: &str, pnl_pct: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            triggers: vec![ExitTrigger::Displaced { by: by.to_string() }],
            pnl_pct,
        }
    }

    /// Composite close reason, e.g. `time_exit(3h)+signal_decay(0.57)`
    pub fn reason(&self) -> String {
        self.triggers
            .iter()
            .map(ExitTrigger::to_string)
            .collect::<Vec<_>>()
            .join("+")
    }
}

pub struct ExitManager {
    config: ExitConfig,
}

impl ExitManager {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    /// Trail distance in percent for a given favorable excursion
    pub fn trail_distance(&self, excursion_pct: f64) -> f64 {
        (self.config.trail_base_pct - self.config.trail_tighten_factor * excursion_pct)
            .max(self.config.trail_min_pct)
    }

    /// Evaluate one position at `price`. Updates the high-water mark.
    pub fn evaluate(
        &self,
        position: &mut Position,
        price: Decimal,
        current_score: f64,
        now: DateTime<Utc>,
    ) -> Option<ExitDecision> {
        if price <= Decimal::ZERO {
            return None;
        }
        let high_water = match (position.metadata.high_water_price, position.side) {
            (Some(hw), Side::Long) => hw.max(price),
            (Some(hw), Side::Short) => hw.min(price),
            (None, _) => price,
        };
        position.metadata.high_water_price = Some(high_water);

        let pnl_pct = position.pnl_pct(price);
        let mut triggers = Vec::new();

        if pnl_pct <= -self.config.stop_loss_pct {
            triggers.push(ExitTrigger::StopLoss { pnl_pct });
        }

        let excursion = position.pnl_pct(high_water);
        if excursion >= self.config.trail_activation_pct && high_water > Decimal::ZERO {
            let giveback =
                to_f64((high_water - price) / high_water * Decimal::from(100) * position.side.sign());
            if giveback >= self.trail_distance(excursion) {
                triggers.push(ExitTrigger::TrailingStop { pnl_pct });
            }
        }

        if pnl_pct >= self.config.profit_target_pct {
            triggers.push(ExitTrigger::ProfitTarget { pnl_pct });
        }

        if position.held_minutes(now) >= self.config.max_hold_minutes {
            triggers.push(ExitTrigger::TimeExit {
                max_hold_minutes: self.config.max_hold_minutes,
            });
        }

        // adopted positions carry no entry score to decay from
        if position.entry_score > 0.0 {
            let ratio = current_score / position.entry_score;
            if ratio < self.config.decay_ratio {
                triggers.push(ExitTrigger::SignalDecay { ratio });
            }
        }

        if triggers.is_empty() {
            return None;
        }
        Some(ExitDecision {
            symbol: position.symbol.clone(),
            triggers,
            pnl_pct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionMetadata;
    use chrono::Duration;

    fn position(side: Side, entry: i64, entry_score: f64, held_minutes: i64, now: DateTime<Utc>) -> Position {
        Position {
            symbol: "NVDA".to_string(),
            side,
            qty: Decimal::from(10),
            entry_price: Decimal::from(entry),
            entry_score,
            entry_time: now - Duration::minutes(held_minutes),
            metadata: PositionMetadata {
                high_water_price: Some(Decimal::from(entry)),
                ..PositionMetadata::default()
            },
        }
    }

    #[test]
    fn test_time_and_decay_compose() {
        let now = Utc::now();
        let manager = ExitManager::new(ExitConfig::default());
        let mut pos = position(Side::Long, 100, 3.0, 185, now);

        let decision = manager
            .evaluate(&mut pos, Decimal::from(101), 1.7, now)
            .unwrap();
        assert_eq!(decision.reason(), "time_exit(3h)+signal_decay(0.57)");
    }

    #[test]
    fn test_quiet_position_holds() {
        let now = Utc::now();
        let manager = ExitManager::new(ExitConfig::default());
        let mut pos = position(Side::Long, 100, 3.0, 30, now);
        assert!(manager.evaluate(&mut pos, Decimal::from(101), 2.9, now).is_none());
        assert_eq!(pos.metadata.high_water_price, Some(Decimal::from(101)));
    }

    #[test]
    fn test_stop_loss_for_short() {
        let now = Utc::now();
        let manager = ExitManager::new(ExitConfig::default());
        let mut pos = position(Side::Short, 100, 3.0, 10, now);
        let decision = manager
            .evaluate(&mut pos, Decimal::from(104), 3.0, now)
            .unwrap();
        assert_eq!(decision.reason(), "stop_loss(-4.0%)");
    }

    #[test]
    fn test_trailing_stop_tightens_with_excursion() {
        let manager = ExitManager::new(ExitConfig::default());
        assert!((manager.trail_distance(2.0) - 2.2).abs() < 1e-9);
        assert!((manager.trail_distance(10.0) - 1.0).abs() < 1e-9);

        let now = Utc::now();
        let mut pos = position(Side::Long, 100, 3.0, 10, now);
        // run up 6% then give back 2%
        assert!(manager.evaluate(&mut pos, Decimal::from(106), 3.0, now).is_none());
        let decision = manager
            .evaluate(&mut pos, Decimal::new(10388, 2), 3.0, now)
            .unwrap();
        assert_eq!(decision.triggers.len(), 1);
        assert!(decision.reason().starts_with("trailing_stop(+3.9"));
    }

    #[test]
    fn test_adopted_position_skips_decay() {
        let now = Utc::now();
        let manager = ExitManager::new(ExitConfig::default());
        let mut pos = position(Side::Long, 100, 0.0, 10, now);
        assert!(manager.evaluate(&mut pos, Decimal::from(100), 0.0, now).is_none());
    }

    #[test]
    fn test_displaced_reason() {
        let decision = ExitDecision::displaced("XOM", "NVDA", -0.4);
        assert_eq!(decision.reason(), "displaced(NVDA)");
    }
}
