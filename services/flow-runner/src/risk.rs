//! Capital-risk monitoring and score-threshold self-healing
//!
//! Daily loss and drawdown breaches freeze new entries until an operator
//! clears the freeze. Loss streaks raise the score floor temporarily.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::{GateConfig, RiskCaps};
use crate::types::to_f64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeRecord {
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Consecutive-loss tracking behind the score-floor bump
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealingState {
    pub consecutive_losses: u32,
    pub bumped_at: Option<DateTime<Utc>>,
}

impl HealingState {
    pub fn record_outcome(&mut self, win: bool, now: DateTime<Utc>, gates: &GateConfig) {
        if win {
            if self.bumped_at.is_some() {
                info!("Winning trade cleared score-floor bump");
            }
            self.consecutive_losses = 0;
            self.bumped_at = None;
            return;
        }
        self.consecutive_losses += 1;
        if self.consecutive_losses >= gates.healing_loss_streak && self.bumped_at.is_none() {
            info!(
                "{} consecutive losses, raising score floor by {}",
                self.consecutive_losses, gates.healing_bump
            );
            self.bumped_at = Some(now);
        }
    }

    /// Current floor bump; expires `healing_decay_hours` after it was applied
    pub fn bump(&self, now: DateTime<Utc>, gates: &GateConfig) -> f64 {
        match self.bumped_at {
            Some(at) if now - at < Duration::hours(gates.healing_decay_hours) => gates.healing_bump,
            _ => 0.0,
        }
    }

    /// Drop an expired bump so the next streak starts fresh
    pub fn expire(&mut self, now: DateTime<Utc>, gates: &GateConfig) {
        if let Some(at) = self.bumped_at {
            if now - at >= Duration::hours(gates.healing_decay_hours) {
                self.bumped_at = None;
                self.consecutive_losses = 0;
            }
        }
    }
}

/// Persisted capital-risk state (`risk_state.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    #[serde(default)]
    pub freeze: Option<FreezeRecord>,
    #[serde(default)]
    pub trading_day: Option<NaiveDate>,
    #[serde(default)]
    pub day_start_equity: Decimal,
    #[serde(default)]
    pub realized_pnl_today: Decimal,
    #[serde(default)]
    pub peak_equity: Decimal,
    #[serde(default)]
    pub healing: HealingState,
    /// Bumped by every operator reset that cleared a freeze
    #[serde(default)]
    pub freeze_resets: u32,
}

impl RiskState {
    pub fn is_frozen(&self) -> bool {
        self.freeze.is_some()
    }

    /// Start a new trading day at UTC midnight
    pub fn roll_day(&mut self, now: DateTime<Utc>, equity: Decimal) {
        let today = now.date_naive();
        if self.trading_day != Some(today) {
            if self.trading_day.is_some() {
                info!(
                    "New trading day {}: start equity {}, prior day realized {}",
                    today, equity, self.realized_pnl_today
                );
            }
            self.trading_day = Some(today);
            self.day_start_equity = equity;
            self.realized_pnl_today = Decimal::ZERO;
        }
    }

    pub fn record_realized(&mut self, pnl: Decimal) {
        self.realized_pnl_today += pnl;
    }

    /// Clear a freeze; returns the cleared record. Loss and drawdown are
    /// measured from the reset onward, the peak re-seeds on the next check.
    pub fn reset_freeze(&mut self) -> Option<FreezeRecord> {
        let cleared = self.freeze.take();
        if cleared.is_some() {
            self.realized_pnl_today = Decimal::ZERO;
            self.peak_equity = Decimal::ZERO;
            self.freeze_resets += 1;
        }
        cleared
    }

    /// Take over a reset recorded in `on_disk` that this copy has not seen.
    /// Returns true when one was adopted.
    pub fn adopt_operator_reset(&mut self, on_disk: &RiskState) -> bool {
        if on_disk.freeze_resets <= self.freeze_resets {
            return false;
        }
        self.freeze = on_disk.freeze.clone();
        self.freeze_resets = on_disk.freeze_resets;
        self.realized_pnl_today = on_disk.realized_pnl_today;
        self.peak_equity = on_disk.peak_equity;
        true
    }
}

pub struct RiskMonitor {
    caps: RiskCaps,
}

impl RiskMonitor {
    pub fn new(caps: RiskCaps) -> Self {
        Self { caps }
    }

    /// Check limits against current equity; returns the record if this call
    /// froze trading
    pub fn evaluate(
        &self,
        state: &mut RiskState,
        equity: Decimal,
        now: DateTime<Utc>,
    ) -> Option<FreezeRecord> {
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
        if state.is_frozen() {
            return None;
        }

        let reason = self.breach(state, equity)?;
        error!("Capital-risk limit breached, freezing entries: {}", reason);
        let record = FreezeRecord { reason, at: now };
        state.freeze = Some(record.clone());
        Some(record)
    }

    fn breach(&self, state: &RiskState, equity: Decimal) -> Option<String> {
        if state.day_start_equity > Decimal::ZERO {
            let loss_pct = to_f64(-state.realized_pnl_today / state.day_start_equity * Decimal::from(100));
            if loss_pct >= self.caps.max_daily_loss_pct {
                return Some(format!(
                    "daily_loss({:.2}% >= {:.2}%, realized {})",
                    loss_pct, self.caps.max_daily_loss_pct, state.realized_pnl_today
                ));
            }
        }
        if state.peak_equity > Decimal::ZERO {
            let drawdown_pct =
                to_f64((state.peak_equity - equity) / state.peak_equity * Decimal::from(100));
            if drawdown_pct >= self.caps.max_drawdown_pct {
                return Some(format!(
                    "drawdown({:.2}% >= {:.2}%, peak {})",
                    drawdown_pct, self.caps.max_drawdown_pct, state.peak_equity
                ));
            }
        }
        None
    }
}
