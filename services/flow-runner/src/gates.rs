//! Risk gate chain
//!
//! Candidates pass through a fixed, ordered list of gates. Evaluation stops
//! at the first veto; every evaluated gate leaves a [`GateDecision`].

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::config::GateConfig;
use crate::expectancy::ExpectancyModel;
use crate::market::PriceHistory;
use crate::portfolio::{Portfolio, ThemeBook};
use crate::types::{to_f64, Candidate, Direction, GateDecision, Regime};

pub const SCORE_FLOOR: &str = "score_floor";
pub const EXPECTANCY: &str = "expectancy";
pub const CAPACITY: &str = "capacity";
pub const COOLDOWN: &str = "cooldown";
pub const CONCENTRATION: &str = "concentration";
pub const THEME_EXPOSURE: &str = "theme_exposure";
pub const MOMENTUM: &str = "momentum";

/// Recent rejections and exits per symbol
#[derive(Debug, Clone, Default)]
pub struct CooldownBook {
    rejections: HashMap<String, DateTime<Utc>>,
    exits: HashMap<String, DateTime<Utc>>,
}

impl CooldownBook {
    pub fn record_rejection(&mut self, symbol: &str, at: DateTime<Utc>) {
        self.rejections.insert(symbol.to_string(), at);
    }

    pub fn record_exit(&mut self, symbol: &str, at: DateTime<Utc>) {
        self.exits.insert(symbol.to_string(), at);
    }

    /// Reason the symbol is cooling down, if it is
    pub fn blocked(&self, symbol: &str, now: DateTime<Utc>, config: &GateConfig) -> Option<String> {
        if let Some(at) = self.exits.get(symbol) {
            let remaining = Duration::seconds(config.reentry_cooldown_secs) - (now - *at);
            if remaining > Duration::zero() {
                return Some(format!("re-entry cooldown ({}s left)", remaining.num_seconds()));
            }
        }
        if let Some(at) = self.rejections.get(symbol) {
            let remaining = Duration::seconds(config.rejection_cooldown_secs) - (now - *at);
            if remaining > Duration::zero() {
                return Some(format!(
                    "rejection cooldown ({}s left)",
                    remaining.num_seconds()
                ));
            }
        }
        None
    }

    pub fn prune(&mut self, now: DateTime<Utc>, config: &GateConfig) {
        let reject = Duration::seconds(config.rejection_cooldown_secs);
        let reentry = Duration::seconds(config.reentry_cooldown_secs);
        self.rejections.retain(|_, at| now - *at < reject);
        self.exits.retain(|_, at| now - *at < reentry);
    }
}

/// Per-cycle inputs shared by every gate
pub struct GateContext<'a> {
    pub portfolio: &'a Portfolio,
    pub regime: Regime,
    pub now: DateTime<Utc>,
    pub expectancy: &'a ExpectancyModel,
    pub cooldowns: &'a CooldownBook,
    pub prices: &'a PriceHistory,
    pub themes: &'a ThemeBook,
    /// Symbols with an order intent in flight
    pub pending: &'a HashSet<String>,
    pub entries_this_cycle: usize,
    /// Score-floor bump from the loss-streak tracker
    pub healing_bump: f64,
}

pub trait Gate: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(reason)` to pass, `Err(reason)` to veto
    fn check(&self, candidate: &Candidate, ctx: &GateContext<'_>) -> Result<String, String>;
}

/// Every gate evaluated for a candidate, in order
#[derive(Debug, Clone)]
pub struct GateVerdict {
    pub decisions: Vec<GateDecision>,
}

impl GateVerdict {
    pub fn admitted(&self) -> bool {
        self.decisions.iter().all(|d| d.passed)
    }

    pub fn rejection(&self) -> Option<&GateDecision> {
        self.decisions.iter().find(|d| !d.passed)
    }

    pub fn rejected_by(&self, gate: &str) -> bool {
        self.rejection().is_some_and(|d| d.gate_name == gate)
    }
}

pub struct RiskGateChain {
    gates: Vec<Box<dyn Gate>>,
}

impl RiskGateChain {
    pub fn new(gates: Vec<Box<dyn Gate>>) -> Self {
        Self { gates }
    }

    /// score_floor → expectancy → capacity → cooldown → concentration →
    /// theme_exposure → momentum
    pub fn standard(config: &GateConfig) -> Self {
        Self::new(vec![
            Box::new(ScoreFloorGate::new(config.clone())),
            Box::new(ExpectancyGate::new(config.clone())),
            Box::new(CapacityGate::new(config.clone())),
            Box::new(CooldownGate::new(config.clone())),
            Box::new(ConcentrationGate::new(config.clone())),
            Box::new(ThemeExposureGate::new(config.clone())),
            Box::new(MomentumGate::new(config.clone())),
        ])
    }

    pub fn gate_names(&self) -> Vec<&'static str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    pub fn evaluate(&self, candidate: &Candidate, ctx: &GateContext<'_>) -> GateVerdict {
        let mut decisions = Vec::with_capacity(self.gates.len());
        for gate in &self.gates {
            match gate.check(candidate, ctx) {
                Ok(reason) => {
                    debug!("{} {} passed: {}", candidate.symbol(), gate.name(), reason);
                    decisions.push(GateDecision::pass(gate.name(), reason));
                }
                Err(reason) => {
                    info!(
                        "{} {} vetoed by {}: {}",
                        candidate.symbol(),
                        candidate.direction(),
                        gate.name(),
                        reason
                    );
                    decisions.push(GateDecision::fail(gate.name(), reason));
                    break;
                }
            }
        }
        GateVerdict { decisions }
    }
}

pub struct ScoreFloorGate {
    config: GateConfig,
}

impl ScoreFloorGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }
}

impl Gate for ScoreFloorGate {
    fn name(&self) -> &'static str {
        SCORE_FLOOR
    }

    fn check(&self, candidate: &Candidate, ctx: &GateContext<'_>) -> Result<String, String> {
        let threshold = self.config.score_floor(ctx.regime, candidate.symbol()) + ctx.healing_bump;
        let score = candidate.score.final_score;
        if score.is_finite() && score >= threshold {
            Ok(format!("score {:.2} >= {:.2} ({})", score, threshold, ctx.regime))
        } else {
            Err(format!("score {:.2} < {:.2} ({})", score, threshold, ctx.regime))
        }
    }
}

pub struct ExpectancyGate {
    config: GateConfig,
}

impl ExpectancyGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }
}

impl Gate for ExpectancyGate {
    fn name(&self) -> &'static str {
        EXPECTANCY
    }

    fn check(&self, candidate: &Candidate, ctx: &GateContext<'_>) -> Result<String, String> {
        let bootstrap = ctx.expectancy.total_samples() < self.config.bootstrap_samples;
        let floor = if bootstrap {
            self.config.bootstrap_ev_floor
        } else {
            self.config.ev_floor
        };
        let estimate = ctx.expectancy.estimate(&candidate.score);

        match estimate.ev_pct {
            None if bootstrap => Ok("no history for component mix (bootstrap)".to_string()),
            None => Err("no history for component mix".to_string()),
            Some(ev) if ev >= floor => Ok(format!(
                "ev {:.2}% >= {:.2}% over {} samples{}",
                ev,
                floor,
                estimate.samples,
                if bootstrap { " (bootstrap)" } else { "" }
            )),
            Some(ev) => Err(format!(
                "ev {:.2}% < {:.2}% over {} samples",
                ev, floor, estimate.samples
            )),
        }
    }
}

pub struct CapacityGate {
    config: GateConfig,
}

impl CapacityGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }
}

impl Gate for CapacityGate {
    fn name(&self) -> &'static str {
        CAPACITY
    }

    fn check(&self, _candidate: &Candidate, ctx: &GateContext<'_>) -> Result<String, String> {
        if ctx.entries_this_cycle >= self.config.max_new_entries_per_cycle {
            return Err(format!(
                "max_new_entries_per_cycle reached ({})",
                self.config.max_new_entries_per_cycle
            ));
        }
        let open = ctx.portfolio.open_count();
        if open >= self.config.max_open_positions {
            return Err(format!(
                "max_open_positions reached ({}/{})",
                open, self.config.max_open_positions
            ));
        }
        Ok(format!(
            "{}/{} open, {} entries this cycle",
            open, self.config.max_open_positions, ctx.entries_this_cycle
        ))
    }
}

pub struct CooldownGate {
    config: GateConfig,
}

impl CooldownGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }
}

impl Gate for CooldownGate {
    fn name(&self) -> &'static str {
        COOLDOWN
    }

    fn check(&self, candidate: &Candidate, ctx: &GateContext<'_>) -> Result<String, String> {
        let symbol = candidate.symbol();
        if ctx.portfolio.is_held(symbol) {
            return Err("already held".to_string());
        }
        if ctx.pending.contains(symbol) {
            return Err("order already in flight".to_string());
        }
        match ctx.cooldowns.blocked(symbol, ctx.now, &self.config) {
            Some(reason) => Err(reason),
            None => Ok("no cooldown".to_string()),
        }
    }
}

pub struct ConcentrationGate {
    config: GateConfig,
}

impl ConcentrationGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }
}

impl Gate for ConcentrationGate {
    fn name(&self) -> &'static str {
        CONCENTRATION
    }

    fn check(&self, candidate: &Candidate, ctx: &GateContext<'_>) -> Result<String, String> {
        let cap = self.config.max_net_exposure_pct;
        let Some(pct) = ctx
            .portfolio
            .net_exposure_pct_with(candidate.direction(), candidate.proposed_notional)
        else {
            return Err("equity unknown".to_string());
        };

        let within = match candidate.direction() {
            Direction::Bullish => pct <= cap,
            Direction::Bearish => pct >= -cap,
        };
        if within {
            Ok(format!("net exposure {:.1}% within ±{:.1}%", pct, cap))
        } else {
            Err(format!("net exposure {:.1}% beyond ±{:.1}%", pct, cap))
        }
    }
}

pub struct ThemeExposureGate {
    config: GateConfig,
}

impl ThemeExposureGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }
}

impl Gate for ThemeExposureGate {
    fn name(&self) -> &'static str {
        THEME_EXPOSURE
    }

    fn check(&self, candidate: &Candidate, ctx: &GateContext<'_>) -> Result<String, String> {
        let Some(theme) = ctx
            .themes
            .theme_for(candidate.symbol(), candidate.theme.as_deref())
        else {
            return Ok("no theme".to_string());
        };
        if ctx.portfolio.equity <= rust_decimal::Decimal::ZERO {
            return Err("equity unknown".to_string());
        }

        let notional = ctx.portfolio.theme_notional(&theme, ctx.themes) + candidate.proposed_notional;
        let pct = to_f64(notional / ctx.portfolio.equity * rust_decimal::Decimal::from(100));
        if pct <= self.config.max_theme_exposure_pct {
            Ok(format!(
                "{} exposure {:.1}% <= {:.1}%",
                theme, pct, self.config.max_theme_exposure_pct
            ))
        } else {
            Err(format!(
                "{} exposure {:.1}% > {:.1}%",
                theme, pct, self.config.max_theme_exposure_pct
            ))
        }
    }
}

pub struct MomentumGate {
    config: GateConfig,
}

impl MomentumGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }
}

impl Gate for MomentumGate {
    fn name(&self) -> &'static str {
        MOMENTUM
    }

    fn check(&self, candidate: &Candidate, ctx: &GateContext<'_>) -> Result<String, String> {
        let horizon = Duration::seconds(self.config.momentum_horizon_secs);
        let change = ctx
            .prices
            .change_pct(candidate.symbol(), horizon, ctx.now)
            .or(candidate.price_change_pct);

        let Some(change) = change.filter(|c| c.is_finite()) else {
            return Err("no momentum data".to_string());
        };
        let aligned = change * candidate.direction().sign();
        if aligned >= self.config.min_momentum_pct {
            Ok(format!(
                "momentum {:+.2}% confirms {}",
                change,
                candidate.direction()
            ))
        } else {
            Err(format!(
                "momentum {:+.2}% does not confirm {} (min {:.2}%)",
                change,
                candidate.direction(),
                self.config.min_momentum_pct
            ))
        }
    }
}
