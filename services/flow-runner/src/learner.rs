//! Adaptive weight learning
//!
//! Each component carries a base weight (from config), a global multiplier
//! and one multiplier per regime. Realized outcomes update Beta(win, loss)
//! accumulators; once a component has enough samples its multiplier drifts
//! toward twice the posterior win rate, a bounded step at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::LearnerConfig;
use crate::types::{Regime, SignalComponent, TradeOutcome};

/// Beta-distribution accumulator over wins and losses
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaStats {
    pub alpha: f64,
    pub beta: f64,
    pub samples: u32,
}

impl BetaStats {
    pub fn prior(strength: f64) -> Self {
        let strength = if strength.is_finite() && strength > 0.0 {
            strength
        } else {
            1.0
        };
        Self {
            alpha: strength,
            beta: strength,
            samples: 0,
        }
    }

    pub fn mean(&self) -> f64 {
        let total = self.alpha + self.beta;
        if total <= 0.0 {
            0.5
        } else {
            self.alpha / total
        }
    }

    pub fn record(&mut self, win: bool) {
        if win {
            self.alpha += 1.0;
        } else {
            self.beta += 1.0;
        }
        self.samples = self.samples.saturating_add(1);
    }
}

impl Default for BetaStats {
    fn default() -> Self {
        Self::prior(1.0)
    }
}

/// Learned state for one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentWeights {
    pub base_weight: f64,
    pub global_multiplier: f64,
    #[serde(default)]
    pub regime_multiplier: BTreeMap<Regime, f64>,
    pub global_stats: BetaStats,
    #[serde(default)]
    pub regime_stats: BTreeMap<Regime, BetaStats>,
}

impl ComponentWeights {
    pub fn neutral(base_weight: f64, prior_strength: f64) -> Self {
        Self {
            base_weight,
            global_multiplier: 1.0,
            regime_multiplier: BTreeMap::new(),
            global_stats: BetaStats::prior(prior_strength),
            regime_stats: BTreeMap::new(),
        }
    }

    pub fn regime_multiplier(&self, regime: Regime) -> f64 {
        self.regime_multiplier.get(&regime).copied().unwrap_or(1.0)
    }
}

/// Weight model persisted to `weights.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightModel {
    #[serde(default)]
    pub components: BTreeMap<SignalComponent, ComponentWeights>,
    #[serde(default)]
    pub outcomes_processed: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WeightModel {
    /// Every component at multiplier 1.0 with fresh accumulators
    pub fn neutral(base_weights: &BTreeMap<SignalComponent, f64>, prior_strength: f64) -> Self {
        let components = SignalComponent::ALL
            .iter()
            .map(|c| {
                let base = base_weights.get(c).copied().unwrap_or(0.0);
                (*c, ComponentWeights::neutral(base, prior_strength))
            })
            .collect();
        Self {
            components,
            outcomes_processed: 0,
            updated_at: None,
        }
    }

    /// Adopt configured base weights, adding any component the model lacks
    pub fn sync_base_weights(
        &mut self,
        base_weights: &BTreeMap<SignalComponent, f64>,
        prior_strength: f64,
    ) {
        for component in SignalComponent::ALL {
            let base = base_weights.get(&component).copied().unwrap_or(0.0);
            self.components
                .entry(component)
                .and_modify(|w| w.base_weight = base)
                .or_insert_with(|| ComponentWeights::neutral(base, prior_strength));
        }
    }

    /// `base × global × regime`; unknown components weigh nothing
    pub fn effective_weight(&self, component: SignalComponent, regime: Regime) -> f64 {
        match self.components.get(&component) {
            Some(w) => w.base_weight * w.global_multiplier * w.regime_multiplier(regime),
            None => 0.0,
        }
    }

    pub fn global_multiplier(&self, component: SignalComponent) -> f64 {
        self.components
            .get(&component)
            .map(|w| w.global_multiplier)
            .unwrap_or(1.0)
    }

    pub fn regime_multiplier(&self, component: SignalComponent, regime: Regime) -> f64 {
        self.components
            .get(&component)
            .map(|w| w.regime_multiplier(regime))
            .unwrap_or(1.0)
    }

    /// Every stored multiplier, global and per regime
    pub fn multipliers(&self) -> Vec<f64> {
        self.components
            .values()
            .flat_map(|w| {
                std::iter::once(w.global_multiplier).chain(w.regime_multiplier.values().copied())
            })
            .collect()
    }
}

/// Updates a [`WeightModel`] from realized trade outcomes
pub struct AdaptiveWeightLearner {
    config: LearnerConfig,
    model: WeightModel,
}

impl AdaptiveWeightLearner {
    pub fn new(config: LearnerConfig, model: WeightModel) -> Self {
        Self { config, model }
    }

    pub fn model(&self) -> &WeightModel {
        &self.model
    }

    pub fn into_model(self) -> WeightModel {
        self.model
    }

    pub fn set_model(&mut self, model: WeightModel) {
        self.model = model;
    }

    pub fn get_effective_weight(&self, component: SignalComponent, regime: Regime) -> f64 {
        self.model.effective_weight(component, regime)
    }

    pub fn record_outcome(&mut self, outcome: &TradeOutcome) -> usize {
        apply_outcome(&self.config, &mut self.model, outcome)
    }

    /// Multipliers back to 1.0, accumulators back to the prior; idempotent
    pub fn reset_to_neutral(&mut self) {
        let base: BTreeMap<SignalComponent, f64> = self
            .model
            .components
            .iter()
            .map(|(c, w)| (*c, w.base_weight))
            .collect();
        self.model = WeightModel::neutral(&base, self.config.prior_strength);
    }

    /// Rebuild a model from scratch by replaying outcomes in order
    pub fn replay(
        config: &LearnerConfig,
        base_weights: &BTreeMap<SignalComponent, f64>,
        outcomes: &[TradeOutcome],
    ) -> WeightModel {
        let mut model = WeightModel::neutral(base_weights, config.prior_strength);
        for outcome in outcomes {
            apply_outcome(config, &mut model, outcome);
        }
        model
    }
}

/// Apply one outcome to `model`; returns the number of components updated.
/// Only components that contributed positively at entry are credited.
pub fn apply_outcome(
    config: &LearnerConfig,
    model: &mut WeightModel,
    outcome: &TradeOutcome,
) -> usize {
    if !outcome.pnl_pct.is_finite() {
        return 0;
    }
    let win = outcome.is_win();
    let regime = outcome.regime_at_entry;
    let mut updated = 0;

    for (component, contribution) in &outcome.component_breakdown_at_entry {
        if !contribution.is_finite() || *contribution <= 0.0 {
            continue;
        }
        let Some(weights) = model.components.get_mut(component) else {
            continue;
        };

        weights.global_stats.record(win);
        weights.global_multiplier =
            step_toward(config, weights.global_multiplier, &weights.global_stats);

        let stats = weights
            .regime_stats
            .entry(regime)
            .or_insert_with(|| BetaStats::prior(config.prior_strength));
        stats.record(win);
        let stats = *stats;
        let current = weights.regime_multiplier(regime);
        weights
            .regime_multiplier
            .insert(regime, step_toward(config, current, &stats));

        updated += 1;
    }

    model.outcomes_processed += 1;
    model.updated_at = Some(outcome.closed_at);
    debug!(
        "Learner: {} {} pnl {:.2}% updated {} component(s)",
        outcome.symbol,
        if win { "win" } else { "loss" },
        outcome.pnl_pct,
        updated
    );
    updated
}

fn step_toward(config: &LearnerConfig, current: f64, stats: &BetaStats) -> f64 {
    let lo = config.multiplier_min;
    let hi = config.multiplier_max;
    let current = if current.is_finite() { current } else { 1.0 };

    if stats.samples < config.min_samples {
        return current.clamp(lo, hi);
    }

    let target = (2.0 * stats.mean()).clamp(lo, hi);
    let delta = ((target - current) * config.smoothing).clamp(-config.max_step, config.max_step);
    (current + delta).clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_base_weights;
    use crate::types::Side;
    use rand::{Rng, SeedableRng};
    use rust_decimal::Decimal;

    fn outcome(pnl_pct: f64, regime: Regime, breakdown: &[(SignalComponent, f64)]) -> TradeOutcome {
        TradeOutcome {
            symbol: "AAPL".to_string(),
            side: Side::Long,
            pnl_pct,
            pnl_usd: Decimal::ZERO,
            hold_duration_secs: 600,
            close_reason: "profit_target(+8.0%)".to_string(),
            regime_at_entry: regime,
            component_breakdown_at_entry: breakdown.iter().copied().collect(),
            entry_score: 3.0,
            closed_at: Utc::now(),
        }
    }

    fn learner(min_samples: u32) -> AdaptiveWeightLearner {
        let config = LearnerConfig {
            min_samples,
            ..LearnerConfig::default()
        };
        let model = WeightModel::neutral(&default_base_weights(), config.prior_strength);
        AdaptiveWeightLearner::new(config, model)
    }

    #[test]
    fn test_no_movement_before_min_samples() {
        let mut learner = learner(5);
        for _ in 0..4 {
            learner.record_outcome(&outcome(
                2.0,
                Regime::RiskOn,
                &[(SignalComponent::OptionsFlow, 1.0)],
            ));
        }
        assert_eq!(learner.model().global_multiplier(SignalComponent::OptionsFlow), 1.0);
        assert_eq!(
            learner
                .model()
                .regime_multiplier(SignalComponent::OptionsFlow, Regime::RiskOn),
            1.0
        );
    }

    #[test]
    fn test_wins_raise_multiplier_gradually() {
        let mut learner = learner(3);
        for _ in 0..3 {
            learner.record_outcome(&outcome(
                1.5,
                Regime::Neutral,
                &[(SignalComponent::DarkPool, 0.8)],
            ));
        }
        let m = learner.model().global_multiplier(SignalComponent::DarkPool);
        assert!(m > 1.0);
        assert!(m <= 1.0 + LearnerConfig::default().max_step + 1e-12);
    }

    #[test]
    fn test_only_positive_contributors_credited() {
        let mut learner = learner(1);
        let updated = learner.record_outcome(&outcome(
            -1.0,
            Regime::RiskOff,
            &[
                (SignalComponent::OptionsFlow, 0.9),
                (SignalComponent::IvSkew, -0.4),
                (SignalComponent::Sentiment, 0.0),
            ],
        ));
        assert_eq!(updated, 1);
        let skew = &learner.model().components[&SignalComponent::IvSkew];
        assert_eq!(skew.global_stats.samples, 0);
        assert!(learner.model().global_multiplier(SignalComponent::OptionsFlow) < 1.0);
    }

    #[test]
    fn test_multipliers_stay_bounded_under_arbitrary_outcomes() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut learner = learner(1);
        let config = LearnerConfig::default();

        for _ in 0..5_000 {
            let regime = Regime::ALL[rng.gen_range(0..Regime::ALL.len())];
            let component = SignalComponent::ALL[rng.gen_range(0..SignalComponent::ALL.len())];
            let pnl = if rng.gen_bool(0.9) { 3.0 } else { -3.0 };
            learner.record_outcome(&outcome(pnl, regime, &[(component, 1.0)]));
        }
        for _ in 0..5_000 {
            learner.record_outcome(&outcome(
                -2.0,
                Regime::Panic,
                &[(SignalComponent::Congress, 1.0)],
            ));
        }

        for m in learner.model().multipliers() {
            assert!(m >= config.multiplier_min && m <= config.multiplier_max, "{}", m);
        }
        assert!(
            (learner
                .model()
                .regime_multiplier(SignalComponent::Congress, Regime::Panic)
                - config.multiplier_min)
                .abs()
                < 1e-9
        );
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut learner = learner(1);
        for _ in 0..20 {
            learner.record_outcome(&outcome(
                4.0,
                Regime::RiskOn,
                &[(SignalComponent::Insider, 1.0)],
            ));
        }
        learner.reset_to_neutral();
        let once = learner.model().clone();
        learner.reset_to_neutral();

        assert_eq!(learner.model(), &once);
        assert!(once.multipliers().iter().all(|m| *m == 1.0));
        assert_eq!(
            once.effective_weight(SignalComponent::Insider, Regime::RiskOn),
            default_base_weights()[&SignalComponent::Insider]
        );
    }

    #[test]
    fn test_replay_matches_live_updates() {
        let outcomes: Vec<_> = (0..30)
            .map(|i| {
                outcome(
                    if i % 3 == 0 { -1.0 } else { 2.0 },
                    Regime::Neutral,
                    &[(SignalComponent::GammaExposure, 0.5)],
                )
            })
            .collect();

        let mut live = learner(5);
        for o in &outcomes {
            live.record_outcome(o);
        }
        let config = LearnerConfig {
            min_samples: 5,
            ..LearnerConfig::default()
        };
        let rebuilt = AdaptiveWeightLearner::replay(&config, &default_base_weights(), &outcomes);

        assert_eq!(rebuilt.components, live.model().components);
        assert_eq!(rebuilt.outcomes_processed, 30);
    }

    #[test]
    fn test_sync_base_weights_adds_missing_components() {
        let mut model = WeightModel::default();
        model.sync_base_weights(&default_base_weights(), 2.0);
        assert_eq!(model.components.len(), SignalComponent::ALL.len());
        assert_eq!(model.global_multiplier(SignalComponent::EtfFlow), 1.0);
    }
}
