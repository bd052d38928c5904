//! Composite signal scoring
//!
//! Fuses a symbol's signal snapshot into one directional conviction score.
//! The result depends only on the snapshot, the weight model, the regime and
//! the cycle clock passed in [`ScoringContext`].

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::config::ScoringConfig;
use crate::learner::WeightModel;
use crate::types::{CompositeScore, Direction, Regime, SignalComponent, SignalFlag, SignalSnapshot};

/// Component pairs that contradict each other when they disagree strongly
pub const TOXIC_PAIRS: [(SignalComponent, SignalComponent); 3] = [
    (SignalComponent::OptionsFlow, SignalComponent::IvSkew),
    (SignalComponent::PremiumFlow, SignalComponent::PutCallRatio),
    (SignalComponent::DarkPool, SignalComponent::Institutional),
];

/// Everything a score depends on besides the snapshot
#[derive(Debug, Clone, Copy)]
pub struct ScoringContext<'a> {
    pub model: &'a WeightModel,
    pub regime: Regime,
    pub as_of: DateTime<Utc>,
}

pub struct CompositeScorer {
    config: ScoringConfig,
}

impl CompositeScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// 1.0 while fresh, linear decay to the floor at `stale_secs`
    pub fn freshness_factor(&self, snapshot: &SignalSnapshot, as_of: DateTime<Utc>) -> f64 {
        let age = snapshot.age_secs(as_of);
        let fresh = self.config.fresh_secs.max(0);
        let stale = self.config.stale_secs.max(fresh + 1);
        let floor = self.config.freshness_floor;

        if age <= fresh {
            return 1.0;
        }
        if age >= stale {
            return floor;
        }
        let progress = (age - fresh) as f64 / (stale - fresh) as f64;
        (1.0 - progress * (1.0 - floor)).max(floor)
    }

    /// Score one direction; a missing snapshot scores exactly zero
    pub fn score(
        &self,
        symbol: &str,
        snapshot: Option<&SignalSnapshot>,
        direction: Direction,
        ctx: &ScoringContext<'_>,
    ) -> CompositeScore {
        let Some(snapshot) = snapshot else {
            return CompositeScore::zero(symbol, direction, ctx.regime);
        };

        let sign = direction.sign();
        let mut breakdown = BTreeMap::new();
        let mut raw = 0.0;

        for (component, value) in &snapshot.components {
            if !value.is_finite() {
                continue;
            }
            let weight = ctx.model.effective_weight(*component, ctx.regime);
            if !weight.is_finite() {
                continue;
            }
            let contribution = sign * value * weight;
            breakdown.insert(*component, contribution);
            raw += contribution;
        }

        let freshness = self.freshness_factor(snapshot, ctx.as_of);
        let whale = self.whale_boost(snapshot, direction);
        let toxicity = self.toxicity_penalty(snapshot);

        CompositeScore {
            symbol: symbol.to_string(),
            direction,
            raw_score: raw,
            component_breakdown: breakdown,
            regime: ctx.regime,
            freshness_factor: freshness,
            whale_boost: whale,
            toxicity_penalty: toxicity,
            final_score: raw * freshness + whale - toxicity,
        }
    }

    /// Bullish and bearish scores, in that order
    pub fn score_symbol(
        &self,
        symbol: &str,
        snapshot: Option<&SignalSnapshot>,
        ctx: &ScoringContext<'_>,
    ) -> [CompositeScore; 2] {
        [
            self.score(symbol, snapshot, Direction::Bullish, ctx),
            self.score(symbol, snapshot, Direction::Bearish, ctx),
        ]
    }

    /// The higher-scoring direction; bullish wins ties
    pub fn best_direction(
        &self,
        symbol: &str,
        snapshot: Option<&SignalSnapshot>,
        ctx: &ScoringContext<'_>,
    ) -> CompositeScore {
        let [bull, bear] = self.score_symbol(symbol, snapshot, ctx);
        if bear.final_score > bull.final_score {
            bear
        } else {
            bull
        }
    }

    fn whale_boost(&self, snapshot: &SignalSnapshot, direction: Direction) -> f64 {
        let flagged =
            snapshot.has_flag(SignalFlag::WhaleSweep) || snapshot.has_flag(SignalFlag::GoldenSweep);
        let flow = direction.sign() * snapshot.value(SignalComponent::OptionsFlow);
        if flagged && flow >= 0.0 {
            self.config.whale_boost
        } else {
            0.0
        }
    }

    fn toxicity_penalty(&self, snapshot: &SignalSnapshot) -> f64 {
        let t = self.config.toxicity_threshold;
        let conflicts = TOXIC_PAIRS
            .iter()
            .filter(|(a, b)| {
                let (a, b) = (snapshot.value(*a), snapshot.value(*b));
                (a > t && b < -t) || (a < -t && b > t)
            })
            .count();
        (conflicts as f64 * self.config.toxicity_penalty).min(self.config.max_toxicity)
    }
}
