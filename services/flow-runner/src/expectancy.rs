//! Expected value of a candidate's component mix, from realized outcomes

use std::collections::BTreeMap;

use crate::types::{CompositeScore, SignalComponent, TradeOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RunningStat {
    count: u64,
    sum_pnl_pct: f64,
}

/// EV estimate for one candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpectancyEstimate {
    /// Sample-weighted mean pnl % of the contributing components; `None`
    /// when none of them has history
    pub ev_pct: Option<f64>,
    pub samples: u64,
}

/// Per-component realized pnl, attributed to each trade's top contributors
#[derive(Debug, Clone, Default)]
pub struct ExpectancyModel {
    stats: BTreeMap<SignalComponent, RunningStat>,
    total_samples: u64,
    top_n: usize,
}

impl ExpectancyModel {
    pub fn new(top_n: usize) -> Self {
        Self {
            stats: BTreeMap::new(),
            total_samples: 0,
            top_n: top_n.max(1),
        }
    }

    pub fn from_outcomes(outcomes: &[TradeOutcome], top_n: usize) -> Self {
        let mut model = Self::new(top_n);
        for outcome in outcomes {
            model.record(outcome);
        }
        model
    }

    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    pub fn record(&mut self, outcome: &TradeOutcome) {
        if !outcome.pnl_pct.is_finite() {
            return;
        }
        let mut contributors: Vec<(SignalComponent, f64)> = outcome
            .component_breakdown_at_entry
            .iter()
            .filter(|(_, v)| v.is_finite() && **v > 0.0)
            .map(|(c, v)| (*c, *v))
            .collect();
        contributors.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        for (component, _) in contributors.into_iter().take(self.top_n) {
            let stat = self.stats.entry(component).or_default();
            stat.count += 1;
            stat.sum_pnl_pct += outcome.pnl_pct;
        }
        self.total_samples += 1;
    }

    pub fn estimate(&self, score: &CompositeScore) -> ExpectancyEstimate {
        let mut count = 0u64;
        let mut sum = 0.0;
        for component in score.top_components(self.top_n) {
            if let Some(stat) = self.stats.get(&component) {
                count += stat.count;
                sum += stat.sum_pnl_pct;
            }
        }
        ExpectancyEstimate {
            ev_pct: (count > 0).then(|| sum / count as f64),
            samples: count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Regime, Side};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn outcome(pnl_pct: f64, breakdown: &[(SignalComponent, f64)]) -> TradeOutcome {
        TradeOutcome {
            symbol: "SPY".to_string(),
            side: Side::Long,
            pnl_pct,
            pnl_usd: Decimal::ZERO,
            hold_duration_secs: 60,
            close_reason: "time_exit(3h)".to_string(),
            regime_at_entry: Regime::Neutral,
            component_breakdown_at_entry: breakdown.iter().copied().collect(),
            entry_score: 2.0,
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn test_sample_weighted_estimate() {
        let model = ExpectancyModel::from_outcomes(
            &[
                outcome(2.0, &[(SignalComponent::OptionsFlow, 1.0)]),
                outcome(-1.0, &[(SignalComponent::OptionsFlow, 1.0)]),
                outcome(4.0, &[(SignalComponent::DarkPool, 1.0)]),
            ],
            3,
        );

        let mut score = CompositeScore::zero("SPY", Direction::Bullish, Regime::Neutral);
        score.component_breakdown.insert(SignalComponent::OptionsFlow, 1.2);
        score.component_breakdown.insert(SignalComponent::DarkPool, 0.5);

        let est = model.estimate(&score);
        assert_eq!(est.samples, 3);
        assert!((est.ev_pct.unwrap() - 5.0 / 3.0).abs() < 1e-12);
        assert_eq!(model.total_samples(), 3);
    }

    #[test]
    fn test_unknown_mix_has_no_estimate() {
        let model = ExpectancyModel::from_outcomes(
            &[outcome(1.0, &[(SignalComponent::Insider, 1.0)])],
            3,
        );
        let mut score = CompositeScore::zero("SPY", Direction::Bullish, Regime::Neutral);
        score.component_breakdown.insert(SignalComponent::Congress, 0.3);

        assert_eq!(model.estimate(&score).ev_pct, None);
    }

    #[test]
    fn test_only_top_contributors_attributed() {
        let model = ExpectancyModel::from_outcomes(
            &[outcome(
                3.0,
                &[
                    (SignalComponent::OptionsFlow, 1.5),
                    (SignalComponent::DarkPool, 1.0),
                    (SignalComponent::Sentiment, 0.1),
                ],
            )],
            2,
        );
        let mut score = CompositeScore::zero("SPY", Direction::Bullish, Regime::Neutral);
        score.component_breakdown.insert(SignalComponent::Sentiment, 0.9);

        assert_eq!(model.estimate(&score).samples, 0);
    }
}
