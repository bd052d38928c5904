//! Core types shared by the scoring, gating, execution and learning stages
//!
//! These types define the contract between the signal cache, the decision
//! pipeline and the persisted state files.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Closed set of signal components fed by the market-signal provider.
///
/// Values are normalized and signed: positive leans bullish, negative bearish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalComponent {
    OptionsFlow,
    DarkPool,
    PremiumFlow,
    SweepActivity,
    Insider,
    Institutional,
    Congress,
    Sentiment,
    IvRank,
    IvSkew,
    VolTermStructure,
    PutCallRatio,
    GammaExposure,
    DeltaFlow,
    OpenInterestChange,
    ShortInterest,
    MarketTide,
    EtfFlow,
    EarningsProximity,
    SqueezePressure,
}

impl SignalComponent {
    pub const ALL: [SignalComponent; 20] = [
        SignalComponent::OptionsFlow,
        SignalComponent::DarkPool,
        SignalComponent::PremiumFlow,
        SignalComponent::SweepActivity,
        SignalComponent::Insider,
        SignalComponent::Institutional,
        SignalComponent::Congress,
        SignalComponent::Sentiment,
        SignalComponent::IvRank,
        SignalComponent::IvSkew,
        SignalComponent::VolTermStructure,
        SignalComponent::PutCallRatio,
        SignalComponent::GammaExposure,
        SignalComponent::DeltaFlow,
        SignalComponent::OpenInterestChange,
        SignalComponent::ShortInterest,
        SignalComponent::MarketTide,
        SignalComponent::EtfFlow,
        SignalComponent::EarningsProximity,
        SignalComponent::SqueezePressure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalComponent::OptionsFlow => "options_flow",
            SignalComponent::DarkPool => "dark_pool",
            SignalComponent::PremiumFlow => "premium_flow",
            SignalComponent::SweepActivity => "sweep_activity",
            SignalComponent::Insider => "insider",
            SignalComponent::Institutional => "institutional",
            SignalComponent::Congress => "congress",
            SignalComponent::Sentiment => "sentiment",
            SignalComponent::IvRank => "iv_rank",
            SignalComponent::IvSkew => "iv_skew",
            SignalComponent::VolTermStructure => "vol_term_structure",
            SignalComponent::PutCallRatio => "put_call_ratio",
            SignalComponent::GammaExposure => "gamma_exposure",
            SignalComponent::DeltaFlow => "delta_flow",
            SignalComponent::OpenInterestChange => "open_interest_change",
            SignalComponent::ShortInterest => "short_interest",
            SignalComponent::MarketTide => "market_tide",
            SignalComponent::EtfFlow => "etf_flow",
            SignalComponent::EarningsProximity => "earnings_proximity",
            SignalComponent::SqueezePressure => "squeeze_pressure",
        }
    }
}

impl fmt::Display for SignalComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalComponent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        SignalComponent::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == needle)
            .ok_or_else(|| format!("unknown signal component: {}", s))
    }
}

/// Categorical high-conviction flags attached to a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalFlag {
    WhaleSweep,
    GoldenSweep,
    BlockTrade,
    InsiderCluster,
}

impl FromStr for SignalFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whale_sweep" => Ok(SignalFlag::WhaleSweep),
            "golden_sweep" => Ok(SignalFlag::GoldenSweep),
            "block_trade" => Ok(SignalFlag::BlockTrade),
            "insider_cluster" => Ok(SignalFlag::InsiderCluster),
            other => Err(format!("unknown signal flag: {}", other)),
        }
    }
}

/// Coarse market state
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    RiskOn,
    Neutral,
    RiskOff,
    Panic,
    /// Fallback when classification is not possible
    #[default]
    Mixed,
}

impl Regime {
    pub const ALL: [Regime; 5] = [
        Regime::RiskOn,
        Regime::Neutral,
        Regime::RiskOff,
        Regime::Panic,
        Regime::Mixed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::RiskOn => "risk_on",
            Regime::Neutral => "neutral",
            Regime::RiskOff => "risk_off",
            Regime::Panic => "panic",
            Regime::Mixed => "mixed",
        }
    }

    /// Risk-off and panic regimes
    pub fn is_elevated(&self) -> bool {
        matches!(self, Regime::RiskOff | Regime::Panic)
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    /// +1.0 for bullish, -1.0 for bearish
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Bullish => 1.0,
            Direction::Bearish => -1.0,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            Direction::Bullish => Side::Long,
            Direction::Bearish => Side::Short,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Bullish => write!(f, "bullish"),
            Direction::Bearish => write!(f, "bearish"),
        }
    }
}

/// Position side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn direction(&self) -> Direction {
        match self {
            Side::Long => Direction::Bullish,
            Side::Short => Direction::Bearish,
        }
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Per-symbol snapshot of provider data, as read from the signal cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub symbol: String,
    #[serde(default)]
    pub components: BTreeMap<SignalComponent, f64>,
    #[serde(default)]
    pub flags: BTreeSet<SignalFlag>,
    #[serde(default)]
    pub theme: Option<String>,
    /// Last traded price reported by the provider
    #[serde(default)]
    pub last_price: Option<f64>,
    /// Short-horizon price change reported by the provider, in percent
    #[serde(default)]
    pub price_change_pct: Option<f64>,
    pub as_of: DateTime<Utc>,
}

impl SignalSnapshot {
    pub fn new(symbol: impl Into<String>, as_of: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            components: BTreeMap::new(),
            flags: BTreeSet::new(),
            theme: None,
            last_price: None,
            price_change_pct: None,
            as_of,
        }
    }

    pub fn with_component(mut self, component: SignalComponent, value: f64) -> Self {
        self.components.insert(component, value);
        self
    }

    pub fn with_flag(mut self, flag: SignalFlag) -> Self {
        self.flags.insert(flag);
        self
    }

    pub fn with_theme(mut self, theme: impl Into<String>) -> Self {
        self.theme = Some(theme.into());
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.last_price = Some(price);
        self
    }

    /// Component value; absent or non-finite entries read as 0.0
    pub fn value(&self, component: SignalComponent) -> f64 {
        self.components
            .get(&component)
            .copied()
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
    }

    pub fn has_flag(&self, flag: SignalFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.as_of).num_seconds().max(0)
    }
}

/// Fused conviction score for one symbol and direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub symbol: String,
    pub direction: Direction,
    pub raw_score: f64,
    pub component_breakdown: BTreeMap<SignalComponent, f64>,
    pub regime: Regime,
    pub freshness_factor: f64,
    pub whale_boost: f64,
    pub toxicity_penalty: f64,
    pub final_score: f64,
}

impl CompositeScore {
    /// Score for a symbol with no cached data
    pub fn zero(symbol: impl Into<String>, direction: Direction, regime: Regime) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            raw_score: 0.0,
            component_breakdown: BTreeMap::new(),
            regime,
            freshness_factor: 1.0,
            whale_boost: 0.0,
            toxicity_penalty: 0.0,
            final_score: 0.0,
        }
    }

    /// Components with a positive contribution, strongest first
    pub fn top_components(&self, n: usize) -> Vec<SignalComponent> {
        let mut positive: Vec<(SignalComponent, f64)> = self
            .component_breakdown
            .iter()
            .filter(|(_, v)| **v > 0.0)
            .map(|(c, v)| (*c, *v))
            .collect();
        positive.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        positive.into_iter().take(n).map(|(c, _)| c).collect()
    }
}

/// A symbol/direction pair pending gate evaluation within one cycle
#[derive(Debug, Clone)]
pub struct Candidate {
    pub score: CompositeScore,
    pub theme: Option<String>,
    /// Provider-reported short-horizon move, used when no tracked history exists
    pub price_change_pct: Option<f64>,
    /// Notional the entry would add if admitted
    pub proposed_notional: Decimal,
}

impl Candidate {
    pub fn new(score: CompositeScore) -> Self {
        Self {
            score,
            theme: None,
            price_change_pct: None,
            proposed_notional: Decimal::ZERO,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.score.symbol
    }

    pub fn direction(&self) -> Direction {
        self.score.direction
    }
}

/// Entry context carried with a position for learning attribution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionMetadata {
    #[serde(default)]
    pub regime_at_entry: Regime,
    #[serde(default)]
    pub component_breakdown: BTreeMap<SignalComponent, f64>,
    /// Best price seen since entry (highest for longs, lowest for shorts)
    #[serde(default)]
    pub high_water_price: Option<Decimal>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    /// True when the position was adopted from the broker without entry context
    #[serde(default)]
    pub unknown_entry_context: bool,
}

/// An open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub entry_score: f64,
    pub entry_time: DateTime<Utc>,
    #[serde(default)]
    pub metadata: PositionMetadata,
}

impl Position {
    pub fn direction(&self) -> Direction {
        self.side.direction()
    }

    pub fn notional(&self, price: Decimal) -> Decimal {
        self.qty * price
    }

    /// Long positions count positive, shorts negative
    pub fn signed_notional(&self, price: Decimal) -> Decimal {
        self.qty * price * self.side.sign()
    }

    pub fn pnl_usd(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.qty * self.side.sign()
    }

    /// Side-adjusted return in percent
    pub fn pnl_pct(&self, price: Decimal) -> f64 {
        if self.entry_price <= Decimal::ZERO {
            return 0.0;
        }
        let change = (price - self.entry_price) / self.entry_price * Decimal::from(100);
        to_f64(change * self.side.sign())
    }

    pub fn held_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_minutes().max(0)
    }
}

/// Result of one gate evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub gate_name: String,
    pub passed: bool,
    pub reason: String,
}

impl GateDecision {
    pub fn pass(gate_name: &str, reason: impl Into<String>) -> Self {
        Self {
            gate_name: gate_name.to_string(),
            passed: true,
            reason: reason.into(),
        }
    }

    pub fn fail(gate_name: &str, reason: impl Into<String>) -> Self {
        Self {
            gate_name: gate_name.to_string(),
            passed: false,
            reason: reason.into(),
        }
    }
}

/// One closed trade; the sole input to the weight learner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub symbol: String,
    pub side: Side,
    pub pnl_pct: f64,
    pub pnl_usd: Decimal,
    pub hold_duration_secs: i64,
    pub close_reason: String,
    pub regime_at_entry: Regime,
    pub component_breakdown_at_entry: BTreeMap<SignalComponent, f64>,
    #[serde(default)]
    pub entry_score: f64,
    pub closed_at: DateTime<Utc>,
}

impl TradeOutcome {
    pub fn is_win(&self) -> bool {
        self.pnl_pct > 0.0
    }
}

pub(crate) fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

pub(crate) fn from_f64(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_absent_components_read_as_zero() {
        let snap = SignalSnapshot::new("AAPL", Utc::now())
            .with_component(SignalComponent::OptionsFlow, 0.8)
            .with_component(SignalComponent::DarkPool, f64::NAN);

        assert_eq!(snap.value(SignalComponent::OptionsFlow), 0.8);
        assert_eq!(snap.value(SignalComponent::DarkPool), 0.0);
        assert_eq!(snap.value(SignalComponent::Insider), 0.0);
    }

    #[test]
    fn test_component_names_round_trip() {
        for component in SignalComponent::ALL {
            let parsed: SignalComponent = component.as_str().parse().unwrap();
            assert_eq!(parsed, component);
        }
        assert!("not_a_component".parse::<SignalComponent>().is_err());
    }

    #[test]
    fn test_short_position_pnl() {
        let pos = Position {
            symbol: "TSLA".to_string(),
            side: Side::Short,
            qty: Decimal::from(10),
            entry_price: Decimal::from(200),
            entry_score: 3.0,
            entry_time: Utc::now() - Duration::minutes(30),
            metadata: PositionMetadata::default(),
        };

        assert_eq!(pos.pnl_usd(Decimal::from(190)), Decimal::from(100));
        assert!((pos.pnl_pct(Decimal::from(190)) - 5.0).abs() < 1e-9);
        assert_eq!(pos.signed_notional(Decimal::from(190)), Decimal::from(-1900));
    }

    #[test]
    fn test_top_components_ignores_negative() {
        let mut score = CompositeScore::zero("NVDA", Direction::Bullish, Regime::Neutral);
        score.component_breakdown.insert(SignalComponent::OptionsFlow, 1.2);
        score.component_breakdown.insert(SignalComponent::DarkPool, 0.4);
        score.component_breakdown.insert(SignalComponent::IvSkew, -0.3);

        assert_eq!(
            score.top_components(5),
            vec![SignalComponent::OptionsFlow, SignalComponent::DarkPool]
        );
    }
}
