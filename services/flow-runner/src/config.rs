//! Runner Configuration
//!
//! Settings are layered: built-in defaults, then an optional config file, then
//! `FLOW__SECTION__KEY` environment overrides. Broker credentials are read
//! from the environment only.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::types::{Regime, SignalComponent};

/// Top-level runner settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Signal cache file written by the external poller; defaults to
    /// `<state_dir>/signal_cache.json`
    #[serde(default)]
    pub signal_cache_path: Option<PathBuf>,
    /// Trading universe; empty means every symbol in the signal cache
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Theme name -> member symbols
    #[serde(default)]
    pub themes: BTreeMap<String, Vec<String>>,
    #[serde(default, rename = "loop")]
    pub cycle: LoopConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub learner: LearnerConfig,
    #[serde(default)]
    pub gates: GateConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub exits: ExitConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub risk: RiskCaps,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::default(),
            state_dir: default_state_dir(),
            signal_cache_path: None,
            symbols: Vec::new(),
            themes: BTreeMap::new(),
            cycle: LoopConfig::default(),
            scoring: ScoringConfig::default(),
            regime: RegimeConfig::default(),
            learner: LearnerConfig::default(),
            gates: GateConfig::default(),
            execution: ExecutionConfig::default(),
            exits: ExitConfig::default(),
            reconcile: ReconcileConfig::default(),
            risk: RiskCaps::default(),
            rate_limit: RateLimitConfig::default(),
            watchdog: WatchdogConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from an optional file plus `FLOW__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FLOW")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .context("failed to read configuration sources")?
            .try_deserialize()
            .context("failed to parse configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the runner cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.cycle.interval_secs == 0 {
            return Err(anyhow!("loop.interval_secs must be positive"));
        }
        self.cycle.session_window()?;

        if self.learner.multiplier_min <= 0.0
            || self.learner.multiplier_min > 1.0
            || self.learner.multiplier_max < 1.0
        {
            return Err(anyhow!(
                "learner multiplier bounds must satisfy 0 < min <= 1 <= max (got {}..{})",
                self.learner.multiplier_min,
                self.learner.multiplier_max
            ));
        }
        if !(0.0..=1.0).contains(&self.learner.smoothing) {
            return Err(anyhow!("learner.smoothing must be within [0, 1]"));
        }

        if self.scoring.stale_secs <= self.scoring.fresh_secs {
            return Err(anyhow!("scoring.stale_secs must exceed scoring.fresh_secs"));
        }
        if !(0.0..=1.0).contains(&self.scoring.freshness_floor) {
            return Err(anyhow!("scoring.freshness_floor must be within [0, 1]"));
        }

        if self.rate_limit.capacity == 0 || self.rate_limit.refill_per_sec <= 0.0 {
            return Err(anyhow!("rate_limit capacity and refill_per_sec must be positive"));
        }
        if self.execution.max_attempts == 0 {
            return Err(anyhow!("execution.max_attempts must be at least 1"));
        }
        if self.reconcile.correct_after == 0 || self.reconcile.degraded_threshold == 0 {
            return Err(anyhow!("reconcile thresholds must be at least 1"));
        }
        if self.watchdog.max_restarts == 0 {
            return Err(anyhow!("watchdog.max_restarts must be at least 1"));
        }
        Ok(())
    }

    pub fn signal_cache_path(&self) -> PathBuf {
        self.signal_cache_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("signal_cache.json"))
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

/// Broker API credentials, taken from `BROKER_API_KEY` / `BROKER_API_SECRET`
#[derive(Clone)]
pub struct BrokerCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl BrokerCredentials {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("BROKER_API_KEY")
            .map_err(|_| anyhow!("BROKER_API_KEY environment variable required"))?;
        let api_secret = std::env::var("BROKER_API_SECRET")
            .map_err(|_| anyhow!("BROKER_API_SECRET environment variable required"))?;
        if api_key.trim().is_empty() || api_secret.trim().is_empty() {
            return Err(anyhow!("broker credentials must not be empty"));
        }
        Ok(Self {
            api_key,
            api_secret,
        })
    }
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("api_key", &"***")
            .field("api_secret", &"***")
            .finish()
    }
}

/// Decision loop cadence and market session
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub interval_secs: u64,
    /// Session open, `HH:MM` UTC
    pub session_start_utc: String,
    /// Session close, `HH:MM` UTC
    pub session_end_utc: String,
    pub trade_weekends: bool,
    /// Symbol whose price history drives regime classification
    pub benchmark_symbol: String,
    /// Consecutive failed cycles before the runner gives up
    pub max_consecutive_failures: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            session_start_utc: "13:30".to_string(),
            session_end_utc: "20:00".to_string(),
            trade_weekends: false,
            benchmark_symbol: "SPY".to_string(),
            max_consecutive_failures: 5,
        }
    }
}

impl LoopConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn session_window(&self) -> Result<(NaiveTime, NaiveTime)> {
        let start = NaiveTime::parse_from_str(&self.session_start_utc, "%H:%M")
            .with_context(|| format!("invalid session start '{}'", self.session_start_utc))?;
        let end = NaiveTime::parse_from_str(&self.session_end_utc, "%H:%M")
            .with_context(|| format!("invalid session end '{}'", self.session_end_utc))?;
        Ok((start, end))
    }

    /// Whether new entries may be opened at `now`
    pub fn in_session(&self, now: DateTime<Utc>) -> bool {
        if !self.trade_weekends && matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let Ok((start, end)) = self.session_window() else {
            return false;
        };
        let t = now.time();
        if start <= end {
            t >= start && t < end
        } else {
            // Window wraps midnight
            t >= start || t < end
        }
    }
}

/// Composite scorer parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    /// Component name -> base weight
    pub base_weights: BTreeMap<String, f64>,
    pub fresh_secs: i64,
    pub stale_secs: i64,
    pub freshness_floor: f64,
    pub whale_boost: f64,
    pub toxicity_threshold: f64,
    pub toxicity_penalty: f64,
    pub max_toxicity: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_weights: default_base_weights()
                .into_iter()
                .map(|(c, w)| (c.as_str().to_string(), w))
                .collect(),
            fresh_secs: 300,
            stale_secs: 1800,
            freshness_floor: 0.9,
            whale_boost: 0.5,
            toxicity_threshold: 0.3,
            toxicity_penalty: 0.25,
            max_toxicity: 0.75,
        }
    }
}

impl ScoringConfig {
    /// Resolve configured base weights; unknown names are skipped, missing
    /// components keep their built-in weight
    pub fn base_weight_map(&self) -> BTreeMap<SignalComponent, f64> {
        let mut weights = default_base_weights();
        for (name, weight) in &self.base_weights {
            match name.parse::<SignalComponent>() {
                Ok(component) if weight.is_finite() && *weight >= 0.0 => {
                    weights.insert(component, *weight);
                }
                Ok(component) => {
                    warn!("Ignoring invalid base weight {} for {}", weight, component);
                }
                Err(e) => warn!("Ignoring base weight: {}", e),
            }
        }
        weights
    }
}

pub fn default_base_weights() -> BTreeMap<SignalComponent, f64> {
    use SignalComponent::*;
    BTreeMap::from([
        (OptionsFlow, 1.5),
        (DarkPool, 1.2),
        (PremiumFlow, 1.0),
        (SweepActivity, 1.0),
        (Insider, 0.8),
        (Institutional, 0.8),
        (Congress, 0.4),
        (Sentiment, 0.5),
        (IvRank, 0.4),
        (IvSkew, 0.6),
        (VolTermStructure, 0.4),
        (PutCallRatio, 0.6),
        (GammaExposure, 0.7),
        (DeltaFlow, 0.6),
        (OpenInterestChange, 0.5),
        (ShortInterest, 0.4),
        (MarketTide, 0.6),
        (EtfFlow, 0.4),
        (EarningsProximity, 0.2),
        (SqueezePressure, 0.5),
    ])
}

/// Regime classifier thresholds
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RegimeConfig {
    pub lookback_bars: usize,
    pub min_bars: usize,
    pub risk_on_return_pct: f64,
    pub risk_off_return_pct: f64,
    pub panic_drawdown_pct: f64,
    /// Per-bar realized volatility (stdev of returns, percent) marking stress
    pub high_vol_bar_pct: f64,
    pub risk_on_max_vol_index: f64,
    pub risk_off_vol_index: f64,
    pub panic_vol_index: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            lookback_bars: 30,
            min_bars: 10,
            risk_on_return_pct: 0.5,
            risk_off_return_pct: -1.0,
            panic_drawdown_pct: 4.0,
            high_vol_bar_pct: 0.35,
            risk_on_max_vol_index: 18.0,
            risk_off_vol_index: 25.0,
            panic_vol_index: 35.0,
        }
    }
}

/// Adaptive weight learner parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LearnerConfig {
    /// Outcomes required before a multiplier may move
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    #[serde(default = "default_multiplier_min")]
    pub multiplier_min: f64,
    #[serde(default = "default_multiplier_max")]
    pub multiplier_max: f64,
    /// Largest change to a multiplier from a single outcome
    #[serde(default = "default_max_step")]
    pub max_step: f64,
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,
    /// Pseudo-count on each side of the Beta prior
    #[serde(default = "default_prior_strength")]
    pub prior_strength: f64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            multiplier_min: default_multiplier_min(),
            multiplier_max: default_multiplier_max(),
            max_step: default_max_step(),
            smoothing: default_smoothing(),
            prior_strength: default_prior_strength(),
        }
    }
}

fn default_min_samples() -> u32 { 10 }
fn default_multiplier_min() -> f64 { 0.25 }
fn default_multiplier_max() -> f64 { 2.5 }
fn default_max_step() -> f64 { 0.05 }
fn default_smoothing() -> f64 { 0.5 }
fn default_prior_strength() -> f64 { 2.0 }

/// Risk gate chain parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    pub base_score_floor: f64,
    /// Regime name -> score floor override
    pub regime_score_floors: BTreeMap<String, f64>,
    /// Symbol -> minimum score floor
    pub symbol_score_floors: BTreeMap<String, f64>,
    pub healing_loss_streak: u32,
    pub healing_bump: f64,
    pub healing_decay_hours: i64,
    pub ev_floor: f64,
    pub bootstrap_ev_floor: f64,
    pub bootstrap_samples: u64,
    pub expectancy_top_components: usize,
    pub max_new_entries_per_cycle: usize,
    pub max_open_positions: usize,
    pub rejection_cooldown_secs: i64,
    pub reentry_cooldown_secs: i64,
    pub max_net_exposure_pct: f64,
    pub max_theme_exposure_pct: f64,
    pub min_momentum_pct: f64,
    pub momentum_horizon_secs: i64,
    pub enable_displacement: bool,
    pub displacement_margin: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            base_score_floor: 2.5,
            regime_score_floors: BTreeMap::from([
                ("risk_off".to_string(), 3.0),
                ("panic".to_string(), 3.5),
            ]),
            symbol_score_floors: BTreeMap::new(),
            healing_loss_streak: 3,
            healing_bump: 0.5,
            healing_decay_hours: 24,
            ev_floor: 0.0,
            bootstrap_ev_floor: -0.5,
            bootstrap_samples: 30,
            expectancy_top_components: 3,
            max_new_entries_per_cycle: 2,
            max_open_positions: 10,
            rejection_cooldown_secs: 900,
            reentry_cooldown_secs: 1800,
            max_net_exposure_pct: 60.0,
            max_theme_exposure_pct: 25.0,
            min_momentum_pct: 0.1,
            momentum_horizon_secs: 900,
            enable_displacement: true,
            displacement_margin: 1.0,
        }
    }
}

impl GateConfig {
    /// Score floor before the self-healing bump: regime entry (or base
    /// floor), raised to any per-symbol floor
    pub fn score_floor(&self, regime: Regime, symbol: &str) -> f64 {
        let regime_floor = self
            .regime_score_floors
            .get(regime.as_str())
            .copied()
            .unwrap_or(self.base_score_floor);
        // Config keys arrive lowercased from file sources
        match self
            .symbol_score_floors
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(symbol))
        {
            Some((_, floor)) => regime_floor.max(*floor),
            None => regime_floor,
        }
    }
}

/// Execution configuration (sizing, validation, retries, fill polling)
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ExecutionConfig {
    /// Target position size as percent of equity
    #[serde(default = "default_position_size_pct")]
    pub position_size_pct: f64,
    #[serde(default = "default_max_position_notional")]
    pub max_position_notional: Decimal,
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
    /// Max quoted spread as percent of mid
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,
    /// Limit offset from the touch in basis points (e.g., 10 for 0.1%)
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: u32,
    #[serde(default = "default_use_limit_orders")]
    pub use_limit_orders: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Fractional jitter applied to each backoff delay
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_fill_poll_attempts")]
    pub fill_poll_attempts: u32,
    #[serde(default = "default_fill_poll_interval_ms")]
    pub fill_poll_interval_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            position_size_pct: default_position_size_pct(),
            max_position_notional: default_max_position_notional(),
            min_notional: default_min_notional(),
            max_spread_pct: default_max_spread_pct(),
            max_slippage_bps: default_max_slippage_bps(),
            use_limit_orders: default_use_limit_orders(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
            fill_poll_attempts: default_fill_poll_attempts(),
            fill_poll_interval_ms: default_fill_poll_interval_ms(),
        }
    }
}

fn default_position_size_pct() -> f64 { 5.0 }
fn default_max_position_notional() -> Decimal { Decimal::from(25_000) }
fn default_min_notional() -> Decimal { Decimal::from(100) }
fn default_max_spread_pct() -> f64 { 0.5 }
fn default_max_slippage_bps() -> u32 { 10 }
fn default_use_limit_orders() -> bool { true }
fn default_max_attempts() -> u32 { 4 }
fn default_backoff_base_ms() -> u64 { 500 }
fn default_backoff_max_ms() -> u64 { 8_000 }
fn default_jitter() -> f64 { 0.2 }
fn default_fill_poll_attempts() -> u32 { 5 }
fn default_fill_poll_interval_ms() -> u64 { 1_000 }

/// Exit trigger thresholds
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ExitConfig {
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_profit_target_pct")]
    pub profit_target_pct: f64,
    /// Favorable excursion that arms the trailing stop
    #[serde(default = "default_trail_activation_pct")]
    pub trail_activation_pct: f64,
    #[serde(default = "default_trail_base_pct")]
    pub trail_base_pct: f64,
    /// Trail distance shrinks by this fraction of the excursion
    #[serde(default = "default_trail_tighten_factor")]
    pub trail_tighten_factor: f64,
    #[serde(default = "default_trail_min_pct")]
    pub trail_min_pct: f64,
    #[serde(default = "default_max_hold_minutes")]
    pub max_hold_minutes: i64,
    #[serde(default = "default_decay_ratio")]
    pub decay_ratio: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: default_stop_loss_pct(),
            profit_target_pct: default_profit_target_pct(),
            trail_activation_pct: default_trail_activation_pct(),
            trail_base_pct: default_trail_base_pct(),
            trail_tighten_factor: default_trail_tighten_factor(),
            trail_min_pct: default_trail_min_pct(),
            max_hold_minutes: default_max_hold_minutes(),
            decay_ratio: default_decay_ratio(),
        }
    }
}

fn default_stop_loss_pct() -> f64 { 3.5 }
fn default_profit_target_pct() -> f64 { 8.0 }
fn default_trail_activation_pct() -> f64 { 2.0 }
fn default_trail_base_pct() -> f64 { 2.5 }
fn default_trail_tighten_factor() -> f64 { 0.15 }
fn default_trail_min_pct() -> f64 { 1.0 }
fn default_max_hold_minutes() -> i64 { 180 }
fn default_decay_ratio() -> f64 { 0.6 }

/// Position reconciliation cadence and thresholds
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_secs: u64,
    /// Consecutive divergent checks before a corrective sync
    pub correct_after: u32,
    /// Consecutive divergent checks before degraded mode
    pub degraded_threshold: u32,
    /// Consecutive clean checks that clear degraded mode
    pub recovery_clean_cycles: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            correct_after: 2,
            degraded_threshold: 3,
            recovery_clean_cycles: 2,
        }
    }
}

/// Capital-risk limits
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RiskCaps {
    pub max_daily_loss_pct: f64,
    pub max_drawdown_pct: f64,
}

impl Default for RiskCaps {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: 4.0,
            max_drawdown_pct: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
    pub deferred_max_len: usize,
    pub deferred_max_age_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_per_sec: 3.0,
            deferred_max_len: 50,
            deferred_max_age_secs: 1800,
        }
    }
}

/// Supervisor restart policy
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_interval_secs: u64,
    /// Missed loop intervals before the worker counts as stalled
    pub stall_intervals: u32,
    pub init_timeout_secs: u64,
    pub restart_base_secs: u64,
    pub restart_max_secs: u64,
    pub max_restarts: usize,
    pub restart_window_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 15,
            stall_intervals: 3,
            init_timeout_secs: 120,
            restart_base_secs: 2,
            restart_max_secs: 120,
            max_restarts: 10,
            restart_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub base_url: String,
    pub data_url: String,
    pub timeout_secs: u64,
    pub paper_starting_cash: Decimal,
    /// Synthetic spread around the cached price for paper quotes
    pub paper_spread_bps: u32,
    /// Max random adverse slippage on paper fills
    pub paper_slippage_bps: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://paper-api.alpaca.markets".to_string(),
            data_url: "https://data.alpaca.markets".to_string(),
            timeout_secs: 10,
            paper_starting_cash: Decimal::from(100_000),
            paper_spread_bps: 5,
            paper_slippage_bps: 0,
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flow-runner")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
trading_mode = "paper"
symbols = ["AAPL", "NVDA"]

[gates]
max_open_positions = 4
symbol_score_floors = {{ NVDA = 3.2 }}

[execution]
max_spread_pct = 0.25
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.symbols, vec!["AAPL", "NVDA"]);
        assert_eq!(settings.gates.max_open_positions, 4);
        assert_eq!(settings.execution.max_spread_pct, 0.25);
        assert_eq!(settings.gates.score_floor(Regime::Neutral, "NVDA"), 3.2);
        // Unset fields keep their defaults
        assert_eq!(settings.execution.max_attempts, 4);
        assert_eq!(settings.exits.max_hold_minutes, 180);
    }

    #[test]
    fn test_score_floor_precedence() {
        let mut gates = GateConfig::default();
        gates.symbol_score_floors.insert("NVDA".to_string(), 3.2);

        // Base floor when the regime has no entry
        assert_eq!(gates.score_floor(Regime::Neutral, "AAPL"), 2.5);
        // Regime entry replaces the base floor
        assert_eq!(gates.score_floor(Regime::Panic, "AAPL"), 3.5);
        // Symbol floor raises but never lowers
        assert_eq!(gates.score_floor(Regime::Neutral, "NVDA"), 3.2);
        assert_eq!(gates.score_floor(Regime::Panic, "NVDA"), 3.5);
    }

    #[test]
    fn test_session_window() {
        let cfg = LoopConfig::default();
        // Wednesday
        let open = Utc.with_ymd_and_hms(2026, 3, 4, 15, 0, 0).unwrap();
        let closed = Utc.with_ymd_and_hms(2026, 3, 4, 21, 0, 0).unwrap();
        let saturday = Utc.with_ymd_and_hms(2026, 3, 7, 15, 0, 0).unwrap();

        assert!(cfg.in_session(open));
        assert!(!cfg.in_session(closed));
        assert!(!cfg.in_session(saturday));
    }

    #[test]
    fn test_invalid_multiplier_bounds_rejected() {
        let mut settings = Settings::default();
        settings.learner.multiplier_min = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unknown_base_weight_ignored() {
        let mut scoring = ScoringConfig::default();
        scoring.base_weights.insert("astrology".to_string(), 9.0);
        scoring.base_weights.insert("insider".to_string(), 2.0);

        let map = scoring.base_weight_map();
        assert_eq!(map.len(), SignalComponent::ALL.len());
        assert_eq!(map[&SignalComponent::Insider], 2.0);
    }
}
