//! Flow Runner - decision loop orchestration
//!
//! One cycle: refresh signals, check capital risk, classify the regime,
//! reconcile when due, run exits, then (if permitted and in session) score
//! the universe and push candidates through the gate chain.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::{Account, Broker};
use crate::cache::SignalCache;
use crate::config::Settings;
use crate::executor::{ExecutionEngine, Permits};
use crate::exits::{ExitDecision, ExitManager};
use crate::expectancy::ExpectancyModel;
use crate::gates::{CooldownBook, GateContext, GateVerdict, RiskGateChain, CAPACITY};
use crate::learner::{apply_outcome, AdaptiveWeightLearner, WeightModel};
use crate::market::PriceHistory;
use crate::portfolio::{Portfolio, ThemeBook};
use crate::ratelimit::{DeferredCandidate, DeferredQueue, TokenBucket};
use crate::reconciler::{PositionReconciler, ReconciliationReport, ReconciliationState};
use crate::regime::{RegimeClassifier, RegimeReading};
use crate::retry::RetryPolicy;
use crate::risk::{RiskMonitor, RiskState};
use crate::scoring::{CompositeScorer, ScoringContext};
use crate::state::{CycleStats, DecisionAction, DecisionRecord, NowState, StateManager};
use crate::types::{from_f64, to_f64, Candidate, CompositeScore, GateDecision, SignalSnapshot, TradeOutcome};

/// Liveness signal sent to the supervisor after init and after every cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Heartbeat {
    pub at: Instant,
    pub cycle: u64,
    /// Initialization finished and the steady-state loop is running
    pub steady: bool,
}

impl Heartbeat {
    pub fn starting() -> Self {
        Self {
            at: Instant::now(),
            cycle: 0,
            steady: false,
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub regime: RegimeReading,
    pub in_session: bool,
    pub frozen: bool,
    pub degraded: bool,
    pub candidates: usize,
    pub entries: Vec<String>,
    /// (symbol, close reason)
    pub exits: Vec<(String, String)>,
    pub rejections: usize,
    pub deferred: usize,
    pub failures: Vec<String>,
    pub reconciliation: Option<ReconciliationReport>,
}

pub struct TradingRunner {
    settings: Settings,
    broker: Arc<dyn Broker>,
    cache: Arc<dyn SignalCache>,
    state: StateManager,
    limiter: TokenBucket,
    policy: RetryPolicy,
    scorer: CompositeScorer,
    classifier: RegimeClassifier,
    learner: AdaptiveWeightLearner,
    expectancy: ExpectancyModel,
    gates: RiskGateChain,
    engine: ExecutionEngine,
    reconciler: PositionReconciler,
    exits: ExitManager,
    risk_monitor: RiskMonitor,
    risk: RiskState,
    recon: ReconciliationState,
    deferred: DeferredQueue,
    cooldowns: CooldownBook,
    prices: PriceHistory,
    themes: ThemeBook,
    regime: RegimeReading,
    cycle: u64,
}

impl TradingRunner {
    pub fn new(settings: Settings, broker: Arc<dyn Broker>, cache: Arc<dyn SignalCache>) -> Self {
        let limiter = TokenBucket::new(settings.rate_limit.capacity, settings.rate_limit.refill_per_sec);
        let base = settings.scoring.base_weight_map();
        let model = WeightModel::neutral(&base, settings.learner.prior_strength);

        Self {
            state: StateManager::new(settings.state_dir.clone()),
            policy: RetryPolicy::from_config(&settings.execution),
            scorer: CompositeScorer::new(settings.scoring.clone()),
            classifier: RegimeClassifier::new(settings.regime.clone()),
            learner: AdaptiveWeightLearner::new(settings.learner.clone(), model),
            expectancy: ExpectancyModel::new(settings.gates.expectancy_top_components),
            gates: RiskGateChain::standard(&settings.gates),
            engine: ExecutionEngine::new(broker.clone(), limiter.clone(), settings.execution.clone()),
            reconciler: PositionReconciler::new(settings.reconcile.clone()),
            exits: ExitManager::new(settings.exits.clone()),
            risk_monitor: RiskMonitor::new(settings.risk),
            risk: RiskState::default(),
            recon: ReconciliationState::default(),
            deferred: DeferredQueue::default(),
            cooldowns: CooldownBook::default(),
            prices: PriceHistory::new(settings.regime.lookback_bars.max(64)),
            themes: ThemeBook::from_config(&settings.themes),
            regime: RegimeReading::mixed(),
            cycle: 0,
            limiter,
            broker,
            cache,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn risk_state(&self) -> &RiskState {
        &self.risk
    }

    pub fn reconciliation_state(&self) -> &ReconciliationState {
        &self.recon
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub fn regime(&self) -> RegimeReading {
        self.regime
    }

    pub fn weights(&self) -> &WeightModel {
        self.learner.model()
    }

    pub fn permits(&self) -> Permits {
        Permits {
            degraded: self.recon.degraded_mode,
            frozen: self.risk.is_frozen(),
        }
    }

    /// Load persisted state and run the initial reconciliation
    pub async fn initialize(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.state.init().await?;
        self.reload_weights()?;

        self.recon = self.state.positions.load().context("loading positions")?;
        self.engine.set_positions(self.recon.internal_positions.clone());

        self.risk = self.state.risk.load().context("loading risk state")?;
        if let Some(freeze) = &self.risk.freeze {
            warn!(
                "Entries remain frozen since {}: {} (run reset-freeze to clear)",
                freeze.at, freeze.reason
            );
        }

        self.deferred = self.state.deferred.load().context("loading deferred queue")?;
        let outcomes = self.state.outcomes.read_all().context("reading outcome log")?;
        self.expectancy =
            ExpectancyModel::from_outcomes(&outcomes, self.settings.gates.expectancy_top_components);

        let report = self.reconcile(now).await?;
        info!(
            "Initialized: {} open positions, {} outcomes on record, {} deferred, degraded={}",
            self.engine.positions().len(),
            outcomes.len(),
            self.deferred.len(),
            report.degraded_mode
        );
        Ok(())
    }

    /// Pick up the on-disk model; `reset-weights` and `rebuild-weights`
    /// may have replaced it
    fn reload_weights(&mut self) -> anyhow::Result<()> {
        let base = self.settings.scoring.base_weight_map();
        let prior = self.settings.learner.prior_strength;
        let model = self
            .state
            .weights
            .update(|model| {
                if model.components.is_empty() {
                    *model = WeightModel::neutral(&base, prior);
                } else {
                    model.sync_base_weights(&base, prior);
                }
                model.clone()
            })
            .context("loading weights")?;
        self.learner.set_model(model);
        Ok(())
    }

    /// Initialization, then the steady-state loop until shutdown
    pub async fn run(
        mut self,
        heartbeat: watch::Sender<Heartbeat>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(
            "Flow runner initializing ({:?} mode, state in {})",
            self.settings.trading_mode,
            self.state.state_dir().display()
        );
        let _ = heartbeat.send(Heartbeat::starting());
        self.initialize(Utc::now())
            .await
            .context("initialization failed")?;

        let mut ticker = tokio::time::interval(self.settings.cycle.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let max_failures = self.settings.cycle.max_consecutive_failures.max(1);
        let mut failures = 0u32;

        let _ = heartbeat.send(Heartbeat {
            at: Instant::now(),
            cycle: self.cycle,
            steady: true,
        });
        info!("Steady state reached, cycling every {:?}", self.settings.cycle.interval());

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, stopping between cycles");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.run_cycle(Utc::now()).await {
                        Ok(report) => {
                            failures = 0;
                            info!(
                                "Cycle {} done: regime {}, {} entries, {} exits, {} rejections, {} deferred",
                                report.cycle,
                                report.regime.regime,
                                report.entries.len(),
                                report.exits.len(),
                                report.rejections,
                                report.deferred
                            );
                        }
                        Err(e) => {
                            failures += 1;
                            error!("Cycle {} failed ({}/{}): {:#}", self.cycle, failures, max_failures, e);
                            if failures >= max_failures {
                                return Err(e.context(format!("{} consecutive cycle failures", failures)));
                            }
                        }
                    }
                    let _ = heartbeat.send(Heartbeat {
                        at: Instant::now(),
                        cycle: self.cycle,
                        steady: true,
                    });
                }
            }
        }

        self.persist()?;
        info!("Flow runner stopped after {} cycles", self.cycle);
        Ok(())
    }

    /// One full decision cycle
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> anyhow::Result<CycleReport> {
        self.cycle += 1;
        let mut report = CycleReport {
            cycle: self.cycle,
            ..CycleReport::default()
        };

        if let Err(e) = self.cache.refresh() {
            warn!("Signal cache refresh failed, keeping previous data: {:#}", e);
        }
        self.reload_weights()?;
        self.pick_up_freeze_reset()?;

        let account = self.fetch_account().await?;
        self.risk.roll_day(now, account.equity);
        self.risk.healing.expire(now, &self.settings.gates);
        self.check_capital_risk(&account, now)?;

        self.update_regime(now).await;
        report.regime = self.regime;

        if self.reconciler.is_due() {
            report.reconciliation = Some(self.reconcile(now).await?);
        }

        let marks = self.run_exits(now, &mut report).await?;
        // realized losses from this cycle's exits count immediately
        self.check_capital_risk(&account, now)?;

        let permits = self.permits();
        report.frozen = permits.frozen;
        report.degraded = permits.degraded;
        report.in_session = self.settings.cycle.in_session(now);

        if !permits.allows_entries() {
            info!(
                "Entries blocked (frozen={}, degraded={}); exits only",
                permits.frozen, permits.degraded
            );
        } else if !report.in_session {
            debug!("Outside market session, skipping entries");
        } else {
            self.run_entries(&account, &marks, now, &mut report).await?;
        }

        self.cooldowns.prune(now, &self.settings.gates);
        self.persist()?;
        self.write_status(&account, &marks, now, &report)?;
        Ok(report)
    }

    fn pick_up_freeze_reset(&mut self) -> anyhow::Result<()> {
        let on_disk = self.state.risk.load().context("loading risk state")?;
        if self.risk.adopt_operator_reset(&on_disk) {
            info!("Freeze cleared by operator, entries re-enabled");
        }
        Ok(())
    }

    /// Write the risk state back under the file lock, keeping any operator
    /// reset that landed since the last read
    fn store_risk(&mut self) -> anyhow::Result<()> {
        let risk = &mut self.risk;
        self.state
            .risk
            .update(|on_disk| {
                if risk.adopt_operator_reset(on_disk) {
                    info!("Freeze cleared by operator, entries re-enabled");
                }
                *on_disk = risk.clone();
            })
            .context("persisting risk state")
    }

    async fn fetch_account(&self) -> anyhow::Result<Account> {
        let broker = self.broker.clone();
        let limiter = self.limiter.clone();
        self.policy
            .run("account", |_| {
                let broker = broker.clone();
                let limiter = limiter.clone();
                async move {
                    limiter.acquire().await;
                    broker.account().await
                }
            })
            .await
            .map_err(|e| {
                anyhow!(
                    "account unavailable after {} attempts: {}",
                    e.attempts,
                    e.last_error
                )
            })
    }

    fn check_capital_risk(&mut self, account: &Account, now: DateTime<Utc>) -> anyhow::Result<()> {
        if let Some(record) = self.risk_monitor.evaluate(&mut self.risk, account.equity, now) {
            error!("Trading frozen: {}", record.reason);
            self.store_risk()?;
        }
        Ok(())
    }

    async fn update_regime(&mut self, now: DateTime<Utc>) {
        let benchmark = self.settings.cycle.benchmark_symbol.clone();
        match self.engine.quote(&benchmark).await {
            Ok(quote) => self
                .prices
                .record(&benchmark, now, to_f64(quote.reference_price())),
            Err(e) => warn!("Benchmark {} quote unavailable: {}", benchmark, e),
        }

        let market = self.cache.market();
        let reading = self
            .classifier
            .classify(&self.prices.closes(&benchmark), market.vol_index);
        if reading.regime != self.regime.regime {
            info!(
                "Regime {} -> {} (confidence {:.2})",
                self.regime.regime, reading.regime, reading.confidence
            );
        }
        self.regime = reading;
    }

    async fn reconcile(&mut self, now: DateTime<Utc>) -> anyhow::Result<ReconciliationReport> {
        self.limiter.acquire().await;
        let report = self
            .reconciler
            .reconcile(
                self.broker.as_ref(),
                self.engine.positions_mut(),
                &mut self.recon,
                now,
            )
            .await;
        self.state
            .positions
            .store(&self.recon)
            .context("persisting reconciliation state")?;
        Ok(report)
    }

    fn scoring_context(&self, now: DateTime<Utc>) -> ScoringContext<'_> {
        ScoringContext {
            model: self.learner.model(),
            regime: self.regime.regime,
            as_of: now,
        }
    }

    /// Mark every open position, evaluate exit rules, close what fired.
    /// Returns the marks used.
    async fn run_exits(
        &mut self,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> anyhow::Result<HashMap<String, Decimal>> {
        let mut marks = HashMap::new();
        let mut decisions = Vec::new();
        let symbols: Vec<String> = self.engine.positions().keys().cloned().collect();

        for symbol in symbols {
            let snapshot = self.cache.snapshot(&symbol);
            let price = match self.engine.quote(&symbol).await {
                Ok(quote) => Some(quote.reference_price()),
                Err(e) => {
                    warn!(symbol = %symbol, "Quote failed, falling back to cached price: {}", e);
                    snapshot.as_ref().and_then(|s| s.last_price).map(from_f64)
                }
            };
            let Some(price) = price.filter(|p| *p > Decimal::ZERO) else {
                warn!(symbol = %symbol, "No usable price, skipping exit checks");
                continue;
            };
            marks.insert(symbol.clone(), price);
            self.prices.record(&symbol, now, to_f64(price));

            let Some(direction) = self.engine.positions().get(&symbol).map(|p| p.direction()) else {
                continue;
            };
            let current = self
                .scorer
                .score(&symbol, snapshot.as_ref(), direction, &self.scoring_context(now))
                .final_score;

            if let Some(position) = self.engine.positions_mut().get_mut(&symbol) {
                if let Some(decision) = self.exits.evaluate(position, price, current, now) {
                    decisions.push(decision);
                }
            }
        }

        for decision in decisions {
            self.close_position(&decision, now, report).await;
        }
        Ok(marks)
    }

    async fn close_position(
        &mut self,
        decision: &ExitDecision,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> bool {
        let reason = decision.reason();
        match self.engine.submit_exit(&decision.symbol, &reason, now).await {
            Ok(outcome) => {
                self.record_outcome(&outcome, report);
                report.exits.push((decision.symbol.clone(), reason));
                true
            }
            Err(e) => {
                warn!(symbol = %decision.symbol, reason = %reason, "Exit failed: {}", e);
                report
                    .failures
                    .push(format!("exit {}: {}", decision.symbol, e));
                false
            }
        }
    }

    /// Feed a closed trade to the daily P&L, loss-streak tracker, cooldown
    /// book, expectancy model, outcome log and learner. The broker has
    /// already filled, so write failures are reported, not raised.
    fn record_outcome(&mut self, outcome: &TradeOutcome, report: &mut CycleReport) {
        info!(
            symbol = %outcome.symbol,
            pnl_pct = outcome.pnl_pct,
            pnl_usd = %outcome.pnl_usd,
            reason = %outcome.close_reason,
            "Position closed"
        );
        self.risk.record_realized(outcome.pnl_usd);
        self.risk
            .healing
            .record_outcome(outcome.is_win(), outcome.closed_at, &self.settings.gates);
        self.cooldowns.record_exit(&outcome.symbol, outcome.closed_at);
        self.expectancy.record(outcome);

        if let Err(e) = self.state.outcomes.append(outcome) {
            error!(symbol = %outcome.symbol, "Outcome log append failed: {}", e);
            report
                .failures
                .push(format!("outcome log {}: {}", outcome.symbol, e));
        }

        // read-modify-write under the file lock so an operator reset is not lost
        let base = self.settings.scoring.base_weight_map();
        let config = &self.settings.learner;
        let updated = self.state.weights.update(|model| {
            if model.components.is_empty() {
                *model = WeightModel::neutral(&base, config.prior_strength);
            }
            apply_outcome(config, model, outcome);
            model.clone()
        });
        match updated {
            Ok(model) => self.learner.set_model(model),
            Err(e) => {
                error!("Weight update failed, applying in memory only: {}", e);
                report
                    .failures
                    .push(format!("weights {}: {}", outcome.symbol, e));
                let mut model = self.learner.model().clone();
                apply_outcome(config, &mut model, outcome);
                self.learner.set_model(model);
            }
        }
    }

    fn target_notional(&self, equity: Decimal) -> Decimal {
        let pct = from_f64(self.settings.execution.position_size_pct) / Decimal::from(100);
        (equity * pct).min(self.settings.execution.max_position_notional)
    }

    fn candidate(
        &self,
        score: CompositeScore,
        snapshot: Option<&SignalSnapshot>,
        notional: Decimal,
    ) -> Candidate {
        let theme = self
            .themes
            .theme_for(&score.symbol, snapshot.and_then(|s| s.theme.as_deref()));
        let mut candidate = Candidate::new(score);
        candidate.theme = theme;
        candidate.price_change_pct = snapshot.and_then(|s| s.price_change_pct);
        candidate.proposed_notional = notional;
        candidate
    }

    /// Deferred candidates first (re-scored in their original direction),
    /// then the universe, strongest first. Also returns when each drained
    /// candidate was first deferred.
    fn collect_candidates(
        &mut self,
        equity: Decimal,
        now: DateTime<Utc>,
    ) -> (Vec<Candidate>, HashMap<String, DateTime<Utc>>) {
        let notional = self.target_notional(equity);
        let drained = self.deferred.take(self.settings.gates.max_new_entries_per_cycle);
        let mut seen = HashSet::new();
        let mut first_deferred = HashMap::new();
        let mut candidates = Vec::new();

        let ctx = self.scoring_context(now);
        for deferred in drained {
            let snapshot = self.cache.snapshot(&deferred.symbol);
            let score = self
                .scorer
                .score(&deferred.symbol, snapshot.as_ref(), deferred.direction, &ctx);
            seen.insert(deferred.symbol.clone());
            first_deferred.insert(deferred.symbol.clone(), deferred.deferred_at);
            candidates.push(self.candidate(score, snapshot.as_ref(), notional));
        }

        let universe: Vec<String> = if self.settings.symbols.is_empty() {
            self.cache.symbols()
        } else {
            self.settings
                .symbols
                .iter()
                .map(|s| s.trim().to_ascii_uppercase())
                .collect()
        };

        let mut scored = Vec::new();
        for symbol in universe {
            if seen.contains(&symbol) || self.engine.positions().contains_key(&symbol) {
                continue;
            }
            let Some(snapshot) = self.cache.snapshot(&symbol) else {
                continue;
            };
            let score = self.scorer.best_direction(&symbol, Some(&snapshot), &ctx);
            if score.final_score <= 0.0 {
                continue;
            }
            scored.push(self.candidate(score, Some(&snapshot), notional));
        }
        scored.sort_by(|a, b| {
            b.score
                .final_score
                .total_cmp(&a.score.final_score)
                .then_with(|| a.symbol().cmp(b.symbol()))
        });
        candidates.extend(scored);
        (candidates, first_deferred)
    }

    fn portfolio(&self, account: &Account, marks: &HashMap<String, Decimal>) -> Portfolio {
        let mut portfolio = Portfolio::new(account.equity, account.buying_power)
            .with_positions(self.engine.positions().values());
        portfolio.mark_to_market(marks);
        portfolio
    }

    fn evaluate_gates(
        &self,
        candidate: &Candidate,
        account: &Account,
        marks: &HashMap<String, Decimal>,
        entries: usize,
        now: DateTime<Utc>,
    ) -> GateVerdict {
        let portfolio = self.portfolio(account, marks);
        let pending = self.engine.pending_symbols();
        let ctx = GateContext {
            portfolio: &portfolio,
            regime: self.regime.regime,
            now,
            expectancy: &self.expectancy,
            cooldowns: &self.cooldowns,
            prices: &self.prices,
            themes: &self.themes,
            pending: &pending,
            entries_this_cycle: entries,
            healing_bump: self.risk.healing.bump(now, &self.settings.gates),
        };
        self.gates.evaluate(candidate, &ctx)
    }

    async fn run_entries(
        &mut self,
        account: &Account,
        marks: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> anyhow::Result<()> {
        let max_age = ChronoDuration::seconds(self.settings.rate_limit.deferred_max_age_secs);
        let expired = self.deferred.expire(now, max_age);
        if expired > 0 {
            info!("Dropped {} stale deferred candidates", expired);
        }

        let (candidates, first_deferred) = self.collect_candidates(account.equity, now);
        report.candidates = candidates.len();
        let budget = self.settings.gates.max_new_entries_per_cycle;
        let mut entries = 0usize;

        for candidate in candidates {
            if entries >= budget {
                debug!("Entry budget of {} spent this cycle", budget);
                break;
            }

            if self.regime.regime.is_elevated() && self.limiter.available() < 1.0 {
                let deferred = DeferredCandidate {
                    symbol: candidate.symbol().to_string(),
                    direction: candidate.direction(),
                    regime: self.regime.regime,
                    deferred_at: first_deferred
                        .get(candidate.symbol())
                        .copied()
                        .unwrap_or(now),
                };
                if self.deferred.push(deferred, self.settings.rate_limit.deferred_max_len) {
                    info!(symbol = %candidate.symbol(), "Broker budget exhausted, deferring candidate");
                    report.deferred += 1;
                    self.journal(&candidate, DecisionAction::Deferred, Vec::new(), None, now);
                }
                continue;
            }

            let mut verdict = self.evaluate_gates(&candidate, account, marks, entries, now);

            if self.displacement_applies(&verdict) {
                if let Some(weakest) = self.displacement_target(&candidate, marks, now) {
                    let pnl = self
                        .engine
                        .positions()
                        .get(&weakest)
                        .map(|p| p.pnl_pct(marks.get(&weakest).copied().unwrap_or(p.entry_price)))
                        .unwrap_or(0.0);
                    let decision = ExitDecision::displaced(&weakest, candidate.symbol(), pnl);
                    if self.close_position(&decision, now, report).await {
                        verdict = self.evaluate_gates(&candidate, account, marks, entries, now);
                    }
                }
            }

            if !verdict.admitted() {
                report.rejections += 1;
                if !verdict.rejected_by(CAPACITY) {
                    self.cooldowns.record_rejection(candidate.symbol(), now);
                }
                self.journal(&candidate, DecisionAction::Rejected, verdict.decisions, None, now);
                continue;
            }

            match self
                .engine
                .submit_entry(&candidate, self.permits(), account, now)
                .await
            {
                Ok(position) => {
                    entries += 1;
                    info!(
                        symbol = %position.symbol,
                        side = %position.side,
                        qty = %position.qty,
                        price = %position.entry_price,
                        score = position.entry_score,
                        "Position opened"
                    );
                    report.entries.push(position.symbol.clone());
                    self.journal(&candidate, DecisionAction::Entered, verdict.decisions, None, now);
                }
                Err(e) => {
                    warn!(symbol = %candidate.symbol(), "Entry failed: {}", e);
                    report.failures.push(format!("entry {}: {}", candidate.symbol(), e));
                    self.cooldowns.record_rejection(candidate.symbol(), now);
                    self.journal(
                        &candidate,
                        DecisionAction::Failed,
                        verdict.decisions,
                        Some(e.to_string()),
                        now,
                    );
                }
            }
        }
        Ok(())
    }

    /// Displacement only answers a full book; every other veto stands
    fn displacement_applies(&self, verdict: &GateVerdict) -> bool {
        self.settings.gates.enable_displacement
            && self.permits().allows_entries()
            && verdict
                .rejection()
                .is_some_and(|d| d.gate_name == CAPACITY && d.reason.starts_with("max_open_positions"))
    }

    /// Weakest open position the candidate beats by the configured margin
    fn displacement_target(
        &self,
        candidate: &Candidate,
        marks: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let ctx = self.scoring_context(now);
        let weakest = self
            .engine
            .positions()
            .values()
            .filter(|p| marks.contains_key(&p.symbol))
            .map(|p| {
                let snapshot = self.cache.snapshot(&p.symbol);
                let score = self
                    .scorer
                    .score(&p.symbol, snapshot.as_ref(), p.direction(), &ctx)
                    .final_score;
                (p.symbol.clone(), score)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))?;

        let margin = candidate.score.final_score - weakest.1;
        if margin >= self.settings.gates.displacement_margin {
            info!(
                "Displacing {} (score {:.2}) for {} (score {:.2})",
                weakest.0,
                weakest.1,
                candidate.symbol(),
                candidate.score.final_score
            );
            Some(weakest.0)
        } else {
            None
        }
    }

    fn journal(
        &self,
        candidate: &Candidate,
        action: DecisionAction,
        gates: Vec<GateDecision>,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) {
        let record = DecisionRecord {
            at: now,
            symbol: candidate.symbol().to_string(),
            direction: candidate.direction(),
            final_score: candidate.score.final_score,
            regime: candidate.score.regime,
            action,
            gates,
            detail,
        };
        if let Err(e) = self.state.decisions.append(&record) {
            warn!("Decision journal write failed: {}", e);
        }
    }

    fn persist(&mut self) -> anyhow::Result<()> {
        self.recon.internal_positions = self.engine.positions().clone();
        self.state
            .positions
            .store(&self.recon)
            .context("persisting positions")?;
        self.store_risk()?;
        self.state
            .deferred
            .store(&self.deferred)
            .context("persisting deferred queue")?;
        Ok(())
    }

    fn write_status(
        &self,
        account: &Account,
        marks: &HashMap<String, Decimal>,
        now: DateTime<Utc>,
        report: &CycleReport,
    ) -> anyhow::Result<()> {
        let status = if report.frozen {
            "frozen"
        } else if report.degraded {
            "degraded"
        } else {
            "trading"
        };
        let now_state = NowState {
            timestamp: Some(now),
            mode: format!("{:?}", self.settings.trading_mode).to_lowercase(),
            status: status.to_string(),
            cycle: self.cycle,
            regime: self.regime.regime,
            regime_confidence: self.regime.confidence,
            in_session: report.in_session,
            degraded_mode: self.recon.degraded_mode,
            freeze_reason: self.risk.freeze.as_ref().map(|f| f.reason.clone()),
            deferred_len: self.deferred.len(),
            tokens_available: self.limiter.available(),
            portfolio: Some(self.portfolio(account, marks).snapshot()),
            last_cycle: CycleStats {
                candidates: report.candidates,
                entries: report.entries.len(),
                exits: report.exits.len(),
                rejections: report.rejections,
                deferred: report.deferred,
                failures: report.failures.len(),
            },
        };
        self.state.write_now(&now_state)
    }
}
