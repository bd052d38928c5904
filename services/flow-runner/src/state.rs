//! Persisted state - documents, journals and the `now.json` status file

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::learner::WeightModel;
use crate::portfolio::PortfolioSnapshot;
use crate::ratelimit::DeferredQueue;
use crate::reconciler::ReconciliationState;
use crate::risk::RiskState;
use crate::store::{JsonlLog, StateFile};
use crate::types::{Direction, GateDecision, Regime, TradeOutcome};

/// Every file the runner owns under `state_dir`
pub struct StateManager {
    state_dir: PathBuf,
    pub weights: StateFile<WeightModel>,
    pub positions: StateFile<ReconciliationState>,
    pub risk: StateFile<RiskState>,
    pub deferred: StateFile<DeferredQueue>,
    pub outcomes: JsonlLog<TradeOutcome>,
    pub decisions: JsonlLog<DecisionRecord>,
    now: StateFile<NowState>,
}

/// What happened to a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Entered,
    Rejected,
    Deferred,
    Failed,
}

/// One line of `decisions.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub at: DateTime<Utc>,
    pub symbol: String,
    pub direction: Direction,
    pub final_score: f64,
    pub regime: Regime,
    pub action: DecisionAction,
    pub gates: Vec<GateDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Current status (`now.json`), read by the dashboard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NowState {
    pub timestamp: Option<DateTime<Utc>>,
    pub mode: String,
    pub status: String,
    pub cycle: u64,
    pub regime: Regime,
    pub regime_confidence: f64,
    pub in_session: bool,
    pub degraded_mode: bool,
    #[serde(default)]
    pub freeze_reason: Option<String>,
    pub deferred_len: usize,
    pub tokens_available: f64,
    #[serde(default)]
    pub portfolio: Option<PortfolioSnapshot>,
    pub last_cycle: CycleStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleStats {
    pub candidates: usize,
    pub entries: usize,
    pub exits: usize,
    pub rejections: usize,
    pub deferred: usize,
    pub failures: usize,
}

impl StateManager {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            weights: StateFile::new(state_dir.join("weights.json")),
            positions: StateFile::new(state_dir.join("positions.json")),
            risk: StateFile::new(state_dir.join("risk_state.json")),
            deferred: StateFile::new(state_dir.join("deferred.json")),
            outcomes: JsonlLog::new(state_dir.join("outcomes.jsonl")),
            decisions: JsonlLog::new(state_dir.join("decisions.jsonl")),
            now: StateFile::new(state_dir.join("now.json")),
            state_dir,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.state_dir)
            .await
            .with_context(|| format!("creating state dir {}", self.state_dir.display()))?;
        Ok(())
    }

    pub fn write_now(&self, state: &NowState) -> anyhow::Result<()> {
        self.now.store(state).context("writing now.json")?;
        debug!("Wrote now.json");
        Ok(())
    }

    pub fn read_now(&self) -> anyhow::Result<NowState> {
        Ok(self.now.load()?)
    }
}
