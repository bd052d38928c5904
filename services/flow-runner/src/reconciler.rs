//! Position reconciliation - diff the engine's book against the broker
//!
//! A single mismatch is tolerated (fills race the position endpoint).
//! Repeated mismatches trigger a corrective sync where the broker wins on
//! quantity and side; persistent divergence puts the runner in degraded mode.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerPosition};
use crate::config::ReconcileConfig;
use crate::types::{Position, PositionMetadata, Regime, Side};

/// Persisted reconciliation state (`positions.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationState {
    #[serde(default)]
    pub internal_positions: BTreeMap<String, Position>,
    #[serde(default)]
    pub broker_positions: BTreeMap<String, BrokerPosition>,
    #[serde(default)]
    pub divergence_count: u32,
    #[serde(default)]
    pub clean_streak: u32,
    #[serde(default)]
    pub degraded_mode: bool,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QtyMismatch {
    pub symbol: String,
    pub internal: Decimal,
    pub broker: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideMismatch {
    pub symbol: String,
    pub internal: Side,
    pub broker: Side,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub matches: Vec<String>,
    pub qty_mismatches: Vec<QtyMismatch>,
    pub side_mismatches: Vec<SideMismatch>,
    pub missing_at_broker: Vec<String>,
    pub unknown_at_broker: Vec<BrokerPosition>,
    pub fetch_error: Option<String>,
    /// Corrective sync applied this check
    pub corrected: bool,
    pub degraded_mode: bool,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.fetch_error.is_none()
            && self.qty_mismatches.is_empty()
            && self.side_mismatches.is_empty()
            && self.missing_at_broker.is_empty()
            && self.unknown_at_broker.is_empty()
    }

    pub fn divergence_total(&self) -> usize {
        self.qty_mismatches.len()
            + self.side_mismatches.len()
            + self.missing_at_broker.len()
            + self.unknown_at_broker.len()
    }
}

/// Compare the internal book with broker-reported positions
pub fn diff(
    internal: &BTreeMap<String, Position>,
    broker: &BTreeMap<String, BrokerPosition>,
) -> ReconciliationReport {
    let mut report = ReconciliationReport::default();

    for (symbol, pos) in internal {
        match broker.get(symbol) {
            Some(remote) if remote.side != pos.side => report.side_mismatches.push(SideMismatch {
                symbol: symbol.clone(),
                internal: pos.side,
                broker: remote.side,
            }),
            Some(remote) if remote.qty != pos.qty => report.qty_mismatches.push(QtyMismatch {
                symbol: symbol.clone(),
                internal: pos.qty,
                broker: remote.qty,
            }),
            Some(_) => report.matches.push(symbol.clone()),
            None => report.missing_at_broker.push(symbol.clone()),
        }
    }

    report.unknown_at_broker = broker
        .iter()
        .filter(|(symbol, remote)| !internal.contains_key(*symbol) && remote.qty > Decimal::ZERO)
        .map(|(_, remote)| remote.clone())
        .collect();

    report
}

pub struct PositionReconciler {
    config: ReconcileConfig,
    last_run: Option<Instant>,
}

impl PositionReconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self {
            config,
            last_run: None,
        }
    }

    pub fn is_due(&self) -> bool {
        let interval = Duration::from_secs(self.config.interval_secs);
        self.last_run
            .map(|last| last.elapsed() >= interval)
            .unwrap_or(true)
    }

    /// Fetch broker positions, diff, and advance the divergence state machine
    pub async fn reconcile(
        &mut self,
        broker: &dyn Broker,
        positions: &mut BTreeMap<String, Position>,
        state: &mut ReconciliationState,
        now: DateTime<Utc>,
    ) -> ReconciliationReport {
        self.last_run = Some(Instant::now());
        state.last_checked = Some(now);

        let mut report = match broker.positions().await {
            Ok(remote) => {
                let remote: BTreeMap<String, BrokerPosition> = remote
                    .into_iter()
                    .map(|p| (p.symbol.clone(), p))
                    .collect();
                let report = diff(positions, &remote);
                state.broker_positions = remote;
                report
            }
            Err(e) => {
                warn!("Reconciliation fetch failed: {}", e);
                ReconciliationReport {
                    fetch_error: Some(e.to_string()),
                    ..ReconciliationReport::default()
                }
            }
        };

        if report.is_clean() {
            state.divergence_count = 0;
            state.clean_streak += 1;
            if state.degraded_mode && state.clean_streak >= self.config.recovery_clean_cycles {
                info!(
                    "Reconciliation clean for {} checks, leaving degraded mode",
                    state.clean_streak
                );
                state.degraded_mode = false;
            }
        } else {
            state.divergence_count += 1;
            state.clean_streak = 0;
            self.log_divergence(&report, state.divergence_count);

            if report.fetch_error.is_none() && state.divergence_count >= self.config.correct_after {
                let remote = state.broker_positions.clone();
                self.apply_correction(&report, positions, &remote, now);
                report.corrected = true;
            }
            if state.divergence_count >= self.config.degraded_threshold && !state.degraded_mode {
                error!(
                    "Reconciliation diverged {} consecutive checks, entering degraded mode",
                    state.divergence_count
                );
                state.degraded_mode = true;
            }
        }

        state.internal_positions = positions.clone();
        report.degraded_mode = state.degraded_mode;
        info!(
            "Reconciliation complete: {} matches, {} divergences{}",
            report.matches.len(),
            report.divergence_total(),
            if report.corrected { " (corrected)" } else { "" }
        );
        report
    }

    fn log_divergence(&self, report: &ReconciliationReport, count: u32) {
        for m in &report.qty_mismatches {
            warn!(
                symbol = %m.symbol,
                "Quantity mismatch: internal={}, broker={} (check {})",
                m.internal, m.broker, count
            );
        }
        for m in &report.side_mismatches {
            warn!(
                symbol = %m.symbol,
                "Side mismatch: internal={}, broker={} (check {})",
                m.internal, m.broker, count
            );
        }
        for symbol in &report.missing_at_broker {
            warn!(symbol = %symbol, "Position missing at broker (check {})", count);
        }
        for remote in &report.unknown_at_broker {
            warn!(
                symbol = %remote.symbol,
                "Unknown broker position: {} {} (check {})",
                remote.side, remote.qty, count
            );
        }
    }

    /// Broker wins on quantity and side; entry context survives where the
    /// symbol still matches
    fn apply_correction(
        &self,
        report: &ReconciliationReport,
        positions: &mut BTreeMap<String, Position>,
        remote: &BTreeMap<String, BrokerPosition>,
        now: DateTime<Utc>,
    ) {
        for m in &report.qty_mismatches {
            if let Some(pos) = positions.get_mut(&m.symbol) {
                info!("Correcting {} qty: {} -> {}", m.symbol, m.internal, m.broker);
                pos.qty = m.broker;
            }
        }

        for m in &report.side_mismatches {
            if let (Some(pos), Some(broker_pos)) = (positions.get_mut(&m.symbol), remote.get(&m.symbol)) {
                info!("Correcting {} side: {} -> {}", m.symbol, m.internal, m.broker);
                pos.side = broker_pos.side;
                pos.qty = broker_pos.qty;
                pos.entry_price = broker_pos.avg_entry_price;
                pos.metadata.high_water_price = Some(broker_pos.avg_entry_price);
            }
        }

        for symbol in &report.missing_at_broker {
            warn!("Dropping {}: no longer held at broker", symbol);
            positions.remove(symbol);
        }

        for broker_pos in &report.unknown_at_broker {
            info!(
                "Adopting broker position {} {} {} with unknown entry context",
                broker_pos.symbol, broker_pos.side, broker_pos.qty
            );
            positions.insert(
                broker_pos.symbol.clone(),
                Position {
                    symbol: broker_pos.symbol.clone(),
                    side: broker_pos.side,
                    qty: broker_pos.qty,
                    entry_price: broker_pos.avg_entry_price,
                    entry_score: 0.0,
                    entry_time: now,
                    metadata: PositionMetadata {
                        regime_at_entry: Regime::Mixed,
                        high_water_price: Some(broker_pos.avg_entry_price),
                        unknown_entry_context: true,
                        ..PositionMetadata::default()
                    },
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Account, BrokerError, OrderAck, OrderRequest, Quote};
    use crate::types::SignalComponent;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Serves a scripted sequence of position lists; `None` means fetch failure
    struct ScriptedBroker {
        script: Mutex<Vec<Option<Vec<BrokerPosition>>>>,
    }

    impl ScriptedBroker {
        fn new(mut script: Vec<Option<Vec<BrokerPosition>>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl Broker for ScriptedBroker {
        async fn account(&self) -> Result<Account, BrokerError> {
            unreachable!()
        }

        async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
            match self.script.lock().unwrap().pop().flatten() {
                Some(list) => Ok(list),
                None => Err(BrokerError::Timeout("positions".into())),
            }
        }

        async fn quote(&self, _symbol: &str) -> Result<Quote, BrokerError> {
            unreachable!()
        }

        async fn submit_order(&self, _order: &OrderRequest) -> Result<OrderAck, BrokerError> {
            unreachable!()
        }

        async fn get_order(&self, _order_id: &str) -> Result<OrderAck, BrokerError> {
            unreachable!()
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<(), BrokerError> {
            unreachable!()
        }
    }

    fn remote(symbol: &str, side: Side, qty: i64) -> BrokerPosition {
        BrokerPosition {
            symbol: symbol.to_string(),
            side,
            qty: Decimal::from(qty),
            avg_entry_price: Decimal::from(100),
        }
    }

    fn book(entries: &[(&str, Side, i64)]) -> BTreeMap<String, Position> {
        entries
            .iter()
            .map(|(symbol, side, qty)| {
                let mut metadata = PositionMetadata::default();
                metadata.component_breakdown.insert(SignalComponent::DarkPool, 0.6);
                (
                    symbol.to_string(),
                    Position {
                        symbol: symbol.to_string(),
                        side: *side,
                        qty: Decimal::from(*qty),
                        entry_price: Decimal::from(100),
                        entry_score: 3.0,
                        entry_time: Utc::now(),
                        metadata,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_diff_categories() {
        let internal = book(&[("AAPL", Side::Long, 10), ("MSFT", Side::Long, 5), ("TSLA", Side::Long, 3), ("AMD", Side::Long, 1)]);
        let remote: BTreeMap<String, BrokerPosition> = [
            remote("AAPL", Side::Long, 10),
            remote("MSFT", Side::Long, 7),
            remote("TSLA", Side::Short, 3),
            remote("NVDA", Side::Long, 2),
        ]
        .into_iter()
        .map(|p| (p.symbol.clone(), p))
        .collect();

        let report = diff(&internal, &remote);
        assert_eq!(report.matches, vec!["AAPL".to_string()]);
        assert_eq!(report.qty_mismatches.len(), 1);
        assert_eq!(report.side_mismatches.len(), 1);
        assert_eq!(report.missing_at_broker, vec!["AMD".to_string()]);
        assert_eq!(report.unknown_at_broker[0].symbol, "NVDA");
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_converges_without_degrading() {
        let drifted = vec![remote("AAPL", Side::Long, 12), remote("NVDA", Side::Long, 4)];
        let broker = ScriptedBroker::new(vec![
            Some(drifted.clone()),
            Some(drifted.clone()),
            Some(drifted),
            Some(vec![remote("AAPL", Side::Long, 12), remote("NVDA", Side::Long, 4)]),
        ]);
        let mut reconciler = PositionReconciler::new(ReconcileConfig::default());
        let mut positions = book(&[("AAPL", Side::Long, 10)]);
        let mut state = ReconciliationState::default();
        let now = Utc::now();

        // First mismatch tolerated
        let first = reconciler.reconcile(&broker, &mut positions, &mut state, now).await;
        assert!(!first.corrected);
        assert_eq!(positions["AAPL"].qty, Decimal::from(10));

        // Second mismatch corrects; broker wins, metadata survives
        let second = reconciler.reconcile(&broker, &mut positions, &mut state, now).await;
        assert!(second.corrected);
        assert_eq!(positions["AAPL"].qty, Decimal::from(12));
        assert_eq!(positions["AAPL"].metadata.component_breakdown.len(), 1);
        assert!(positions["NVDA"].metadata.unknown_entry_context);

        // Books now agree; nothing further diverges
        for _ in 0..2 {
            let report = reconciler.reconcile(&broker, &mut positions, &mut state, now).await;
            assert!(report.is_clean());
            assert!(!report.degraded_mode);
        }
        assert_eq!(state.divergence_count, 0);
        assert_eq!(state.internal_positions.len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_failure_degrades_then_recovers() {
        let broker = ScriptedBroker::new(vec![None, None, None, Some(vec![]), Some(vec![])]);
        let mut reconciler = PositionReconciler::new(ReconcileConfig::default());
        let mut positions = BTreeMap::new();
        let mut state = ReconciliationState::default();
        let now = Utc::now();

        for _ in 0..2 {
            reconciler.reconcile(&broker, &mut positions, &mut state, now).await;
            assert!(!state.degraded_mode);
        }
        let third = reconciler.reconcile(&broker, &mut positions, &mut state, now).await;
        assert!(third.degraded_mode);
        assert!(!third.corrected);

        // One clean check is not enough to recover
        reconciler.reconcile(&broker, &mut positions, &mut state, now).await;
        assert!(state.degraded_mode);
        reconciler.reconcile(&broker, &mut positions, &mut state, now).await;
        assert!(!state.degraded_mode);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence() {
        let mut reconciler = PositionReconciler::new(ReconcileConfig {
            interval_secs: 60,
            ..ReconcileConfig::default()
        });
        assert!(reconciler.is_due());
        let broker = ScriptedBroker::new(vec![Some(vec![])]);
        reconciler
            .reconcile(&broker, &mut BTreeMap::new(), &mut ReconciliationState::default(), Utc::now())
            .await;
        assert!(!reconciler.is_due());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(reconciler.is_due());
    }
}
