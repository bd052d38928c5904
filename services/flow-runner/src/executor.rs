//! Execution engine - validates, submits and confirms orders
//!
//! The engine owns the open-position book. Entries are refused while the
//! runner is degraded or frozen; exits always go through.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::{
    Account, Broker, BrokerError, OrderAck, OrderRequest, OrderSide, OrderStatus, OrderType, Quote,
};
use crate::config::ExecutionConfig;
use crate::intent::{IntentRegistry, IntentState};
use crate::ratelimit::TokenBucket;
use crate::retry::RetryPolicy;
use crate::types::{from_f64, Candidate, Position, PositionMetadata, Side, TradeOutcome};

/// What the runner currently allows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permits {
    pub degraded: bool,
    pub frozen: bool,
}

impl Permits {
    pub fn allows_entries(&self) -> bool {
        !self.degraded && !self.frozen
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("entries blocked ({0})")]
    EntriesBlocked(&'static str),

    #[error("pre-trade check failed: {0}")]
    Validation(String),

    #[error("order abandoned after {attempts} attempts: {source}")]
    Abandoned {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("order {order_id} not filled ({status:?})")]
    Unfilled { order_id: String, status: OrderStatus },

    #[error("no open position for {0}")]
    NoPosition(String),
}

/// Filled quantity and price of a confirmed order
#[derive(Debug, Clone, PartialEq)]
struct Fill {
    order_id: String,
    qty: Decimal,
    price: Option<Decimal>,
}

pub struct ExecutionEngine {
    broker: Arc<dyn Broker>,
    limiter: TokenBucket,
    config: ExecutionConfig,
    policy: RetryPolicy,
    intents: IntentRegistry,
    positions: BTreeMap<String, Position>,
}

impl ExecutionEngine {
    pub fn new(broker: Arc<dyn Broker>, limiter: TokenBucket, config: ExecutionConfig) -> Self {
        let policy = RetryPolicy::from_config(&config);
        Self {
            broker,
            limiter,
            config,
            policy,
            intents: IntentRegistry::new(),
            positions: BTreeMap::new(),
        }
    }

    pub fn with_positions(mut self, positions: BTreeMap<String, Position>) -> Self {
        self.positions = positions;
        self
    }

    pub fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    pub fn positions_mut(&mut self) -> &mut BTreeMap<String, Position> {
        &mut self.positions
    }

    pub fn set_positions(&mut self, positions: BTreeMap<String, Position>) {
        self.positions = positions;
    }

    pub fn intents(&self) -> &IntentRegistry {
        &self.intents
    }

    pub fn pending_symbols(&self) -> HashSet<String> {
        self.intents.pending_symbols()
    }

    /// Quote with retries; each attempt waits for a rate-limit token
    pub async fn quote(&self, symbol: &str) -> Result<Quote, ExecutionError> {
        let broker = self.broker.clone();
        let limiter = self.limiter.clone();
        self.policy
            .run("quote", |_| {
                let broker = broker.clone();
                let limiter = limiter.clone();
                let symbol = symbol.to_string();
                async move {
                    limiter.acquire().await;
                    broker.quote(&symbol).await
                }
            })
            .await
            .map_err(|e| ExecutionError::Abandoned {
                attempts: e.attempts,
                source: e.last_error,
            })
    }

    /// Validate, size and submit an entry; on fill the position joins the book
    pub async fn submit_entry(
        &mut self,
        candidate: &Candidate,
        permits: Permits,
        account: &Account,
        now: DateTime<Utc>,
    ) -> Result<Position, ExecutionError> {
        if permits.frozen {
            return Err(ExecutionError::EntriesBlocked("frozen"));
        }
        if permits.degraded {
            return Err(ExecutionError::EntriesBlocked("degraded"));
        }
        let symbol = candidate.symbol().to_string();
        if self.positions.contains_key(&symbol) {
            return Err(ExecutionError::Validation(format!("{} already held", symbol)));
        }
        if self.intents.find_active(&symbol).is_some() {
            return Err(ExecutionError::Validation(format!("{} has an order in flight", symbol)));
        }

        let quote = self.quote(&symbol).await?;
        let side = candidate.direction().side();
        let (qty, limit_price) = self.size_entry(candidate, side, &quote, account)?;
        let order_side = OrderSide::opening(side);
        let order_type = if limit_price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        };

        info!(
            symbol = %symbol,
            side = %order_side,
            qty = %qty,
            score = candidate.score.final_score,
            "Submitting entry"
        );
        let fill = self
            .submit_and_confirm(&symbol, order_side, qty, order_type, limit_price, now)
            .await?;

        let entry_price = fill.price.unwrap_or_else(|| quote.reference_price());
        let position = Position {
            symbol: symbol.clone(),
            side,
            qty: fill.qty,
            entry_price,
            entry_score: candidate.score.final_score,
            entry_time: now,
            metadata: PositionMetadata {
                regime_at_entry: candidate.score.regime,
                component_breakdown: candidate.score.component_breakdown.clone(),
                high_water_price: Some(entry_price),
                theme: candidate.theme.clone(),
                order_id: Some(fill.order_id),
                unknown_entry_context: false,
            },
        };
        self.positions.insert(symbol, position.clone());
        Ok(position)
    }

    fn size_entry(
        &self,
        candidate: &Candidate,
        side: Side,
        quote: &Quote,
        account: &Account,
    ) -> Result<(Decimal, Option<Decimal>), ExecutionError> {
        let price = quote.reference_price();
        if price <= Decimal::ZERO {
            return Err(ExecutionError::Validation(format!(
                "non-positive price {} for {}",
                price,
                candidate.symbol()
            )));
        }
        let spread = quote.spread_pct().ok_or_else(|| {
            ExecutionError::Validation(format!("invalid book for {}", candidate.symbol()))
        })?;
        if spread > self.config.max_spread_pct {
            return Err(ExecutionError::Validation(format!(
                "spread {:.3}% > {:.3}%",
                spread, self.config.max_spread_pct
            )));
        }

        let target = if candidate.proposed_notional > Decimal::ZERO {
            candidate.proposed_notional
        } else {
            account.equity * from_f64(self.config.position_size_pct) / Decimal::from(100)
        };
        let target = target.min(self.config.max_position_notional);
        let qty = (target / price).floor();
        if qty < Decimal::ONE {
            return Err(ExecutionError::Validation(format!(
                "target notional {} buys no shares at {}",
                target.round_dp(2),
                price
            )));
        }

        let notional = qty * price;
        if notional < self.config.min_notional {
            return Err(ExecutionError::Validation(format!(
                "notional {} below minimum {}",
                notional.round_dp(2),
                self.config.min_notional
            )));
        }
        if notional > account.buying_power {
            return Err(ExecutionError::Validation(format!(
                "notional {} exceeds buying power {}",
                notional.round_dp(2),
                account.buying_power
            )));
        }

        let limit_price = self.config.use_limit_orders.then(|| {
            let offset = Decimal::from(self.config.max_slippage_bps) / Decimal::from(10_000);
            match side {
                Side::Long => (quote.ask * (Decimal::ONE + offset)).round_dp(2),
                Side::Short => (quote.bid * (Decimal::ONE - offset)).round_dp(2),
            }
        });
        Ok((qty, limit_price))
    }

    /// Close a position with a market order. Never gated by permits.
    pub async fn submit_exit(
        &mut self,
        symbol: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TradeOutcome, ExecutionError> {
        let position = self
            .positions
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExecutionError::NoPosition(symbol.to_string()))?;

        let reference = match self.quote(symbol).await {
            Ok(q) => Some(q.reference_price()),
            Err(e) => {
                warn!(symbol = %symbol, "Exit proceeding without quote: {}", e);
                None
            }
        };

        info!(symbol = %symbol, reason = %reason, qty = %position.qty, "Submitting exit");
        let fill = self
            .submit_and_confirm(
                symbol,
                OrderSide::closing(position.side),
                position.qty,
                OrderType::Market,
                None,
                now,
            )
            .await?;

        let exit_price = fill
            .price
            .or(reference)
            .unwrap_or(position.entry_price);
        let pnl_usd = (exit_price - position.entry_price) * fill.qty * position.side.sign();

        if fill.qty < position.qty {
            warn!(
                symbol = %symbol,
                "Exit partially filled: {} of {}",
                fill.qty, position.qty
            );
            if let Some(open) = self.positions.get_mut(symbol) {
                open.qty -= fill.qty;
            }
        } else {
            self.positions.remove(symbol);
        }

        Ok(TradeOutcome {
            symbol: symbol.to_string(),
            side: position.side,
            pnl_pct: position.pnl_pct(exit_price),
            pnl_usd,
            hold_duration_secs: (now - position.entry_time).num_seconds().max(0),
            close_reason: reason.to_string(),
            regime_at_entry: position.metadata.regime_at_entry,
            component_breakdown_at_entry: position.metadata.component_breakdown.clone(),
            entry_score: position.entry_score,
            closed_at: now,
        })
    }

    async fn submit_and_confirm(
        &mut self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        order_type: OrderType,
        limit_price: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<Fill, ExecutionError> {
        let broker = self.broker.clone();
        let limiter = self.limiter.clone();
        let intents = &mut self.intents;
        let mut minted: Vec<String> = Vec::new();

        let submitted = self
            .policy
            .run("order", |attempt| {
                let intent = intents.create(symbol, side, qty, attempt, Utc::now());
                minted.push(intent.key.clone());
                let request = OrderRequest {
                    client_order_id: intent.key,
                    symbol: symbol.to_string(),
                    side,
                    qty,
                    order_type,
                    limit_price,
                };
                let broker = broker.clone();
                let limiter = limiter.clone();
                async move {
                    limiter.acquire().await;
                    broker.submit_order(&request).await
                }
            })
            .await;

        let (ack, key) = match submitted {
            Ok(ack) => {
                let key = ack.client_order_id.clone();
                for stale in minted.iter().filter(|k| **k != key) {
                    self.mark_intent(
                        stale,
                        IntentState::Failed {
                            error: "superseded by retry".to_string(),
                        },
                    );
                }
                self.mark_intent(
                    &key,
                    IntentState::Submitted {
                        order_id: ack.id.clone(),
                    },
                );
                (ack, key)
            }
            Err(exhausted) => {
                warn!(
                    symbol = %symbol,
                    "Order abandoned after {} attempts: {}",
                    exhausted.attempts, exhausted.last_error
                );
                for key in &minted {
                    self.mark_intent(
                        key,
                        IntentState::Failed {
                            error: exhausted.last_error.to_string(),
                        },
                    );
                }
                return Err(ExecutionError::Abandoned {
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                });
            }
        };

        let result = self.confirm_fill(ack).await;
        let state = match &result {
            Ok(fill) => IntentState::Filled {
                qty: fill.qty,
                avg_price: fill.price.unwrap_or_default(),
            },
            Err(ExecutionError::Unfilled { .. }) => IntentState::Cancelled,
            Err(e) => IntentState::Failed {
                error: e.to_string(),
            },
        };
        self.mark_intent(&key, state);
        self.intents.cleanup(now);
        result
    }

    fn mark_intent(&mut self, key: &str, state: IntentState) {
        if let Err(e) = self.intents.update_state(key, state) {
            warn!("Intent state update failed: {}", e);
        }
    }

    /// Poll until the order is filled or terminal; cancel whatever is left
    async fn confirm_fill(&self, mut ack: OrderAck) -> Result<Fill, ExecutionError> {
        let interval = Duration::from_millis(self.config.fill_poll_interval_ms);
        let mut polls = 0;
        while !ack.status.is_terminal() && polls < self.config.fill_poll_attempts {
            tokio::time::sleep(interval).await;
            polls += 1;
            self.limiter.acquire().await;
            match self.broker.get_order(&ack.id).await {
                Ok(latest) => ack = latest,
                Err(e) => debug!("Fill poll {} for {} failed: {}", polls, ack.id, e),
            }
        }

        if !ack.status.is_terminal() {
            info!("Order {} still {:?}, cancelling", ack.id, ack.status);
            self.limiter.acquire().await;
            if let Err(e) = self.broker.cancel_order(&ack.id).await {
                warn!("Cancel of {} failed: {}", ack.id, e);
            }
        }

        if ack.filled_qty > Decimal::ZERO {
            Ok(Fill {
                order_id: ack.id,
                qty: ack.filled_qty,
                price: ack.filled_avg_price,
            })
        } else {
            Err(ExecutionError::Unfilled {
                order_id: ack.id,
                status: ack.status,
            })
        }
    }
}
