//! Order intent tracking and idempotency keys
//!
//! Every submission attempt gets its own client order id of the form
//! `{symbol}-{side}-{qty}-{ts_ms}-{nonce}`. The registry refuses to hand out
//! a key twice, so a retried order can never collide with an earlier attempt.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::broker::OrderSide;

#[derive(Debug, Clone, PartialEq)]
pub enum IntentState {
    Created,
    Submitted { order_id: String },
    Filled { qty: Decimal, avg_price: Decimal },
    Cancelled,
    Failed { error: String },
}

impl IntentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentState::Filled { .. } | IntentState::Cancelled | IntentState::Failed { .. }
        )
    }
}

/// One submission attempt
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub key: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub attempt: u32,
    pub state: IntentState,
    pub created_at: DateTime<Utc>,
}

pub struct IntentRegistry {
    intents: HashMap<String, OrderIntent>,
    issued: HashSet<String>,
    max_age: Duration,
}

impl Default for IntentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IntentRegistry {
    pub fn new() -> Self {
        Self {
            intents: HashMap::new(),
            issued: HashSet::new(),
            max_age: Duration::hours(1),
        }
    }

    fn mint_key(&mut self, symbol: &str, side: OrderSide, qty: Decimal, now: DateTime<Utc>) -> String {
        loop {
            let nonce = uuid::Uuid::new_v4().simple().to_string();
            let key = format!(
                "{}-{}-{}-{}-{}",
                symbol,
                side,
                qty.normalize(),
                now.timestamp_millis(),
                &nonce[..8]
            );
            if self.issued.insert(key.clone()) {
                return key;
            }
            warn!("Idempotency key collision on {}, re-minting", key);
        }
    }

    /// Register a new attempt under a freshly minted key
    pub fn create(
        &mut self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> OrderIntent {
        let key = self.mint_key(symbol, side, qty, now);
        let intent = OrderIntent {
            key: key.clone(),
            symbol: symbol.to_string(),
            side,
            qty,
            attempt,
            state: IntentState::Created,
            created_at: now,
        };
        debug!("Created intent {} (attempt {})", key, attempt);
        self.intents.insert(key, intent.clone());
        intent
    }

    pub fn get(&self, key: &str) -> Option<&OrderIntent> {
        self.intents.get(key)
    }

    pub fn update_state(&mut self, key: &str, state: IntentState) -> anyhow::Result<()> {
        let intent = self
            .intents
            .get_mut(key)
            .ok_or_else(|| anyhow::anyhow!("Intent not found: {}", key))?;
        debug!("Intent {} state: {:?} -> {:?}", key, intent.state, state);
        intent.state = state;
        Ok(())
    }

    /// Non-terminal intent for a symbol, if any
    pub fn find_active(&self, symbol: &str) -> Option<&OrderIntent> {
        self.intents
            .values()
            .find(|i| i.symbol == symbol && !i.state.is_terminal())
    }

    /// Symbols with an order still in flight
    pub fn pending_symbols(&self) -> HashSet<String> {
        self.intents
            .values()
            .filter(|i| !i.state.is_terminal())
            .map(|i| i.symbol.clone())
            .collect()
    }

    /// Keys issued for a symbol, oldest first
    pub fn keys_for(&self, symbol: &str) -> Vec<String> {
        let mut intents: Vec<&OrderIntent> =
            self.intents.values().filter(|i| i.symbol == symbol).collect();
        intents.sort_by_key(|i| (i.created_at, i.attempt));
        intents.into_iter().map(|i| i.key.clone()).collect()
    }

    /// Drop finished intents older than the retention window
    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        let before = self.intents.len();
        let max_age = self.max_age;
        let issued = &mut self.issued;
        self.intents.retain(|key, intent| {
            let keep = !intent.state.is_terminal() || now - intent.created_at < max_age;
            if !keep {
                issued.remove(key);
            }
            keep
        });
        let removed = before - self.intents.len();
        if removed > 0 {
            debug!("Cleaned up {} old intents", removed);
        }
    }
}
