//! Brokerage seam: order, position and quote types plus the [`Broker`] trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::retry::Retryable;
use crate::types::{to_f64, Side};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by broker")]
    RateLimited { retry_after: Option<u64> },

    #[error("broker server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("duplicate client order id: {0}")]
    DuplicateOrderId(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl BrokerError {
    /// Timeouts, throttling, 5xx and connection failures are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout(_)
                | BrokerError::RateLimited { .. }
                | BrokerError::Server { .. }
                | BrokerError::Transport(_)
        )
    }
}

impl Retryable for BrokerError {
    fn is_transient(&self) -> bool {
        BrokerError::is_transient(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub equity: Decimal,
    pub buying_power: Decimal,
    pub cash: Decimal,
}

/// A position as reported by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(default)]
    pub last: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::from(2)
    }

    /// Last trade when present, otherwise the mid
    pub fn reference_price(&self) -> Decimal {
        match self.last {
            Some(last) if last > Decimal::ZERO => last,
            _ => self.mid(),
        }
    }

    /// Spread as percent of mid; `None` for a crossed or empty book
    pub fn spread_pct(&self) -> Option<f64> {
        let mid = self.mid();
        if self.bid <= Decimal::ZERO || self.ask < self.bid || mid <= Decimal::ZERO {
            return None;
        }
        Some(to_f64((self.ask - self.bid) / mid * Decimal::from(100)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that opens a position
    pub fn opening(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Side that closes a position
    pub fn closing(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Idempotency key; unique per submission attempt
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Accepted,
    PendingNew,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// Broker's view of an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    #[serde(default)]
    pub filled_avg_price: Option<Decimal>,
}

/// Brokerage operations used by the runner
#[async_trait]
pub trait Broker: Send + Sync {
    async fn account(&self) -> Result<Account, BrokerError>;

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError>;

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError>;

    async fn get_order(&self, order_id: &str) -> Result<OrderAck, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;
}
