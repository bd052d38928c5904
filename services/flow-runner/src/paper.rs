//! Paper broker: in-memory fills against signal-cache prices
//!
//! Quotes are synthesized around the provider's last price with a fixed
//! spread. Marketable orders fill immediately at the touch plus random
//! slippage; resting limits stay accepted until cancelled.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::broker::{
    Account, Broker, BrokerError, BrokerPosition, OrderAck, OrderRequest, OrderSide, OrderStatus,
    OrderType, Quote,
};
use crate::cache::SignalCache;
use crate::config::BrokerConfig;
use crate::types::{from_f64, Side};

const BPS: i64 = 10_000;

#[derive(Debug, Default)]
struct Book {
    cash: Decimal,
    /// Signed quantity (negative = short) and average entry price
    holdings: BTreeMap<String, (Decimal, Decimal)>,
    orders: HashMap<String, OrderAck>,
    client_ids: HashSet<String>,
    next_id: u64,
}

impl Book {
    fn apply_fill(&mut self, symbol: &str, side: OrderSide, qty: Decimal, price: Decimal) {
        let delta = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        self.cash -= delta * price;

        let (held, avg) = self
            .holdings
            .get(symbol)
            .copied()
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));
        let next = held + delta;

        let next_avg = if held.is_zero() || (held.is_sign_positive() != next.is_sign_positive()) {
            price
        } else if held.is_sign_positive() == delta.is_sign_positive() {
            // adding to the position
            (held.abs() * avg + qty * price) / next.abs()
        } else {
            avg
        };

        if next.is_zero() {
            self.holdings.remove(symbol);
        } else {
            self.holdings.insert(symbol.to_string(), (next, next_avg));
        }
    }
}

pub struct PaperBroker {
    cache: Arc<dyn SignalCache>,
    book: Mutex<Book>,
    spread_bps: Decimal,
    slippage_bps: f64,
}

impl PaperBroker {
    pub fn new(cache: Arc<dyn SignalCache>, config: &BrokerConfig) -> Self {
        info!(
            "Paper broker starting with {} cash, spread {} bps",
            config.paper_starting_cash, config.paper_spread_bps
        );
        Self {
            cache,
            book: Mutex::new(Book {
                cash: config.paper_starting_cash,
                ..Book::default()
            }),
            spread_bps: Decimal::from(config.paper_spread_bps),
            slippage_bps: f64::from(config.paper_slippage_bps),
        }
    }

    fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.cache
            .snapshot(symbol)
            .and_then(|s| s.last_price)
            .filter(|p| p.is_finite() && *p > 0.0)
            .map(from_f64)
    }

    fn slippage(&self) -> Decimal {
        if self.slippage_bps <= 0.0 {
            return Decimal::ZERO;
        }
        let bps = rand::thread_rng().gen_range(0.0..self.slippage_bps);
        from_f64(bps) / Decimal::from(BPS)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn account(&self) -> Result<Account, BrokerError> {
        let book = self.lock();
        let market_value: Decimal = book
            .holdings
            .iter()
            .map(|(symbol, (qty, avg))| *qty * self.last_price(symbol).unwrap_or(*avg))
            .sum();
        let equity = book.cash + market_value;
        Ok(Account {
            equity,
            buying_power: book.cash.max(Decimal::ZERO),
            cash: book.cash,
        })
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let book = self.lock();
        Ok(book
            .holdings
            .iter()
            .map(|(symbol, (qty, avg))| BrokerPosition {
                symbol: symbol.clone(),
                side: if qty.is_sign_negative() {
                    Side::Short
                } else {
                    Side::Long
                },
                qty: qty.abs(),
                avg_entry_price: *avg,
            })
            .collect())
    }

    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let last = self
            .last_price(symbol)
            .ok_or_else(|| BrokerError::NotFound(format!("no price for {}", symbol)))?;
        let half_spread = last * self.spread_bps / Decimal::from(2 * BPS);
        Ok(Quote {
            symbol: symbol.to_string(),
            bid: last - half_spread,
            ask: last + half_spread,
            last: Some(last),
            timestamp: Utc::now(),
        })
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError> {
        if order.qty <= Decimal::ZERO {
            return Err(BrokerError::Rejected(format!(
                "qty must be positive, got {}",
                order.qty
            )));
        }
        let quote = self.quote(&order.symbol).await?;
        let slip = self.slippage();
        let fill_price = match order.side {
            OrderSide::Buy => quote.ask * (Decimal::ONE + slip),
            OrderSide::Sell => quote.bid * (Decimal::ONE - slip),
        };
        let marketable = match (order.order_type, order.limit_price, order.side) {
            (OrderType::Market, _, _) => true,
            (OrderType::Limit, Some(limit), OrderSide::Buy) => fill_price <= limit,
            (OrderType::Limit, Some(limit), OrderSide::Sell) => fill_price >= limit,
            (OrderType::Limit, None, _) => {
                return Err(BrokerError::Rejected("limit order without price".to_string()))
            }
        };

        let mut book = self.lock();
        if !book.client_ids.insert(order.client_order_id.clone()) {
            return Err(BrokerError::DuplicateOrderId(order.client_order_id.clone()));
        }
        if order.side == OrderSide::Buy && marketable && order.qty * fill_price > book.cash {
            let held = book
                .holdings
                .get(&order.symbol)
                .map(|(q, _)| *q)
                .unwrap_or(Decimal::ZERO);
            // covering a short is always allowed
            if held >= Decimal::ZERO {
                return Err(BrokerError::Rejected("insufficient buying power".to_string()));
            }
        }

        book.next_id += 1;
        let id = format!("paper-{}", book.next_id);
        let mut ack = OrderAck {
            id: id.clone(),
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            status: OrderStatus::Accepted,
            qty: order.qty,
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
        };
        if marketable {
            book.apply_fill(&order.symbol, order.side, order.qty, fill_price);
            ack.status = OrderStatus::Filled;
            ack.filled_qty = order.qty;
            ack.filled_avg_price = Some(fill_price.round_dp(4));
            debug!(
                "Paper fill {} {} {} @ {}",
                order.side,
                order.qty,
                order.symbol,
                fill_price.round_dp(4)
            );
        }
        book.orders.insert(id, ack.clone());
        Ok(ack)
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderAck, BrokerError> {
        self.lock()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(order_id.to_string()))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut book = self.lock();
        let order = book
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::NotFound(order_id.to_string()))?;
        if !order.status.is_terminal() {
            order.status = OrderStatus::Canceled;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemorySignalCache;
    use crate::types::SignalSnapshot;

    fn paper(price: f64) -> (Arc<MemorySignalCache>, PaperBroker) {
        let cache = Arc::new(MemorySignalCache::new());
        cache.insert(SignalSnapshot::new("AAPL", Utc::now()).with_price(price));
        let config = BrokerConfig {
            paper_starting_cash: Decimal::from(10_000),
            paper_spread_bps: 10,
            paper_slippage_bps: 0,
            ..BrokerConfig::default()
        };
        let broker = PaperBroker::new(cache.clone(), &config);
        (cache, broker)
    }

    fn order(id: &str, side: OrderSide, qty: i64) -> OrderRequest {
        OrderRequest {
            client_order_id: id.to_string(),
            symbol: "AAPL".to_string(),
            side,
            qty: Decimal::from(qty),
            order_type: OrderType::Market,
            limit_price: None,
        }
    }

    #[tokio::test]
    async fn test_quote_spread_around_last() {
        let (_cache, broker) = paper(100.0);
        let quote = broker.quote("AAPL").await.unwrap();
        assert_eq!(quote.bid, Decimal::new(9995, 2));
        assert_eq!(quote.ask, Decimal::new(10005, 2));
        assert!(matches!(
            broker.quote("MSFT").await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_round_trip_updates_cash_and_positions() {
        let (cache, broker) = paper(100.0);
        let ack = broker.submit_order(&order("k1", OrderSide::Buy, 10)).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.filled_avg_price, Some(Decimal::new(10005, 2)));

        let positions = broker.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, Side::Long);

        cache.insert(SignalSnapshot::new("AAPL", Utc::now()).with_price(110.0));
        let account = broker.account().await.unwrap();
        assert_eq!(account.equity, Decimal::from(10_000) - Decimal::new(10005, 1) + Decimal::from(1_100));

        broker.submit_order(&order("k2", OrderSide::Sell, 10)).await.unwrap();
        assert!(broker.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_client_order_id_rejected() {
        let (_cache, broker) = paper(100.0);
        broker.submit_order(&order("same", OrderSide::Buy, 1)).await.unwrap();
        let err = broker
            .submit_order(&order("same", OrderSide::Buy, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateOrderId(_)));
    }

    #[tokio::test]
    async fn test_resting_limit_can_be_cancelled() {
        let (_cache, broker) = paper(100.0);
        let mut req = order("lim", OrderSide::Buy, 5);
        req.order_type = OrderType::Limit;
        req.limit_price = Some(Decimal::from(95));

        let ack = broker.submit_order(&req).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Accepted);
        broker.cancel_order(&ack.id).await.unwrap();
        assert_eq!(
            broker.get_order(&ack.id).await.unwrap().status,
            OrderStatus::Canceled
        );
        assert!(broker.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_short_then_cover() {
        let (_cache, broker) = paper(50.0);
        broker.submit_order(&order("s1", OrderSide::Sell, 20)).await.unwrap();
        let positions = broker.positions().await.unwrap();
        assert_eq!(positions[0].side, Side::Short);
        assert_eq!(positions[0].qty, Decimal::from(20));

        broker.submit_order(&order("s2", OrderSide::Buy, 20)).await.unwrap();
        assert!(broker.positions().await.unwrap().is_empty());
    }
}
