//! REST brokerage client (Alpaca-style trading and market-data endpoints)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::broker::{
    Account, Broker, BrokerError, BrokerPosition, OrderAck, OrderRequest, OrderSide, OrderStatus,
    OrderType, Quote,
};
use crate::config::{BrokerConfig, BrokerCredentials};
use crate::types::Side;

pub struct HttpBroker {
    client: Client,
    base_url: String,
    data_url: String,
    credentials: BrokerCredentials,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    equity: Decimal,
    buying_power: Decimal,
    cash: Decimal,
}

#[derive(Debug, Deserialize)]
struct PositionResponse {
    symbol: String,
    qty: Decimal,
    #[serde(default)]
    side: Option<String>,
    avg_entry_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct LatestQuoteResponse {
    quote: QuoteBody,
}

#[derive(Debug, Deserialize)]
struct QuoteBody {
    #[serde(rename = "bp")]
    bid: Decimal,
    #[serde(rename = "ap")]
    ask: Decimal,
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct OrderBody<'a> {
    symbol: &'a str,
    qty: Decimal,
    side: OrderSide,
    #[serde(rename = "type")]
    order_type: OrderType,
    time_in_force: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<Decimal>,
    client_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    client_order_id: String,
    symbol: String,
    side: OrderSide,
    status: String,
    qty: Decimal,
    #[serde(default)]
    filled_qty: Option<Decimal>,
    #[serde(default)]
    filled_avg_price: Option<Decimal>,
}

impl From<OrderResponse> for OrderAck {
    fn from(resp: OrderResponse) -> Self {
        OrderAck {
            id: resp.id,
            client_order_id: resp.client_order_id,
            symbol: resp.symbol,
            side: resp.side,
            status: parse_status(&resp.status),
            qty: resp.qty,
            filled_qty: resp.filled_qty.unwrap_or(Decimal::ZERO),
            filled_avg_price: resp.filled_avg_price,
        }
    }
}

/// Broker-specific intermediate states collapse onto the working statuses
fn parse_status(status: &str) -> OrderStatus {
    match status {
        "new" => OrderStatus::New,
        "accepted" | "accepted_for_bidding" | "held" | "calculated" => OrderStatus::Accepted,
        "pending_new" => OrderStatus::PendingNew,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "canceled" | "done_for_day" | "replaced" => OrderStatus::Canceled,
        "rejected" | "suspended" | "stopped" => OrderStatus::Rejected,
        "expired" => OrderStatus::Expired,
        _ => OrderStatus::New,
    }
}

fn transport_error(e: reqwest::Error) -> BrokerError {
    if e.is_timeout() {
        BrokerError::Timeout(e.to_string())
    } else if e.is_decode() {
        BrokerError::InvalidResponse(e.to_string())
    } else {
        BrokerError::Transport(e.to_string())
    }
}

impl HttpBroker {
    pub fn new(config: &BrokerConfig, credentials: BrokerCredentials) -> Result<Self, BrokerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| BrokerError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            data_url: config.data_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("APCA-API-KEY-ID", &self.credentials.api_key)
            .header("APCA-API-SECRET-KEY", &self.credentials.api_secret)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, BrokerError> {
        let response = self.authed(req).send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        debug!("Broker returned {}: {}", status, body);

        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => BrokerError::RateLimited { retry_after },
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BrokerError::Timeout(body),
            StatusCode::UNAUTHORIZED => BrokerError::Unauthorized(body),
            StatusCode::NOT_FOUND => BrokerError::NotFound(body),
            s if s.is_server_error() => BrokerError::Server {
                status: s.as_u16(),
                message: body,
            },
            _ if body.contains("client_order_id") => BrokerError::DuplicateOrderId(body),
            StatusCode::FORBIDDEN => BrokerError::Rejected(body),
            _ => BrokerError::Rejected(format!("{}: {}", status, body)),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, BrokerError> {
        let response = self.send(self.client.get(&url)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| BrokerError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn account(&self) -> Result<Account, BrokerError> {
        let resp: AccountResponse = self
            .get_json(format!("{}/v2/account", self.base_url))
            .await?;
        Ok(Account {
            equity: resp.equity,
            buying_power: resp.buying_power,
            cash: resp.cash,
        })
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let resp: Vec<PositionResponse> = self
            .get_json(format!("{}/v2/positions", self.base_url))
            .await?;
        Ok(resp
            .into_iter()
            .map(|p| {
                let side = match p.side.as_deref() {
                    Some("short") => Side::Short,
                    Some("long") => Side::Long,
                    _ if p.qty < Decimal::ZERO => Side::Short,
                    _ => Side::Long,
                };
                BrokerPosition {
                    symbol: p.symbol,
                    side,
                    qty: p.qty.abs(),
                    avg_entry_price: p.avg_entry_price,
                }
            })
            .collect())
    }

    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let resp: LatestQuoteResponse = self
            .get_json(format!("{}/v2/stocks/{}/quotes/latest", self.data_url, symbol))
            .await?;
        Ok(Quote {
            symbol: symbol.to_string(),
            bid: resp.quote.bid,
            ask: resp.quote.ask,
            last: None,
            timestamp: resp.quote.timestamp,
        })
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError> {
        let body = OrderBody {
            symbol: &order.symbol,
            qty: order.qty,
            side: order.side,
            order_type: order.order_type,
            time_in_force: "day",
            limit_price: order.limit_price,
            client_order_id: &order.client_order_id,
        };
        let url = format!("{}/v2/orders", self.base_url);
        let response = self.send(self.client.post(&url).json(&body)).await?;
        let resp: OrderResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(e.to_string()))?;
        Ok(resp.into())
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderAck, BrokerError> {
        let resp: OrderResponse = self
            .get_json(format!("{}/v2/orders/{}", self.base_url, order_id))
            .await?;
        Ok(resp.into())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn broker(server: &MockServer) -> HttpBroker {
        let config = BrokerConfig {
            base_url: server.uri(),
            data_url: server.uri(),
            ..BrokerConfig::default()
        };
        HttpBroker::new(
            &config,
            BrokerCredentials {
                api_key: "key".to_string(),
                api_secret: "secret".to_string(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_account_parses_string_decimals() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/account"))
            .and(header("APCA-API-KEY-ID", "key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "equity": "50000.25",
                "buying_power": "100000",
                "cash": "20000.00"
            })))
            .mount(&server)
            .await;

        let account = broker(&server).account().await.unwrap();
        assert_eq!(account.equity, Decimal::new(5000025, 2));
        assert_eq!(account.buying_power, Decimal::from(100_000));
    }

    #[tokio::test]
    async fn test_positions_normalize_short_side() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/positions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "symbol": "AAPL", "qty": "10", "side": "long", "avg_entry_price": "150.5" },
                { "symbol": "TSLA", "qty": "-5", "avg_entry_price": "240" }
            ])))
            .mount(&server)
            .await;

        let positions = broker(&server).positions().await.unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[1].side, Side::Short);
        assert_eq!(positions[1].qty, Decimal::from(5));
    }

    #[tokio::test]
    async fn test_submit_order_sends_client_order_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/orders"))
            .and(body_partial_json(json!({
                "symbol": "NVDA",
                "side": "buy",
                "type": "limit",
                "client_order_id": "NVDA-buy-5-1700000000000-abc"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ord-1",
                "client_order_id": "NVDA-buy-5-1700000000000-abc",
                "symbol": "NVDA",
                "side": "buy",
                "status": "accepted",
                "qty": "5",
                "filled_qty": "0",
                "filled_avg_price": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ack = broker(&server)
            .submit_order(&OrderRequest {
                client_order_id: "NVDA-buy-5-1700000000000-abc".to_string(),
                symbol: "NVDA".to_string(),
                side: OrderSide::Buy,
                qty: Decimal::from(5),
                order_type: OrderType::Limit,
                limit_price: Some(Decimal::new(91250, 2)),
            })
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Accepted);
        assert_eq!(ack.filled_qty, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_error_statuses_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/account"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/positions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/orders"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_string("{\"message\":\"client_order_id must be unique\"}"),
            )
            .mount(&server)
            .await;

        let b = broker(&server);
        let err = b.account().await.unwrap_err();
        assert!(matches!(err, BrokerError::Server { status: 503, .. }));
        assert!(err.is_transient());

        let err = b.positions().await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::RateLimited {
                retry_after: Some(3)
            }
        ));

        let err = b
            .submit_order(&OrderRequest {
                client_order_id: "dup".to_string(),
                symbol: "AAPL".to_string(),
                side: OrderSide::Buy,
                qty: Decimal::ONE,
                order_type: OrderType::Market,
                limit_price: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateOrderId(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_latest_quote() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/stocks/SPY/quotes/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "symbol": "SPY",
                "quote": { "bp": 500.1, "ap": 500.3, "t": "2026-03-04T15:00:00Z" }
            })))
            .mount(&server)
            .await;

        let quote = broker(&server).quote("SPY").await.unwrap();
        assert_eq!(quote.mid(), Decimal::new(5002, 1));
    }
}
