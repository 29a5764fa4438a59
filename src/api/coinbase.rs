use super::{ExchangeGateway, GatewayError};
use crate::models::{BestBidAsk, BookLevel, Order, OrderBook, OrderRequest, Side, TimeInForce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, Response, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use uuid::Uuid;

// Coinbase Exchange REST API (formerly GDAX)
// Docs: https://docs.cdp.coinbase.com/exchange/reference
pub const COINBASE_API_BASE: &str = "https://api.exchange.coinbase.com";
const USER_AGENT: &str = concat!("trendbot/", env!("CARGO_PKG_VERSION"));

type HmacSha256 = Hmac<Sha256>;

type CoinbaseRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// API key triple for signed requests
#[derive(Clone)]
pub struct Credentials {
    pub key: String,
    pub secret: String, // base64 encoded, as issued by the exchange
    pub passphrase: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self, GatewayError> {
        let read = |name: &'static str| {
            std::env::var(name).map_err(|_| GatewayError::MissingCredentials(name))
        };
        Ok(Self {
            key: read("COINBASE_API_KEY")?,
            secret: read("COINBASE_API_SECRET")?,
            passphrase: read("COINBASE_API_PASSPHRASE")?,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Client for the Coinbase Exchange REST API
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct CoinbaseClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    rate_limiter: Arc<CoinbaseRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    currency: String,
    available: Decimal,
}

#[derive(Debug, Deserialize)]
struct BookResponse {
    bids: Vec<(Decimal, Decimal, serde_json::Value)>,
    asks: Vec<(Decimal, Decimal, serde_json::Value)>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct NewOrderBody<'a> {
    client_oid: Uuid,
    #[serde(rename = "type")]
    order_type: &'static str,
    side: Side,
    product_id: &'a str,
    price: Decimal,
    size: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_in_force: Option<TimeInForce>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancel_after: Option<&'a str>,
}

impl CoinbaseClient {
    /// Create an authenticated client
    ///
    /// # Arguments
    /// * `base_url` - REST endpoint, e.g. [`COINBASE_API_BASE`]
    /// * `credentials` - API key used to sign private requests
    /// * `requests_per_second` - Client-side request budget
    pub fn new(
        base_url: &str,
        credentials: Credentials,
        requests_per_second: u32,
    ) -> Result<Self, GatewayError> {
        Self::build(base_url, Some(credentials), requests_per_second)
    }

    /// Client limited to public market data endpoints
    pub fn public(base_url: &str, requests_per_second: u32) -> Result<Self, GatewayError> {
        Self::build(base_url, None, requests_per_second)
    }

    fn build(
        base_url: &str,
        credentials: Option<Credentials>,
        requests_per_second: u32,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            rate_limiter,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
        signed: bool,
    ) -> Result<Response, GatewayError> {
        self.rate_limiter.until_ready().await;

        let body = body.unwrap_or_default();
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method.clone(), &url);

        if signed {
            let credentials = self
                .credentials
                .as_ref()
                .ok_or(GatewayError::MissingCredentials("COINBASE_API_KEY"))?;
            let timestamp = Utc::now().timestamp().to_string();
            let signature =
                sign_request(&credentials.secret, &timestamp, method.as_str(), path, &body)?;
            request = request
                .header("CB-ACCESS-KEY", &credentials.key)
                .header("CB-ACCESS-SIGN", signature)
                .header("CB-ACCESS-TIMESTAMP", timestamp)
                .header("CB-ACCESS-PASSPHRASE", &credentials.passphrase);
        }

        if !body.is_empty() {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        tracing::debug!(%method, path, "Coinbase request");
        let response = request.send().await?;
        check_status(path, response).await
    }

    async fn fetch_book(&self, product_id: &str, level: u8) -> Result<OrderBook, GatewayError> {
        let path = format!("/products/{}/book?level={}", product_id, level);
        let response: BookResponse = self.send(Method::GET, &path, None, false).await?.json().await?;

        let to_levels = |raw: Vec<(Decimal, Decimal, serde_json::Value)>| {
            raw.into_iter()
                .map(|(price, size, _)| BookLevel { price, size })
                .collect::<Vec<_>>()
        };

        Ok(OrderBook {
            bids: to_levels(response.bids),
            asks: to_levels(response.asks),
        })
    }
}

async fn check_status(path: &str, response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(GatewayError::NotFound(path.to_string()));
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|e| e.message)
        .unwrap_or(text);

    Err(GatewayError::Api {
        status: status.as_u16(),
        message,
    })
}

/// base64(HMAC-SHA256(base64decode(secret), timestamp + method + path + body))
pub fn sign_request(
    secret: &str,
    timestamp: &str,
    method: &str,
    path: &str,
    body: &str,
) -> Result<String, GatewayError> {
    let key = BASE64
        .decode(secret)
        .map_err(|e| GatewayError::Signature(e.to_string()))?;
    let mut mac =
        HmacSha256::new_from_slice(&key).map_err(|e| GatewayError::Signature(e.to_string()))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl ExchangeGateway for CoinbaseClient {
    async fn available_balance(&self, currency: &str) -> Result<Decimal, GatewayError> {
        let accounts: Vec<AccountEntry> = self
            .send(Method::GET, "/accounts", None, true)
            .await?
            .json()
            .await?;

        accounts
            .into_iter()
            .find(|a| a.currency.eq_ignore_ascii_case(currency))
            .map(|a| a.available)
            .ok_or_else(|| GatewayError::NotFound(format!("account for {}", currency)))
    }

    async fn best_bid_ask(&self, product_id: &str) -> Result<BestBidAsk, GatewayError> {
        let book = self.fetch_book(product_id, 1).await?;
        match (book.best_bid(), book.best_ask()) {
            (Some(bid), Some(ask)) => Ok(BestBidAsk {
                bid: bid.price,
                ask: ask.price,
            }),
            _ => Err(GatewayError::InvalidResponse(format!(
                "empty top of book for {}",
                product_id
            ))),
        }
    }

    async fn order_book(&self, product_id: &str) -> Result<OrderBook, GatewayError> {
        self.fetch_book(product_id, 2).await
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<Order, GatewayError> {
        let body = NewOrderBody {
            client_oid: request.client_oid,
            order_type: "limit",
            side: request.side,
            product_id: &request.product_id,
            price: request.price,
            size: request.size,
            time_in_force: request.time_in_force,
            cancel_after: request.cancel_after.as_deref(),
        };
        let body = serde_json::to_string(&body)?;

        let order: Order = self
            .send(Method::POST, "/orders", Some(body), true)
            .await?
            .json()
            .await?;

        tracing::info!(
            order_id = %order.id,
            side = %order.side,
            price = %order.price,
            size = %order.size,
            "Order accepted"
        );
        Ok(order)
    }

    async fn order_status(&self, order_id: &str) -> Result<Order, GatewayError> {
        let path = format!("/orders/{}", order_id);
        Ok(self.send(Method::GET, &path, None, true).await?.json().await?)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let path = format!("/orders/{}", order_id);
        self.send(Method::DELETE, &path, None, true).await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, product_id: &str) -> Result<(), GatewayError> {
        let path = format!("/orders?product_id={}", product_id);
        let cancelled: Vec<String> = self
            .send(Method::DELETE, &path, None, true)
            .await?
            .json()
            .await?;
        tracing::info!(count = cancelled.len(), "Cancelled open orders");
        Ok(())
    }

    async fn open_orders(&self, product_id: &str) -> Result<Vec<Order>, GatewayError> {
        let path = format!("/orders?status=open&product_id={}", product_id);
        Ok(self.send(Method::GET, &path, None, true).await?.json().await?)
    }
}
