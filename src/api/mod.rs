pub mod coinbase;
pub mod paper;

pub use coinbase::{CoinbaseClient, Credentials};
pub use paper::{PaperExchange, PaperOperation};

use crate::models::{BestBidAsk, Order, OrderBook, OrderRequest};
use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("exchange api error (status={status}): {message}")]
    Api { status: u16, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("signature error: {0}")]
    Signature(String),
    #[error("missing required env var {0}")]
    MissingCredentials(&'static str),
    #[error("simulated failure: {0}")]
    Simulated(String),
}

/// Market data and order entry for a single exchange account
///
/// Every call is fallible and may block for as long as the venue takes to answer.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Available (not on hold) balance for a currency
    async fn available_balance(&self, currency: &str) -> Result<Decimal, GatewayError>;

    /// Top of book for a product
    async fn best_bid_ask(&self, product_id: &str) -> Result<BestBidAsk, GatewayError>;

    /// Aggregated order book for a product, best levels first
    async fn order_book(&self, product_id: &str) -> Result<OrderBook, GatewayError>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<Order, GatewayError>;

    async fn order_status(&self, order_id: &str) -> Result<Order, GatewayError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;

    async fn cancel_all_orders(&self, product_id: &str) -> Result<(), GatewayError>;

    async fn open_orders(&self, product_id: &str) -> Result<Vec<Order>, GatewayError>;

    async fn submit_limit_buy(
        &self,
        product_id: &str,
        price: Decimal,
        size: Decimal,
    ) -> Result<Order, GatewayError> {
        self.submit_order(&OrderRequest::limit_buy(product_id, price, size))
            .await
    }

    /// Limit sell, optionally auto-cancelled after `cancel_after` ("min", "hour", "day")
    async fn submit_limit_sell(
        &self,
        product_id: &str,
        price: Decimal,
        size: Decimal,
        cancel_after: Option<&str>,
    ) -> Result<Order, GatewayError> {
        let mut request = OrderRequest::limit_sell(product_id, price, size);
        if let Some(expiry) = cancel_after {
            request = request.with_expiry(expiry);
        }
        self.submit_order(&request).await
    }
}
