use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Decimal places the exchange accepts for quote prices
pub const PRICE_DECIMALS: u32 = 2;
/// Decimal places the exchange accepts for base sizes
pub const SIZE_DECIMALS: u32 = 8;

/// Truncate a price toward zero to 2 decimal places (never rounds up)
pub fn truncate_price(price: Decimal) -> Decimal {
    price.round_dp_with_strategy(PRICE_DECIMALS, RoundingStrategy::ToZero)
}

/// Truncate a size toward zero to 8 decimal places (never rounds up)
pub fn truncate_size(size: Decimal) -> Decimal {
    size.round_dp_with_strategy(SIZE_DECIMALS, RoundingStrategy::ToZero)
}

/// Lifecycle phase of the trading machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Waiting,
    Entering,
    Entered,
    /// Declared wind-down phase. No transition targets it and it has no handler.
    Exiting,
    Exit,
    Exited,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Waiting => "Waiting",
            Phase::Entering => "Entering",
            Phase::Entered => "Entered",
            Phase::Exiting => "Exiting",
            Phase::Exit => "Exit",
            Phase::Exited => "Exited",
        };
        f.write_str(name)
    }
}

/// A trading pair such as `BTC-USD`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub id: String,
    pub base: String,  // what we buy and hold, e.g. BTC
    pub quote: String, // what we pay with, e.g. USD
}

impl FromStr for Product {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() => Ok(Self {
                id: s.to_string(),
                base: base.to_string(),
                quote: quote.to_string(),
            }),
            _ => Err(format!("invalid product id '{}', expected BASE-QUOTE", s)),
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("buy"),
            Side::Sell => f.write_str("sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till cancelled
    GTC,
    /// Good till time, paired with `cancel_after`
    GTT,
    /// Immediate or cancel
    IOC,
    /// Fill or kill
    FOK,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Active,
    Done,
    #[serde(other)]
    Unknown,
}

/// Order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub product_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    #[serde(default)]
    pub filled_size: Decimal,
    pub status: OrderStatus,
    #[serde(default)]
    pub settled: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn is_done(&self) -> bool {
        self.status == OrderStatus::Done
    }

    /// Settled with an actual execution (an expired or cancelled order also settles)
    pub fn is_filled(&self) -> bool {
        self.settled && self.done_reason.as_deref() != Some("canceled")
    }
}

/// Limit order about to be submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_oid: Uuid,
    pub product_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub time_in_force: Option<TimeInForce>,
    pub cancel_after: Option<String>, // "min", "hour" or "day" for GTT
}

impl OrderRequest {
    pub fn limit_buy(product_id: &str, price: Decimal, size: Decimal) -> Self {
        Self::limit(product_id, Side::Buy, price, size)
    }

    pub fn limit_sell(product_id: &str, price: Decimal, size: Decimal) -> Self {
        Self::limit(product_id, Side::Sell, price, size)
    }

    fn limit(product_id: &str, side: Side, price: Decimal, size: Decimal) -> Self {
        Self {
            client_oid: Uuid::new_v4(),
            product_id: product_id.to_string(),
            side,
            price,
            size,
            time_in_force: None,
            cancel_after: None,
        }
    }

    /// Auto-cancel the order if it is still resting after `cancel_after`
    pub fn with_expiry(mut self, cancel_after: &str) -> Self {
        self.time_in_force = Some(TimeInForce::GTT);
        self.cancel_after = Some(cancel_after.to_string());
        self
    }
}

/// One price level of the order book
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestBidAsk {
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Smoothed reference price delivered by the stream ingester
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceAverage {
    pub product_id: String,
    pub price: Decimal,
}

/// Read-only view of the tracked prices
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceSnapshot {
    pub last_trade_price: Option<Decimal>,
    pub reference_average: Option<ReferenceAverage>,
}

impl PriceSnapshot {
    pub fn reference_price(&self) -> Option<Decimal> {
        self.reference_average.as_ref().map(|r| r.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_truncate_price_never_rounds_up() {
        assert_eq!(truncate_price(dec!(101.2399)), dec!(101.23));
        assert_eq!(truncate_price(dec!(0.29)), dec!(0.29));
        assert_eq!(truncate_price(dec!(100.999)), dec!(100.99));
    }

    #[test]
    fn test_truncate_size_never_rounds_up() {
        assert_eq!(truncate_size(dec!(0.123456789)), dec!(0.12345678));
        assert_eq!(truncate_size(dec!(1000) / dec!(101)), dec!(9.90099009));
    }

    #[test]
    fn test_product_parsing() {
        let product: Product = "BTC-USD".parse().unwrap();
        assert_eq!(product.base, "BTC");
        assert_eq!(product.quote, "USD");
        assert_eq!(product.to_string(), "BTC-USD");

        assert!("BTCUSD".parse::<Product>().is_err());
        assert!("-USD".parse::<Product>().is_err());
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::Waiting.to_string(), "Waiting");
        assert_eq!(Phase::Exiting.to_string(), "Exiting");
        assert_eq!(Phase::Exit.to_string(), "Exit");
    }

    #[test]
    fn test_cancelled_order_is_not_filled() {
        let order = Order {
            id: "o-1".to_string(),
            product_id: "BTC-USD".to_string(),
            side: Side::Sell,
            price: dec!(100),
            size: dec!(1),
            filled_size: Decimal::ZERO,
            status: OrderStatus::Done,
            settled: true,
            done_reason: Some("canceled".to_string()),
            created_at: None,
        };

        assert!(order.is_done());
        assert!(!order.is_filled());
    }

    #[test]
    fn test_expiring_sell_request() {
        let request = OrderRequest::limit_sell("BTC-USD", dec!(100.5), dec!(0.5)).with_expiry("min");

        assert_eq!(request.side, Side::Sell);
        assert_eq!(request.time_in_force, Some(TimeInForce::GTT));
        assert_eq!(request.cancel_after.as_deref(), Some("min"));
    }
}
