use super::{ExchangeGateway, GatewayError};
use crate::models::{BestBidAsk, BookLevel, Order, OrderBook, OrderRequest, OrderStatus, Product, Side};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Gateway operations that can be made to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOperation {
    Balance,
    BestBidAsk,
    OrderBook,
    Submit,
    /// The order is accepted but the caller sees an error, like a timed-out response
    SubmitResponse,
    Status,
    Cancel,
    CancelAll,
    OpenOrders,
}

#[derive(Default)]
struct PaperState {
    balances: HashMap<String, Decimal>,
    book: OrderBook,
    orders: Vec<Order>,
    // Cancelled or expired orders disappear from lookups, like on the real venue
    removed: Vec<Order>,
    // client_oid -> order id, so a resubmitted request returns the original order
    client_oids: HashMap<Uuid, String>,
    failures: HashMap<PaperOperation, u32>,
    auto_match: bool,
    next_id: u64,
}

/// In-memory exchange simulation
///
/// Orders rest until filled by hand ([`PaperExchange::fill_order`]) or, with auto
/// matching enabled, until the book crosses their limit price at status lookup.
/// Market data can be delegated to a live gateway for dry runs.
pub struct PaperExchange {
    product: Product,
    state: Mutex<PaperState>,
    market: Option<Arc<dyn ExchangeGateway>>,
}

impl PaperExchange {
    pub fn new(product: Product) -> Self {
        Self {
            product,
            state: Mutex::new(PaperState::default()),
            market: None,
        }
    }

    /// Read book data from another gateway instead of the local book
    pub fn with_market_data(mut self, market: Arc<dyn ExchangeGateway>) -> Self {
        self.market = Some(market);
        self
    }

    pub fn with_auto_match(self, enabled: bool) -> Self {
        self.state.lock().auto_match = enabled;
        self
    }

    pub fn set_balance(&self, currency: &str, amount: Decimal) {
        self.state.lock().balances.insert(currency.to_string(), amount);
    }

    pub fn balance(&self, currency: &str) -> Decimal {
        self.state
            .lock()
            .balances
            .get(currency)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn set_book(&self, book: OrderBook) {
        self.state.lock().book = book;
    }

    /// Replace the book with a single level on each side
    pub fn set_top_of_book(&self, bid: Decimal, bid_size: Decimal, ask: Decimal, ask_size: Decimal) {
        self.set_book(OrderBook {
            bids: vec![BookLevel { price: bid, size: bid_size }],
            asks: vec![BookLevel { price: ask, size: ask_size }],
        });
    }

    /// Make the next `times` calls of `operation` fail
    pub fn fail_next(&self, operation: PaperOperation, times: u32) {
        self.state.lock().failures.insert(operation, times);
    }

    /// Every order ever accepted, in submission order
    pub fn orders(&self) -> Vec<Order> {
        let state = self.state.lock();
        let mut all: Vec<Order> = state.orders.iter().chain(state.removed.iter()).cloned().collect();
        all.sort_by_key(|o| order_seq(&o.id));
        all
    }

    pub fn open_order_count(&self) -> usize {
        self.state.lock().orders.iter().filter(|o| !o.is_done()).count()
    }

    /// Execute a resting order in full at its limit price
    pub fn fill_order(&self, order_id: &str) -> bool {
        let mut state = self.state.lock();
        fill_locked(&mut state, &self.product, order_id)
    }

    /// Drop a resting order without execution, as a GTT expiry or manual cancel would
    pub fn expire_order(&self, order_id: &str) -> bool {
        let mut state = self.state.lock();
        remove_locked(&mut state, order_id)
    }

    fn take_failure(&self, operation: PaperOperation) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        if let Some(remaining) = state.failures.get_mut(&operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(GatewayError::Simulated(format!("{:?}", operation)));
            }
        }
        Ok(())
    }

    async fn market_book(&self, product_id: &str) -> Result<OrderBook, GatewayError> {
        match &self.market {
            Some(market) => market.order_book(product_id).await,
            None => Ok(self.state.lock().book.clone()),
        }
    }
}

fn order_seq(id: &str) -> u64 {
    id.trim_start_matches("paper-").parse().unwrap_or(u64::MAX)
}

fn fill_locked(state: &mut PaperState, product: &Product, order_id: &str) -> bool {
    let Some(order) = state
        .orders
        .iter_mut()
        .find(|o| o.id == order_id && !o.is_done())
    else {
        return false;
    };

    order.status = OrderStatus::Done;
    order.settled = true;
    order.filled_size = order.size;
    order.done_reason = Some("filled".to_string());

    let notional = order.price * order.size;
    let (size, side) = (order.size, order.side);
    let base = state.balances.entry(product.base.clone()).or_default();
    match side {
        Side::Buy => *base += size,
        Side::Sell => *base -= size,
    }
    let quote = state.balances.entry(product.quote.clone()).or_default();
    match side {
        Side::Buy => *quote -= notional,
        Side::Sell => *quote += notional,
    }

    tracing::debug!(order_id, %side, %size, "Paper fill");
    true
}

fn remove_locked(state: &mut PaperState, order_id: &str) -> bool {
    let Some(index) = state
        .orders
        .iter()
        .position(|o| o.id == order_id && !o.is_done())
    else {
        return false;
    };

    let mut order = state.orders.remove(index);
    order.status = OrderStatus::Done;
    order.settled = true;
    order.done_reason = Some("canceled".to_string());
    state.removed.push(order);
    true
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn available_balance(&self, currency: &str) -> Result<Decimal, GatewayError> {
        self.take_failure(PaperOperation::Balance)?;
        Ok(self.balance(currency))
    }

    async fn best_bid_ask(&self, product_id: &str) -> Result<BestBidAsk, GatewayError> {
        self.take_failure(PaperOperation::BestBidAsk)?;
        if let Some(market) = &self.market {
            return market.best_bid_ask(product_id).await;
        }

        let state = self.state.lock();
        match (state.book.best_bid(), state.book.best_ask()) {
            (Some(bid), Some(ask)) => Ok(BestBidAsk {
                bid: bid.price,
                ask: ask.price,
            }),
            _ => Err(GatewayError::InvalidResponse("empty paper book".to_string())),
        }
    }

    async fn order_book(&self, product_id: &str) -> Result<OrderBook, GatewayError> {
        self.take_failure(PaperOperation::OrderBook)?;
        self.market_book(product_id).await
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<Order, GatewayError> {
        self.take_failure(PaperOperation::Submit)?;

        if request.price <= Decimal::ZERO || request.size <= Decimal::ZERO {
            return Err(GatewayError::Api {
                status: 400,
                message: "price and size must be positive".to_string(),
            });
        }

        let mut state = self.state.lock();
        if let Some(id) = state.client_oids.get(&request.client_oid) {
            let id = id.clone();
            if let Some(existing) = state.orders.iter().chain(state.removed.iter()).find(|o| o.id == id) {
                tracing::debug!(order_id = %existing.id, "Paper order resubmitted, returning original");
                return Ok(existing.clone());
            }
        }

        let (currency, needed) = match request.side {
            Side::Buy => (&self.product.quote, request.price * request.size),
            Side::Sell => (&self.product.base, request.size),
        };
        let available = state.balances.get(currency).copied().unwrap_or(Decimal::ZERO);
        if available < needed {
            return Err(GatewayError::Api {
                status: 400,
                message: "Insufficient funds".to_string(),
            });
        }

        state.next_id += 1;
        let order = Order {
            id: format!("paper-{}", state.next_id),
            product_id: request.product_id.clone(),
            side: request.side,
            price: request.price,
            size: request.size,
            filled_size: Decimal::ZERO,
            status: OrderStatus::Open,
            settled: false,
            done_reason: None,
            created_at: Some(Utc::now()),
        };
        state.orders.push(order.clone());
        state.client_oids.insert(request.client_oid, order.id.clone());
        drop(state);

        tracing::info!(
            order_id = %order.id,
            side = %order.side,
            price = %order.price,
            size = %order.size,
            "Paper order accepted"
        );
        self.take_failure(PaperOperation::SubmitResponse)?;
        Ok(order)
    }

    async fn order_status(&self, order_id: &str) -> Result<Order, GatewayError> {
        self.take_failure(PaperOperation::Status)?;

        let auto_match = self.state.lock().auto_match;
        let top = if auto_match {
            let book = self.market_book(&self.product.id).await?;
            Some((book.best_bid().map(|l| l.price), book.best_ask().map(|l| l.price)))
        } else {
            None
        };

        let mut state = self.state.lock();
        if let Some((bid, ask)) = top {
            let crosses = state
                .orders
                .iter()
                .find(|o| o.id == order_id && !o.is_done())
                .map(|o| match o.side {
                    Side::Buy => ask.is_some_and(|ask| ask <= o.price),
                    Side::Sell => bid.is_some_and(|bid| bid >= o.price),
                })
                .unwrap_or(false);
            if crosses {
                fill_locked(&mut state, &self.product, order_id);
            }
        }

        state
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("order {}", order_id)))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        self.take_failure(PaperOperation::Cancel)?;
        let mut state = self.state.lock();
        if remove_locked(&mut state, order_id) {
            Ok(())
        } else {
            Err(GatewayError::NotFound(format!("order {}", order_id)))
        }
    }

    async fn cancel_all_orders(&self, product_id: &str) -> Result<(), GatewayError> {
        self.take_failure(PaperOperation::CancelAll)?;
        let mut state = self.state.lock();
        let open: Vec<String> = state
            .orders
            .iter()
            .filter(|o| o.product_id == product_id && !o.is_done())
            .map(|o| o.id.clone())
            .collect();
        for id in &open {
            remove_locked(&mut state, id);
        }
        Ok(())
    }

    async fn open_orders(&self, product_id: &str) -> Result<Vec<Order>, GatewayError> {
        self.take_failure(PaperOperation::OpenOrders)?;
        Ok(self
            .state
            .lock()
            .orders
            .iter()
            .filter(|o| o.product_id == product_id && !o.is_done())
            .cloned()
            .collect())
    }
}
