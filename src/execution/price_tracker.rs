use crate::api::ExchangeGateway;
use crate::models::{PriceSnapshot, ReferenceAverage};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Latest trade price proxy and latest reference average
///
/// Cheap to clone; clones share the same state. Writers replace one field
/// at a time and readers always get a consistent copy via [`PriceTracker::current`].
#[derive(Clone, Default)]
pub struct PriceTracker {
    state: Arc<RwLock<PriceSnapshot>>,
}

impl PriceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh the trade price from the order book
    ///
    /// Takes the price of whichever top-of-book side rests the larger size.
    /// Gateway failures and one-sided books leave the price unchanged.
    pub async fn refresh_trade_price<G: ExchangeGateway + ?Sized>(
        &self,
        gateway: &G,
        product_id: &str,
    ) -> Option<Decimal> {
        let book = match gateway.order_book(product_id).await {
            Ok(book) => book,
            Err(e) => {
                tracing::warn!("refresh_trade_price: failed to fetch book: {}", e);
                return None;
            }
        };

        let (Some(ask), Some(bid)) = (book.best_ask(), book.best_bid()) else {
            tracing::debug!("refresh_trade_price: one-sided book for {}", product_id);
            return None;
        };

        let price = if ask.size > bid.size { ask.price } else { bid.price };
        self.state.write().last_trade_price = Some(price);
        Some(price)
    }

    /// Overwrite the reference average unconditionally
    pub fn accept_reference_average(&self, average: ReferenceAverage) {
        self.state.write().reference_average = Some(average);
    }

    pub fn current(&self) -> PriceSnapshot {
        self.state.read().clone()
    }

    #[cfg(test)]
    pub fn set_trade_price(&self, price: Decimal) {
        self.state.write().last_trade_price = Some(price);
    }
}
