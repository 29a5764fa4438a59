use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Forced exit once price falls a fixed fraction below the last settled price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopLoss {
    pub max_loss_pct: Decimal,
}

impl Default for StopLoss {
    fn default() -> Self {
        Self {
            max_loss_pct: dec!(0.01), // -1% from the last settled price
        }
    }
}

impl StopLoss {
    pub fn new(max_loss_pct: Decimal) -> Self {
        Self { max_loss_pct }
    }

    /// Lowest tolerated price for a position settled at `settled_price`
    pub fn floor(&self, settled_price: Decimal) -> Decimal {
        settled_price - settled_price * self.max_loss_pct
    }

    pub fn is_breached(&self, settled_price: Decimal, current_price: Decimal) -> bool {
        current_price < self.floor(settled_price)
    }
}
