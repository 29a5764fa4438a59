// Order lifecycle: price tracking, the live trading cycle and the state machine
pub mod cycle;
pub mod price_tracker;
pub mod retry;
pub mod state_machine;

pub use cycle::{CycleHandle, CycleView, TradingCycle};
pub use price_tracker::PriceTracker;
pub use retry::RetryPolicy;
pub use state_machine::{MachineSettings, TradingStateMachine};

use crate::api::GatewayError;
use thiserror::Error;

/// Failures that stop the state machine task
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        source: GatewayError,
    },
    #[error("cannot size order, {currency} balance unavailable: {source}")]
    Sizing {
        currency: String,
        source: GatewayError,
    },
    #[error("invalid market data: {0}")]
    InvalidMarket(String),
}
