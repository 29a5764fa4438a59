// Core modules
pub mod api;
pub mod config;
pub mod execution;
pub mod feed;
pub mod models;
pub mod risk;
pub mod scheduler;
pub mod strategy;

// Re-export commonly used types
pub use api::{ExchangeGateway, GatewayError};
pub use models::*;
pub use strategy::{SignalAccumulator, Trigger};
