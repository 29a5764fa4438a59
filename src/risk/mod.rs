// Risk management module
pub mod stop_loss;

pub use stop_loss::StopLoss;
