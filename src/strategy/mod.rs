// Momentum signal engine
pub mod signal_accumulator;

pub use signal_accumulator::{SignalAccumulator, Trigger};
