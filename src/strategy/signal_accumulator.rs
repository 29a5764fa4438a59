use crate::execution::{CycleHandle, CycleView, PriceTracker};
use crate::models::{Phase, PriceSnapshot};
use crate::risk::StopLoss;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Consecutive ticks required before acting
pub const DEFAULT_THRESHOLD: u32 = 20;

/// Action requested from the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Wake the machine out of Waiting
    BuySignal,
    /// Momentum reversed before the entry filled
    CancelEntry,
    /// Momentum reversed while holding
    ForceExit,
    /// Price fell through the stop-loss floor
    StopLoss,
}

/// Counts consecutive ticks of price/average divergence in the direction the
/// current phase cares about, and fires one trigger per threshold crossing.
///
/// | Phase    | Counts while               | Fires        |
/// |----------|----------------------------|--------------|
/// | Waiting  | average < trade price      | `BuySignal`  |
/// | Entering | average > trade price      | `CancelEntry`|
/// | Entered  | average > trade price      | `ForceExit`  |
///
/// The stop-loss check runs first on every tick and bypasses the counter.
pub struct SignalAccumulator {
    threshold: u32,
    stop_loss: StopLoss,
    strength: Arc<AtomicU32>,
    last_phase: Option<Phase>,
}

impl SignalAccumulator {
    pub fn new(threshold: u32, stop_loss: StopLoss) -> Self {
        Self {
            threshold,
            stop_loss,
            strength: Arc::new(AtomicU32::new(0)),
            last_phase: None,
        }
    }

    pub fn strength(&self) -> u32 {
        self.strength.load(Ordering::Relaxed)
    }

    /// Shared read-only view of the counter for status reporting
    pub fn strength_handle(&self) -> Arc<AtomicU32> {
        self.strength.clone()
    }

    fn set_strength(&self, value: u32) {
        self.strength.store(value, Ordering::Relaxed);
    }

    /// Advance the counter by one tick
    ///
    /// The stop-loss check runs in every phase while holding, Entered included.
    pub fn step(&mut self, cycle: &CycleView, prices: &PriceSnapshot) -> Option<Trigger> {
        if cycle.holding {
            if let (Some(settled), Some(price)) = (cycle.last_settled_price, prices.last_trade_price) {
                if self.stop_loss.is_breached(settled, price) {
                    tracing::warn!(
                        %price,
                        floor = %self.stop_loss.floor(settled),
                        "Stop-loss breached"
                    );
                    return Some(Trigger::StopLoss);
                }
            }
        }

        // Counter meaning is tied to the phase it was built in
        if self.last_phase.replace(cycle.phase) != Some(cycle.phase) {
            self.set_strength(0);
        }

        let (Some(average), Some(price)) = (prices.reference_price(), prices.last_trade_price)
        else {
            self.set_strength(0);
            return None;
        };

        let (building, trigger) = match cycle.phase {
            Phase::Waiting => (average < price, Trigger::BuySignal),
            Phase::Entering => (average > price, Trigger::CancelEntry),
            Phase::Entered => (average > price, Trigger::ForceExit),
            Phase::Exiting | Phase::Exit | Phase::Exited => (false, Trigger::ForceExit),
        };

        let strength = if building { self.strength() + 1 } else { 0 };
        if strength > self.threshold {
            self.set_strength(0);
            tracing::info!(phase = %cycle.phase, ?trigger, "Signal threshold crossed");
            return Some(trigger);
        }

        self.set_strength(strength);
        None
    }

    /// Hand a trigger to the machine. Only requests are made, never gateway calls.
    ///
    /// `view` is the snapshot the trigger was computed from. If its cycle has been
    /// replaced in the meantime the trigger is dropped.
    pub fn apply(trigger: Trigger, view: &CycleView, cycle: &CycleHandle) -> bool {
        let delivered = match trigger {
            Trigger::BuySignal => cycle.fire_buy_signal_for(view.generation),
            Trigger::CancelEntry => cycle.request_cancel_for(view.generation),
            Trigger::ForceExit | Trigger::StopLoss => cycle.request_exit_for(view.generation),
        };
        if !delivered {
            tracing::debug!(?trigger, generation = view.generation, "Trigger dropped");
        }
        delivered
    }

    /// One tick: read the cycle and prices, step, and apply any trigger
    pub fn evaluate(&mut self, cycle: &CycleHandle, tracker: &PriceTracker) -> Option<Trigger> {
        let view = cycle.view();
        let prices = tracker.current();
        let trigger = self.step(&view, &prices);
        if let Some(trigger) = trigger {
            Self::apply(trigger, &view, cycle);
        }
        trigger
    }
}

impl Default for SignalAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, StopLoss::default())
    }
}
