use crate::models::{Order, OrderRequest, Phase};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

/// State of one Waiting -> Exited loop
#[derive(Debug)]
pub struct TradingCycle {
    pub phase: Phase,
    /// A buy has settled and no matching sell has settled yet
    pub holding: bool,
    pub opened_order: Option<Order>,
    pub quick_sell_order: Option<OrderRequest>,
    /// Append-only within a cycle
    pub settled_orders: Vec<Order>,
    pub started_at: DateTime<Utc>,
    /// Increases by one with every new cycle
    pub generation: u64,
    buy_signal: Option<oneshot::Sender<()>>,
    cancel_requested: bool,
}

impl TradingCycle {
    fn new(buy_signal: Option<oneshot::Sender<()>>, generation: u64) -> Self {
        Self {
            phase: Phase::Waiting,
            holding: false,
            opened_order: None,
            quick_sell_order: None,
            settled_orders: Vec::new(),
            started_at: Utc::now(),
            generation,
            buy_signal,
            cancel_requested: false,
        }
    }

    pub fn last_settled_price(&self) -> Option<Decimal> {
        self.settled_orders.last().map(|o| o.price)
    }
}

/// What the signal engine needs to know about the live cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleView {
    /// Cycle the view was taken from; requests made with it are dropped once it is replaced
    pub generation: u64,
    pub phase: Phase,
    pub holding: bool,
    pub last_settled_price: Option<Decimal>,
}

/// Shared handle to the single live [`TradingCycle`]
///
/// Only the state machine replaces the cycle or records orders. Other tasks
/// read a [`CycleView`] and may only *request* a buy, a cancel or an exit.
/// The lock is never held across an await point and no other lock is taken
/// while holding it.
#[derive(Clone)]
pub struct CycleHandle {
    inner: Arc<Mutex<TradingCycle>>,
    exit: Arc<Notify>,
}

impl Default for CycleHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleHandle {
    pub fn new() -> Self {
        // No machine is listening until the first begin_cycle
        Self {
            inner: Arc::new(Mutex::new(TradingCycle::new(None, 0))),
            exit: Arc::new(Notify::new()),
        }
    }

    /// Discard the current cycle and start a fresh one in Waiting
    ///
    /// Returns the receiving half of the buy-signal rendezvous.
    pub fn begin_cycle(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut cycle = self.inner.lock();
        let generation = cycle.generation + 1;
        *cycle = TradingCycle::new(Some(tx), generation);
        rx
    }

    pub fn view(&self) -> CycleView {
        let cycle = self.inner.lock();
        CycleView {
            generation: cycle.generation,
            phase: cycle.phase,
            holding: cycle.holding,
            last_settled_price: cycle.last_settled_price(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    pub fn holding(&self) -> bool {
        self.inner.lock().holding
    }

    pub fn settled_orders(&self) -> Vec<Order> {
        self.inner.lock().settled_orders.clone()
    }

    pub fn opened_order(&self) -> Option<Order> {
        self.inner.lock().opened_order.clone()
    }

    pub fn quick_sell_order(&self) -> Option<OrderRequest> {
        self.inner.lock().quick_sell_order.clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Wake the machine out of Waiting. Delivers at most once per cycle.
    pub fn fire_buy_signal(&self) -> bool {
        self.fire_buy_signal_in(None)
    }

    /// Like [`CycleHandle::fire_buy_signal`], but only while `generation` is still live
    pub fn fire_buy_signal_for(&self, generation: u64) -> bool {
        self.fire_buy_signal_in(Some(generation))
    }

    fn fire_buy_signal_in(&self, generation: Option<u64>) -> bool {
        let sender = {
            let mut cycle = self.inner.lock();
            if cycle.phase != Phase::Waiting || is_stale(&cycle, generation) {
                return false;
            }
            cycle.buy_signal.take()
        };
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Ask the machine to cancel its resting entry order
    pub fn request_cancel(&self) {
        self.inner.lock().cancel_requested = true;
    }

    pub fn request_cancel_for(&self, generation: u64) -> bool {
        let mut cycle = self.inner.lock();
        if is_stale(&cycle, Some(generation)) {
            return false;
        }
        cycle.cancel_requested = true;
        true
    }

    pub(crate) fn take_cancel_request(&self) -> bool {
        std::mem::take(&mut self.inner.lock().cancel_requested)
    }

    /// Force the machine into Exit
    ///
    /// Observed at the next poll, or immediately when the machine is Waiting.
    pub fn request_exit(&self) {
        self.request_exit_in(None);
    }

    /// Force an exit of cycle `generation`; dropped if that cycle was replaced
    pub fn request_exit_for(&self, generation: u64) -> bool {
        self.request_exit_in(Some(generation))
    }

    fn request_exit_in(&self, generation: Option<u64>) -> bool {
        {
            let mut cycle = self.inner.lock();
            if is_stale(&cycle, generation) {
                tracing::debug!(
                    live = cycle.generation,
                    "Exit request for a replaced cycle dropped"
                );
                return false;
            }
            if cycle.phase != Phase::Exit {
                tracing::warn!(from = %cycle.phase, "Forced exit requested");
                cycle.phase = Phase::Exit;
            }
        }
        self.exit.notify_one();
        true
    }

    /// Resolves after an exit request; may also fire for a request already handled
    pub async fn exit_notified(&self) {
        self.exit.notified().await;
    }

    pub fn exit_requested(&self) -> bool {
        self.inner.lock().phase == Phase::Exit
    }

    /// Move to `next` unless an exit was forced in the meantime
    ///
    /// Returns the phase actually in effect.
    pub(crate) fn advance(&self, next: Phase) -> Phase {
        let mut cycle = self.inner.lock();
        if cycle.phase == Phase::Exit && next != Phase::Exit && next != Phase::Exited {
            return Phase::Exit;
        }
        cycle.phase = next;
        next
    }

    pub(crate) fn set_opened_order(&self, order: Order) {
        self.inner.lock().opened_order = Some(order);
    }

    pub(crate) fn set_quick_sell_order(&self, request: OrderRequest) {
        self.inner.lock().quick_sell_order = Some(request);
    }

    /// Record a settled order; a buy starts holding, a sell ends it
    pub(crate) fn record_settlement(&self, order: Order, holding: bool) {
        let mut cycle = self.inner.lock();
        cycle.holding = holding;
        cycle.opened_order = Some(order.clone());
        cycle.settled_orders.push(order);
    }

    /// Settled orders and cycle start, for the periodic order report
    pub fn settled_report(&self) -> (DateTime<Utc>, Vec<Order>) {
        let cycle = self.inner.lock();
        (cycle.started_at, cycle.settled_orders.clone())
    }
}

fn is_stale(cycle: &TradingCycle, generation: Option<u64>) -> bool {
    generation.is_some_and(|g| g != cycle.generation)
}
