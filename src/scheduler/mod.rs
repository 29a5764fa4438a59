//! Periodic tasks and task supervision
//!
//! Every loop runs on its own `tokio::time::interval` with skipped missed
//! ticks, so a slow iteration delays the next one instead of bursting.
//! The two long-running workers (state machine and reference feed) are
//! wrapped in supervisors that restart them after a fatal error.

use crate::api::ExchangeGateway;
use crate::config::{ScheduleSettings, SupervisorSettings};
use crate::execution::{CycleHandle, PriceTracker, TradingStateMachine};
use crate::feed::{ingest, FeedError, RecordSource, ThrottleGate};
use crate::models::Product;
use crate::strategy::SignalAccumulator;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{interval_at, sleep, Duration, Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intervals {
    pub price_refresh: Duration,
    pub signal: Duration,
    pub throttle: Duration,
    pub status: Duration,
    pub settled_report: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self::from(&ScheduleSettings::default())
    }
}

impl From<&ScheduleSettings> for Intervals {
    fn from(s: &ScheduleSettings) -> Self {
        Self {
            price_refresh: Duration::from_millis(s.price_refresh_ms),
            signal: Duration::from_millis(s.signal_ms),
            throttle: Duration::from_millis(s.throttle_ms),
            status: Duration::from_millis(s.status_ms),
            settled_report: Duration::from_millis(s.settled_report_ms),
        }
    }
}

/// How often a supervised task may be restarted, and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub delay: Duration,
}

impl From<&SupervisorSettings> for RestartPolicy {
    fn from(s: &SupervisorSettings) -> Self {
        Self {
            max_restarts: s.max_restarts,
            delay: Duration::from_millis(s.restart_delay_ms),
        }
    }
}

/// Ticker whose first tick is one full period from now
fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

// ============================================================================
// Periodic loops
// ============================================================================

/// Refresh the last trade price from the order book
pub async fn price_refresh_loop<G: ExchangeGateway + ?Sized>(
    gateway: Arc<G>,
    tracker: PriceTracker,
    product_id: String,
    period: Duration,
) {
    tracing::info!("🔄 Price refresh loop starting ({:?})", period);
    let mut ticker = ticker(period);
    loop {
        ticker.tick().await;
        tracker.refresh_trade_price(gateway.as_ref(), &product_id).await;
    }
}

/// Feed the signal engine one tick at a time
pub async fn signal_loop(
    mut signal: SignalAccumulator,
    cycle: CycleHandle,
    tracker: PriceTracker,
    period: Duration,
) {
    tracing::info!("📈 Signal loop starting ({:?})", period);
    let mut ticker = ticker(period);
    loop {
        ticker.tick().await;
        signal.evaluate(&cycle, &tracker);
    }
}

/// Re-open the feed gate so one more reference record can be accepted
pub async fn throttle_loop(gate: Arc<ThrottleGate>, period: Duration) {
    let mut ticker = ticker(period);
    loop {
        ticker.tick().await;
        gate.reopen();
    }
}

pub async fn status_loop(
    cycle: CycleHandle,
    tracker: PriceTracker,
    strength: Arc<AtomicU32>,
    period: Duration,
) {
    let mut ticker = ticker(period);
    loop {
        ticker.tick().await;
        let prices = tracker.current();
        tracing::info!(
            "Book Price Avg: {} | Last Trade Price: {} | {} ({})",
            display_price(prices.reference_price()),
            display_price(prices.last_trade_price),
            cycle.phase(),
            strength.load(Ordering::Relaxed)
        );
    }
}

fn display_price(price: Option<rust_decimal::Decimal>) -> String {
    price.map_or_else(|| "-".to_string(), |p| p.to_string())
}

/// List the orders settled in the current cycle
pub async fn settled_orders_loop(cycle: CycleHandle, period: Duration) {
    let mut ticker = ticker(period);
    loop {
        ticker.tick().await;
        let (started_at, orders) = cycle.settled_report();
        if orders.is_empty() {
            continue;
        }

        tracing::info!(
            "📋 {} settled order(s) since {}",
            orders.len(),
            started_at.format("%H:%M:%S")
        );
        for order in &orders {
            tracing::info!(
                "  {} {} @ {} (id {})",
                order.side,
                order.size,
                order.price,
                order.id
            );
        }
    }
}

// ============================================================================
// Supervisors
// ============================================================================

/// Run the state machine, restarting it from Waiting after each fatal error
///
/// Before a restart the account is reconciled: open orders are listed and
/// cancelled and any base currency still held is reported. Gives up once
/// `policy.max_restarts` restarts have been used.
pub async fn supervise_machine<G: ExchangeGateway + ?Sized>(
    machine: TradingStateMachine<G>,
    policy: RestartPolicy,
) -> anyhow::Result<()> {
    let mut restarts = 0;
    loop {
        let Err(e) = machine.run().await else {
            return Ok(());
        };
        tracing::error!(phase = %machine.cycle().phase(), "State machine stopped: {}", e);

        if restarts >= policy.max_restarts {
            anyhow::bail!("state machine failed {} times, last error: {}", restarts + 1, e);
        }
        restarts += 1;

        reconcile(machine.gateway().as_ref(), &machine.settings().product).await;
        tracing::warn!(
            "Restarting state machine in {:?} ({}/{})",
            policy.delay,
            restarts,
            policy.max_restarts
        );
        sleep(policy.delay).await;
    }
}

/// Bring the account to a known state before trading again
pub async fn reconcile<G: ExchangeGateway + ?Sized>(gateway: &G, product: &Product) {
    match gateway.open_orders(&product.id).await {
        Ok(orders) if orders.is_empty() => {}
        Ok(orders) => {
            for order in &orders {
                tracing::warn!(
                    order_id = %order.id,
                    "Open order left behind: {} {} @ {}",
                    order.side,
                    order.size,
                    order.price
                );
            }
        }
        Err(e) => tracing::warn!("Reconcile: failed to list open orders: {}", e),
    }

    match gateway.cancel_all_orders(&product.id).await {
        Ok(()) => tracing::info!("Reconcile: cancelled open {} orders", product.id),
        Err(e) => tracing::warn!("Reconcile: failed to cancel orders: {}", e),
    }

    match gateway.available_balance(&product.base).await {
        Ok(held) if held.is_zero() => {}
        Ok(held) => tracing::warn!(
            %held,
            "Reconcile: still holding {}, it will not be sold automatically",
            product.base
        ),
        Err(e) => tracing::warn!("Reconcile: failed to read {} balance: {}", product.base, e),
    }
}

/// Connect and ingest reference records, reconnecting after each failure
pub async fn supervise_feed<S, F, Fut>(
    mut connect: F,
    gate: Arc<ThrottleGate>,
    tracker: PriceTracker,
    policy: RestartPolicy,
) -> anyhow::Result<()>
where
    S: RecordSource,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, FeedError>>,
{
    let mut restarts = 0;
    loop {
        let result = match connect().await {
            Ok(mut source) => ingest(&mut source, &gate, &tracker).await,
            Err(e) => Err(e),
        };
        let Err(e) = result else {
            return Ok(());
        };
        tracing::error!("Reference feed stopped: {}", e);

        if restarts >= policy.max_restarts {
            anyhow::bail!("reference feed failed {} times, last error: {}", restarts + 1, e);
        }
        restarts += 1;

        tracing::warn!(
            "Reconnecting reference feed in {:?} ({}/{})",
            policy.delay,
            restarts,
            policy.max_restarts
        );
        sleep(policy.delay).await;
    }
}
