use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use trendbot::api::PaperExchange;
use trendbot::execution::{CycleHandle, MachineSettings, PriceTracker, RetryPolicy, TradingStateMachine};
use trendbot::feed::{ingest, FeedError, RecordSource, ThrottleGate};
use trendbot::scheduler::{self, Intervals, RestartPolicy};
use trendbot::strategy::SignalAccumulator;
use trendbot::{truncate_size, Phase, Side};

/// Publishes the same reference average twice a second
struct SteadyAverage {
    price: &'static str,
}

#[async_trait]
impl RecordSource for SteadyAverage {
    async fn next_batch(&mut self) -> Result<Vec<Vec<u8>>, FeedError> {
        sleep(Duration::from_millis(500)).await;
        let record = format!(
            r#"{{"PRODUCT_ID":"BTC-USD","TICKER_SYMBOL_AVG":{}}}"#,
            self.price
        );
        Ok(vec![record.into_bytes()])
    }
}

struct Bot {
    paper: Arc<PaperExchange>,
    cycle: CycleHandle,
    tracker: PriceTracker,
}

/// Wire every task the binary runs, against a paper exchange
fn start_bot(bid: Decimal, ask: Decimal, reference: &'static str) -> Bot {
    let paper = PaperExchange::new("BTC-USD".parse().unwrap());
    paper.set_balance("USD", dec!(1000));
    paper.set_top_of_book(bid, dec!(5), ask, dec!(1));
    let paper = Arc::new(paper);

    let cycle = CycleHandle::new();
    let tracker = PriceTracker::new();
    let gate = Arc::new(ThrottleGate::new());
    let intervals = Intervals::default();

    let mut settings = MachineSettings::new("BTC-USD".parse().unwrap());
    settings.retry = RetryPolicy {
        jitter: Duration::ZERO,
        ..RetryPolicy::default()
    };
    let machine = TradingStateMachine::new(paper.clone(), cycle.clone(), settings);

    tokio::spawn(scheduler::price_refresh_loop(
        paper.clone(),
        tracker.clone(),
        "BTC-USD".to_string(),
        intervals.price_refresh,
    ));
    tokio::spawn(scheduler::signal_loop(
        SignalAccumulator::default(),
        cycle.clone(),
        tracker.clone(),
        intervals.signal,
    ));
    tokio::spawn(scheduler::throttle_loop(gate.clone(), intervals.throttle));
    tokio::spawn(scheduler::supervise_machine(
        machine,
        RestartPolicy {
            max_restarts: 0,
            delay: Duration::from_secs(1),
        },
    ));
    {
        let tracker = tracker.clone();
        tokio::spawn(async move {
            let mut source = SteadyAverage { price: reference };
            ingest(&mut source, &gate, &tracker).await
        });
    }

    Bot {
        paper,
        cycle,
        tracker,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..60_000 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_momentum_cycle_with_take_profit() {
    let bot = start_bot(dec!(101), dec!(101.5), "100");

    // Trade price above the reference average builds the buy signal
    let buy = {
        let paper = bot.paper.clone();
        wait_until(|| !paper.orders().is_empty()).await;
        paper.orders().remove(0)
    };
    let snapshot = bot.tracker.current();
    assert_eq!(snapshot.last_trade_price, Some(dec!(101)));
    assert_eq!(snapshot.reference_price(), Some(dec!(100)));

    assert_eq!(buy.side, Side::Buy);
    assert_eq!(buy.price, dec!(101));
    let size = truncate_size(dec!(1000) / dec!(101));
    assert_eq!(buy.size, size);
    assert_eq!(bot.cycle.phase(), Phase::Entering);

    // No second entry while the first one rests
    sleep(Duration::from_secs(30)).await;
    assert_eq!(bot.paper.orders().len(), 1);

    bot.paper.fill_order(&buy.id);
    wait_until(|| bot.paper.orders().len() == 2).await;

    let sell = bot.paper.orders()[1].clone();
    assert_eq!(sell.side, Side::Sell);
    assert_eq!(sell.price, dec!(101.50));
    assert_eq!(sell.size, size);
    assert!(bot.cycle.holding());

    bot.paper.fill_order(&sell.id);
    wait_until(|| bot.cycle.phase() == Phase::Waiting && !bot.cycle.holding()).await;

    assert_eq!(bot.paper.balance("BTC"), Decimal::ZERO);
    assert_eq!(
        bot.paper.balance("USD"),
        dec!(1000) - dec!(101) * size + dec!(101.50) * size
    );
    assert_eq!(bot.paper.open_order_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_loss_forces_exit_at_the_ask() {
    let bot = start_bot(dec!(101), dec!(101.5), "100");

    wait_until(|| !bot.paper.orders().is_empty()).await;
    let buy = bot.paper.orders().remove(0);
    bot.paper.fill_order(&buy.id);
    wait_until(|| bot.paper.orders().len() == 2).await;
    assert_eq!(bot.cycle.phase(), Phase::Entered);

    // More than 1% below the settled entry
    bot.paper.set_top_of_book(dec!(99.9), dec!(5), dec!(99.957), dec!(1));
    wait_until(|| bot.paper.orders().len() == 3).await;

    let orders = bot.paper.orders();
    let take_profit = &orders[1];
    let exit = &orders[2];
    assert_eq!(
        take_profit.done_reason.as_deref(),
        Some("canceled"),
        "take-profit is cancelled before the exit sell"
    );
    assert_eq!(exit.side, Side::Sell);
    assert_eq!(exit.price, dec!(99.95));
    assert_eq!(exit.size, buy.size);

    bot.paper.fill_order(&exit.id);
    wait_until(|| bot.cycle.phase() == Phase::Waiting && !bot.cycle.holding()).await;
    assert_eq!(bot.paper.balance("BTC"), Decimal::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_no_entry_without_momentum() {
    // Trade price below the reference average never builds a buy signal
    let bot = start_bot(dec!(99), dec!(99.5), "100");

    sleep(Duration::from_secs(120)).await;
    assert!(bot.paper.orders().is_empty());
    assert_eq!(bot.cycle.phase(), Phase::Waiting);
}
