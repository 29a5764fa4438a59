use super::{CycleHandle, RetryPolicy, TradingError};
use crate::api::{ExchangeGateway, GatewayError};
use crate::models::{truncate_price, truncate_size, Order, OrderRequest, Phase, Product};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub product: Product,
    /// Take-profit above the settled entry price, e.g. 0.005 for +0.5%
    pub take_profit_pct: Decimal,
    pub poll_interval: Duration,
    /// Expiry of the emergency exit sell ("min", "hour" or "day")
    pub exit_cancel_after: String,
    pub retry: RetryPolicy,
}

impl MachineSettings {
    pub fn new(product: Product) -> Self {
        Self {
            product,
            take_profit_pct: dec!(0.005),
            poll_interval: Duration::from_secs(2),
            exit_cancel_after: "min".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Next handler to run. Exiting has no handler: nothing transitions into it.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    Waiting,
    Entering,
    Entered(Order),
    Exit,
    Exited,
}

/// Sequential order-lifecycle machine for one product
///
/// 1. Waiting   - fresh cycle, block until the signal engine fires a buy
/// 2. Entering  - limit buy at the best bid, poll until settled
/// 3. Entered   - take-profit limit sell, poll until settled
/// 4. Exit      - forced: cancel everything, sell at the ask with a short expiry
/// 5. Exited    - cancel leftovers, back to Waiting
///
/// Only one handler runs at a time and each returns the next one explicitly.
pub struct TradingStateMachine<G: ?Sized> {
    gateway: Arc<G>,
    cycle: CycleHandle,
    settings: MachineSettings,
}

impl<G: ExchangeGateway + ?Sized> TradingStateMachine<G> {
    pub fn new(gateway: Arc<G>, cycle: CycleHandle, settings: MachineSettings) -> Self {
        Self {
            gateway,
            cycle,
            settings,
        }
    }

    pub fn cycle(&self) -> &CycleHandle {
        &self.cycle
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    /// Drive the machine from Waiting. Only returns on a fatal error.
    pub async fn run(&self) -> Result<(), TradingError> {
        let mut step = Step::Waiting;
        loop {
            step = match step {
                Step::Waiting => self.waiting().await,
                Step::Entering => self.entering().await?,
                Step::Entered(entry) => self.entered(entry).await?,
                Step::Exit => self.exit().await?,
                Step::Exited => self.exited().await?,
            };
        }
    }

    async fn waiting(&self) -> Step {
        tracing::info!("WAITING...");
        let mut buy_signal = self.cycle.begin_cycle();

        loop {
            tokio::select! {
                received = &mut buy_signal => {
                    return match received {
                        Ok(()) => Step::Entering,
                        // Sender went away with a replaced cycle
                        Err(_) => Step::Waiting,
                    };
                }
                _ = self.cycle.exit_notified() => {
                    // Wake-ups left over from an earlier cycle are ignored
                    if self.cycle.exit_requested() {
                        tracing::warn!("WAITING: exit requested before any entry");
                        return Step::Exit;
                    }
                }
            }
        }
    }

    async fn entering(&self) -> Result<Step, TradingError> {
        tracing::info!("ENTERING...");
        if self.cycle.advance(Phase::Entering) == Phase::Exit {
            return Ok(Step::Exit);
        }

        let product = &self.settings.product;
        let balance = self.balance(&product.quote).await?;
        let quote = self
            .settings
            .retry
            .run("fetch best bid", || self.gateway.best_bid_ask(&product.id))
            .await?;
        if quote.bid <= Decimal::ZERO {
            return Err(TradingError::InvalidMarket(format!("best bid {}", quote.bid)));
        }

        let price = truncate_price(quote.bid);
        let size = truncate_size(balance / quote.bid);
        if price.is_zero() || size.is_zero() {
            tracing::warn!(
                %balance,
                bid = %quote.bid,
                "ENTERING: {} balance too small for an order",
                product.quote
            );
            return Ok(Step::Waiting);
        }

        // One request for every attempt, so a retried submit keeps its client_oid
        let request = OrderRequest::limit_buy(&product.id, price, size);
        tracing::info!(%balance, bid = %quote.bid, %price, %size, "New entry order");
        let order = self
            .settings
            .retry
            .run("submit entry buy", || self.gateway.submit_order(&request))
            .await?;
        self.cycle.set_opened_order(order.clone());

        loop {
            sleep(self.settings.poll_interval).await;

            if self.cycle.exit_requested() {
                return Ok(Step::Exit);
            }

            if self.cycle.take_cancel_request() {
                match self.gateway.cancel_order(&order.id).await {
                    Ok(()) => {
                        tracing::info!(order_id = %order.id, "ENTERING: entry order cancelled");
                        return Ok(Step::Waiting);
                    }
                    Err(e) => {
                        tracing::warn!("ENTERING: failed to cancel order {}: {}", order.id, e);
                        // Keep the request alive for the next poll
                        self.cycle.request_cancel();
                    }
                }
            }

            match self.gateway.order_status(&order.id).await {
                Err(e) => {
                    // Assume the order was cancelled outside the bot
                    tracing::warn!("ENTERING: failed to get order: {}", e);
                    return Ok(Step::Waiting);
                }
                Ok(status) if status.is_filled() => {
                    tracing::info!(order_id = %status.id, price = %status.price, "Entry settled");
                    self.cycle.record_settlement(status.clone(), true);
                    return Ok(Step::Entered(status));
                }
                Ok(status) if status.is_done() => {
                    tracing::warn!(order_id = %status.id, "ENTERING: order closed without a fill");
                    return Ok(Step::Waiting);
                }
                Ok(_) => {}
            }
        }
    }

    async fn entered(&self, entry: Order) -> Result<Step, TradingError> {
        tracing::info!("ENTERED...");
        // A cancel aimed at the entry order is stale once it settled
        self.cycle.take_cancel_request();
        if self.cycle.advance(Phase::Entered) == Phase::Exit {
            return Ok(Step::Exit);
        }

        let product = &self.settings.product;
        let target = truncate_price(entry.price * (Decimal::ONE + self.settings.take_profit_pct));
        let size = truncate_size(self.balance(&product.base).await?);
        let request = OrderRequest::limit_sell(&product.id, target, size);
        self.cycle.set_quick_sell_order(request.clone());

        tracing::info!(entry = %entry.price, %target, %size, "Placing take-profit sell");
        let order = self
            .settings
            .retry
            .run("submit take-profit sell", || self.gateway.submit_order(&request))
            .await?;
        self.cycle.set_opened_order(order.clone());

        loop {
            sleep(self.settings.poll_interval).await;

            if self.cycle.exit_requested() {
                return Ok(Step::Exit);
            }

            match self.gateway.order_status(&order.id).await {
                Err(e) => {
                    tracing::warn!("ENTERED: failed to get order: {}", e);
                    return Ok(Step::Waiting);
                }
                Ok(status) if status.is_filled() => {
                    tracing::info!(order_id = %status.id, price = %status.price, "Take-profit settled");
                    self.cycle.record_settlement(status, false);
                    return Ok(Step::Exited);
                }
                Ok(status) if status.is_done() => {
                    tracing::warn!(order_id = %status.id, "ENTERED: order closed without a fill");
                    return Ok(Step::Waiting);
                }
                Ok(_) => {}
            }
        }
    }

    async fn exited(&self) -> Result<Step, TradingError> {
        tracing::info!("EXITED...");
        self.cycle.advance(Phase::Exited);

        let product_id = &self.settings.product.id;
        self.settings
            .retry
            .run("cancel all orders", || self.gateway.cancel_all_orders(product_id))
            .await?;

        Ok(Step::Waiting)
    }

    async fn exit(&self) -> Result<Step, TradingError> {
        tracing::info!("EXIT...");
        self.cycle.advance(Phase::Exit);
        let product = &self.settings.product;

        if !self.cycle.holding() {
            if let Some(order) = self.cycle.opened_order().filter(|o| !o.settled) {
                self.settings
                    .retry
                    .run("cancel entry order", || self.cancel_if_present(&order.id))
                    .await?;
            }
            return Ok(Step::Waiting);
        }

        self.settings
            .retry
            .run("cancel all orders", || self.gateway.cancel_all_orders(&product.id))
            .await?;

        let quote = self
            .settings
            .retry
            .run("fetch best ask", || self.gateway.best_bid_ask(&product.id))
            .await?;
        let price = truncate_price(quote.ask);
        let size = truncate_size(self.balance(&product.base).await?);

        let request = OrderRequest::limit_sell(&product.id, price, size)
            .with_expiry(&self.settings.exit_cancel_after);
        tracing::warn!(%price, %size, "Exit sell at the ask");
        let order = self
            .settings
            .retry
            .run("submit exit sell", || self.gateway.submit_order(&request))
            .await?;
        self.cycle.set_opened_order(order.clone());

        loop {
            sleep(self.settings.poll_interval).await;

            let status = self
                .settings
                .retry
                .run("fetch exit order", || self.exit_order_status(&order.id))
                .await?;

            match status {
                // Expired or cancelled without a fill: start over at the new ask
                None => return Ok(Step::Exit),
                Some(status) if status.is_filled() => {
                    tracing::info!(order_id = %status.id, price = %status.price, "Exit settled");
                    self.cycle.record_settlement(status, false);
                    return Ok(Step::Exited);
                }
                Some(status) if status.is_done() => return Ok(Step::Exit),
                Some(_) => {}
            }
        }
    }

    /// Balance used to size an order; without it nothing can be sized safely
    async fn balance(&self, currency: &str) -> Result<Decimal, TradingError> {
        self.gateway
            .available_balance(currency)
            .await
            .map_err(|source| TradingError::Sizing {
                currency: currency.to_string(),
                source,
            })
    }

    async fn cancel_if_present(&self, order_id: &str) -> Result<(), GatewayError> {
        match self.gateway.cancel_order(order_id).await {
            Err(GatewayError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn exit_order_status(&self, order_id: &str) -> Result<Option<Order>, GatewayError> {
        match self.gateway.order_status(order_id).await {
            Ok(order) => Ok(Some(order)),
            Err(GatewayError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PaperExchange, PaperOperation};
    use crate::models::Side;
    use tokio::task::JoinHandle;

    type Machine = TradingStateMachine<PaperExchange>;

    fn settings() -> MachineSettings {
        let mut settings = MachineSettings::new("BTC-USD".parse().unwrap());
        settings.retry = RetryPolicy {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            max_attempts: 4,
            jitter: Duration::ZERO,
        };
        settings
    }

    fn start(paper: Arc<PaperExchange>) -> (CycleHandle, JoinHandle<Result<(), TradingError>>) {
        let cycle = CycleHandle::new();
        let machine: Machine = TradingStateMachine::new(paper, cycle.clone(), settings());
        let task = tokio::spawn(async move { machine.run().await });
        (cycle, task)
    }

    fn paper(bid: Decimal, ask: Decimal) -> Arc<PaperExchange> {
        let paper = PaperExchange::new("BTC-USD".parse().unwrap());
        paper.set_balance("USD", dec!(1000));
        paper.set_top_of_book(bid, dec!(5), ask, dec!(1));
        Arc::new(paper)
    }

    /// Poll `cond` on a 10ms virtual clock, failing after 10 virtual minutes
    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..60_000 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn enter(paper: &PaperExchange, cycle: &CycleHandle) -> Order {
        wait_until(|| cycle.fire_buy_signal()).await;
        wait_until(|| !paper.orders().is_empty()).await;
        paper.orders().remove(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_buy_signal_submits_truncated_entry() {
        let paper = paper(dec!(101.2399), dec!(101.5));
        let (cycle, _task) = start(paper.clone());

        let order = enter(&paper, &cycle).await;

        assert_eq!(cycle.phase(), Phase::Entering);
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.price, dec!(101.23));
        assert_eq!(order.size, truncate_size(dec!(1000) / dec!(101.2399)));
        assert_eq!(paper.orders().len(), 1, "exactly one entry order");
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_entry_places_take_profit() {
        let paper = paper(dec!(100), dec!(100.5));
        let (cycle, _task) = start(paper.clone());

        let buy = enter(&paper, &cycle).await;
        assert!(paper.fill_order(&buy.id));
        wait_until(|| paper.orders().len() == 2).await;

        let sell = &paper.orders()[1];
        assert_eq!(sell.side, Side::Sell);
        assert_eq!(sell.price, dec!(100.50));
        assert_eq!(sell.size, dec!(10));
        assert_eq!(cycle.phase(), Phase::Entered);
        assert!(cycle.holding());
        assert_eq!(cycle.quick_sell_order().unwrap().price, dec!(100.50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_settles_two_orders_then_waits() {
        let paper = paper(dec!(100), dec!(100.5));
        let (cycle, _task) = start(paper.clone());

        let buy = enter(&paper, &cycle).await;
        paper.fill_order(&buy.id);
        wait_until(|| paper.orders().len() == 2).await;

        // Hold the machine in Exited long enough to inspect the cycle
        paper.fail_next(PaperOperation::CancelAll, 1);
        let sell = paper.orders()[1].clone();
        paper.fill_order(&sell.id);

        wait_until(|| cycle.phase() == Phase::Exited).await;
        let settled = cycle.settled_orders();
        assert!(!cycle.holding());
        assert_eq!(settled.len(), 2);
        assert_eq!(settled[0].side, Side::Buy);
        assert_eq!(settled[1].side, Side::Sell);

        wait_until(|| cycle.phase() == Phase::Waiting).await;
        assert!(cycle.settled_orders().is_empty(), "new cycle starts clean");
        assert_eq!(paper.balance("USD"), dec!(1005.00));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_exit_sells_at_ask() {
        let paper = paper(dec!(100), dec!(100.567));
        let (cycle, _task) = start(paper.clone());

        let buy = enter(&paper, &cycle).await;
        paper.fill_order(&buy.id);
        wait_until(|| paper.orders().len() == 2).await;

        cycle.request_exit();
        wait_until(|| paper.orders().len() == 3).await;

        let exit_sell = paper.orders()[2].clone();
        assert_eq!(exit_sell.side, Side::Sell);
        assert_eq!(exit_sell.price, dec!(100.56));
        assert_eq!(paper.open_order_count(), 1, "take-profit was cancelled");

        paper.fill_order(&exit_sell.id);
        wait_until(|| cycle.phase() == Phase::Waiting).await;
        assert_eq!(paper.balance("BTC"), Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_exit_sell_is_repriced() {
        let paper = paper(dec!(100), dec!(100.5));
        let (cycle, _task) = start(paper.clone());

        let buy = enter(&paper, &cycle).await;
        paper.fill_order(&buy.id);
        wait_until(|| paper.orders().len() == 2).await;

        cycle.request_exit();
        wait_until(|| paper.orders().len() == 3).await;

        paper.set_top_of_book(dec!(99), dec!(5), dec!(99.2), dec!(1));
        paper.expire_order(&paper.orders()[2].id);
        wait_until(|| paper.orders().len() == 4).await;

        assert_eq!(paper.orders()[3].price, dec!(99.2));
        assert_eq!(cycle.phase(), Phase::Exit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_request_returns_to_waiting() {
        let paper = paper(dec!(100), dec!(100.5));
        let (cycle, _task) = start(paper.clone());

        enter(&paper, &cycle).await;
        cycle.request_cancel();

        wait_until(|| cycle.phase() == Phase::Waiting).await;
        assert_eq!(paper.open_order_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_failure_while_entering_falls_back_to_waiting() {
        let paper = paper(dec!(100), dec!(100.5));
        let (cycle, _task) = start(paper.clone());

        enter(&paper, &cycle).await;
        paper.fail_next(PaperOperation::Status, 1);

        wait_until(|| cycle.phase() == Phase::Waiting).await;
        assert!(cycle.opened_order().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_without_holding_cancels_entry() {
        let paper = paper(dec!(100), dec!(100.5));
        let (cycle, _task) = start(paper.clone());

        enter(&paper, &cycle).await;
        cycle.request_exit();

        wait_until(|| cycle.phase() == Phase::Waiting).await;
        assert_eq!(paper.open_order_count(), 0);
        assert!(!cycle.holding());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_while_waiting_returns_to_waiting() {
        let paper = paper(dec!(100), dec!(100.5));
        let (cycle, _task) = start(paper.clone());

        wait_until(|| cycle.generation() == 1).await;
        cycle.request_exit();

        wait_until(|| cycle.generation() == 2).await;
        assert_eq!(cycle.phase(), Phase::Waiting);
        assert!(paper.orders().is_empty());

        // The new cycle still takes a buy signal
        let order = enter(&paper, &cycle).await;
        assert_eq!(order.side, Side::Buy);
        assert_eq!(cycle.phase(), Phase::Entering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_submit_response_does_not_duplicate_entry() {
        let paper = paper(dec!(100), dec!(100.5));
        paper.fail_next(PaperOperation::SubmitResponse, 1);
        let (cycle, _task) = start(paper.clone());

        let order = enter(&paper, &cycle).await;
        sleep(Duration::from_secs(5)).await;

        assert_eq!(paper.orders().len(), 1, "retry reused the client_oid");
        assert_eq!(cycle.opened_order().unwrap().id, order.id);
        assert_eq!(cycle.phase(), Phase::Entering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_failure_while_entered_falls_back_to_waiting() {
        let paper = paper(dec!(100), dec!(100.5));
        let (cycle, _task) = start(paper.clone());

        let buy = enter(&paper, &cycle).await;
        paper.fill_order(&buy.id);
        wait_until(|| paper.orders().len() == 2).await;
        assert_eq!(cycle.phase(), Phase::Entered);

        paper.fail_next(PaperOperation::Status, 1);
        wait_until(|| cycle.phase() == Phase::Waiting).await;
        assert!(!cycle.holding());
        assert!(cycle.settled_orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_profit_submit_failures_are_retried() {
        let paper = paper(dec!(100), dec!(100.5));
        let (cycle, _task) = start(paper.clone());

        let buy = enter(&paper, &cycle).await;
        paper.fail_next(PaperOperation::Submit, 2);
        paper.fill_order(&buy.id);

        wait_until(|| paper.orders().len() == 2).await;
        let sell = &paper.orders()[1];
        assert_eq!(sell.side, Side::Sell);
        assert_eq!(sell.price, dec!(100.50));
        assert_eq!(cycle.phase(), Phase::Entered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cancel_is_retried_next_poll() {
        let paper = paper(dec!(100), dec!(100.5));
        let (cycle, _task) = start(paper.clone());

        let buy = enter(&paper, &cycle).await;
        paper.fail_next(PaperOperation::Cancel, 1);
        cycle.request_cancel();

        // First poll: the cancel fails and the order keeps resting
        sleep(Duration::from_millis(2100)).await;
        assert_eq!(cycle.phase(), Phase::Entering);
        assert_eq!(paper.open_order_count(), 1);

        wait_until(|| cycle.phase() == Phase::Waiting).await;
        assert_eq!(paper.open_order_count(), 0);
        assert_eq!(paper.orders()[0].id, buy.id);
        assert_eq!(paper.orders()[0].done_reason.as_deref(), Some("canceled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_lookup_errors_are_retried() {
        let paper = paper(dec!(100), dec!(100.5));
        let (cycle, _task) = start(paper.clone());

        let buy = enter(&paper, &cycle).await;
        paper.fill_order(&buy.id);
        wait_until(|| paper.orders().len() == 2).await;

        cycle.request_exit();
        wait_until(|| paper.orders().len() == 3).await;
        paper.fail_next(PaperOperation::Status, 2);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(cycle.phase(), Phase::Exit, "still exiting, not back to Waiting");
        assert!(cycle.holding());
        assert_eq!(paper.orders().len(), 3, "exit sell was not re-priced");

        let exit_sell = paper.orders()[2].clone();
        paper.fill_order(&exit_sell.id);
        wait_until(|| cycle.phase() == Phase::Waiting).await;
        assert_eq!(paper.balance("BTC"), Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_failures_are_retried() {
        let paper = paper(dec!(100), dec!(100.5));
        paper.fail_next(PaperOperation::Submit, 2);
        let (cycle, _task) = start(paper.clone());

        enter(&paper, &cycle).await;
        assert_eq!(paper.orders().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_retry_ceiling_is_fatal() {
        let paper = paper(dec!(100), dec!(100.5));
        paper.fail_next(PaperOperation::Submit, 10);
        let (cycle, task) = start(paper.clone());

        wait_until(|| cycle.fire_buy_signal()).await;
        let result = task.await.unwrap();
        assert!(matches!(result, Err(TradingError::RetriesExhausted { attempts: 4, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_balance_failure_is_fatal() {
        let paper = paper(dec!(100), dec!(100.5));
        paper.fail_next(PaperOperation::Balance, 1);
        let (cycle, task) = start(paper.clone());

        wait_until(|| cycle.fire_buy_signal()).await;
        let result = task.await.unwrap();
        assert!(matches!(result, Err(TradingError::Sizing { .. })));
        assert!(paper.orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_balance_goes_back_to_waiting() {
        let paper = paper(dec!(100), dec!(100.5));
        paper.set_balance("USD", Decimal::ZERO);
        let (cycle, _task) = start(paper.clone());

        wait_until(|| cycle.fire_buy_signal()).await;
        wait_until(|| cycle.phase() == Phase::Waiting && cycle.fire_buy_signal()).await;
        assert!(paper.orders().is_empty());
    }
}
