use anyhow::Context;
use clap::Parser;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use trendbot::api::{CoinbaseClient, Credentials, ExchangeGateway, PaperExchange};
use trendbot::config::Settings;
use trendbot::execution::{CycleHandle, PriceTracker, TradingStateMachine};
use trendbot::feed::redis_stream::RedisStreamSource;
use trendbot::feed::ThrottleGate;
use trendbot::scheduler::{self, Intervals, RestartPolicy};
use trendbot::strategy::SignalAccumulator;

#[derive(Parser, Debug)]
#[command(name = "trendbot", about = "Momentum limit-order trading bot")]
struct Args {
    /// Settings file (TOML). Missing file means built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulate orders locally against live public market data
    #[arg(long)]
    paper: bool,

    /// Quote currency balance to start a paper session with
    #[arg(long, default_value = "1000")]
    paper_balance: Decimal,

    /// Product to trade, overrides the settings file (e.g. ETH-USD)
    #[arg(short, long)]
    product: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(product) = args.product {
        settings.trading.product_id = product;
        settings.validate()?;
    }
    let product = settings.product()?;

    tracing::info!("🚀 TrendBot starting");
    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Product: {}", product);
    tracing::info!("  Mode: {}", if args.paper { "paper" } else { "live" });
    tracing::info!("  Signal threshold: {} ticks", settings.trading.threshold);
    tracing::info!("  Take profit: {}%", settings.trading.take_profit_pct * Decimal::ONE_HUNDRED);
    tracing::info!("  Stop loss: {}%", settings.trading.stop_loss_pct * Decimal::ONE_HUNDRED);
    tracing::info!("  Reference stream: {}", settings.feed.stream_key);

    let gateway = create_gateway(&settings, args.paper, args.paper_balance)?;

    // ============================================================================
    // Shared State
    // ============================================================================

    let cycle = CycleHandle::new();
    let tracker = PriceTracker::new();
    let gate = Arc::new(ThrottleGate::new());
    let signal = SignalAccumulator::new(settings.trading.threshold, settings.stop_loss());
    let strength = signal.strength_handle();
    let intervals = Intervals::from(&settings.schedule);
    let restart_policy = RestartPolicy::from(&settings.supervisor);

    tracing::info!("\n🔄 Spawning independent loops...");

    // ============================================================================
    // Periodic Loops
    // ============================================================================

    tokio::spawn(scheduler::price_refresh_loop(
        gateway.clone(),
        tracker.clone(),
        product.id.clone(),
        intervals.price_refresh,
    ));
    tokio::spawn(scheduler::signal_loop(
        signal,
        cycle.clone(),
        tracker.clone(),
        intervals.signal,
    ));
    tokio::spawn(scheduler::throttle_loop(gate.clone(), intervals.throttle));
    tokio::spawn(scheduler::status_loop(
        cycle.clone(),
        tracker.clone(),
        strength,
        intervals.status,
    ));
    tokio::spawn(scheduler::settled_orders_loop(
        cycle.clone(),
        intervals.settled_report,
    ));

    // ============================================================================
    // Supervised Workers
    // ============================================================================

    let machine_task = {
        let machine_settings = settings.machine_settings()?;
        let machine = TradingStateMachine::new(gateway.clone(), cycle.clone(), machine_settings);
        tokio::spawn(scheduler::supervise_machine(machine, restart_policy))
    };

    let feed_task = {
        let feed = settings.feed.clone();
        tokio::spawn(scheduler::supervise_feed(
            move || {
                let feed = feed.clone();
                async move {
                    RedisStreamSource::connect(
                        &feed.redis_url,
                        &feed.stream_key,
                        &feed.checkpoint_key,
                        feed.block_ms,
                        feed.batch_size,
                    )
                    .await
                }
            },
            gate,
            tracker,
            restart_policy,
        ))
    };

    tracing::info!("✅ All loops spawned successfully");
    tracing::info!("  🔄 Price refresh: every {:?}", intervals.price_refresh);
    tracing::info!("  📈 Signal: every {:?}", intervals.signal);
    tracing::info!("  🚦 Feed throttle: every {:?}", intervals.throttle);
    tracing::info!("\nPress Ctrl+C to stop...\n");

    // Wait for Ctrl+C or a supervisor giving up
    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
            Ok(())
        }
        result = machine_task => {
            tracing::error!("State machine supervisor exited: {:?}", result);
            result.context("state machine task panicked")?
        }
        result = feed_task => {
            tracing::error!("Reference feed supervisor exited: {:?}", result);
            result.context("reference feed task panicked")?
        }
    };

    tracing::info!("👋 TrendBot stopped");
    outcome
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trendbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn create_gateway(
    settings: &Settings,
    paper: bool,
    paper_balance: Decimal,
) -> anyhow::Result<Arc<dyn ExchangeGateway>> {
    let exchange = &settings.exchange;

    if paper {
        let market = CoinbaseClient::public(&exchange.rest_url, exchange.requests_per_second)?;
        let product = settings.product()?;
        let simulated = PaperExchange::new(product.clone())
            .with_market_data(Arc::new(market))
            .with_auto_match(true);
        simulated.set_balance(&product.quote, paper_balance);
        tracing::info!("📝 Paper trading with {} {}", paper_balance, product.quote);
        return Ok(Arc::new(simulated));
    }

    let credentials = Credentials::from_env().context("live trading needs exchange credentials")?;
    let client = CoinbaseClient::new(
        &exchange.rest_url,
        credentials,
        exchange.requests_per_second,
    )?;
    Ok(Arc::new(client))
}
