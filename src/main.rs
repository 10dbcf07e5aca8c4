use std::sync::Arc;

use chrono::{Timelike, Utc};
use clap::Parser;
use tokio::time::{interval, interval_at, Duration, Instant, MissedTickBehavior};

use futuresbot::commands::CommandListener;
use futuresbot::config::{BotConfig, SharedConfig};
use futuresbot::db::Database;
use futuresbot::exchange::{with_backoff, BinanceFuturesClient, ExchangeClient};
use futuresbot::execution::{monitor, OrderLifecycleManager};
use futuresbot::indicators::{calculate_atr, session_age_bars};
use futuresbot::market::MarketDataFeed;
use futuresbot::models::Side;
use futuresbot::notify::Notifier;
use futuresbot::risk::RiskSizer;
use futuresbot::strategy::{EntryDecision, MarketView, StrategyEngine};
use futuresbot::Result;

const ATR_PERIOD: usize = 14;
const HTF_CANDLE_LIMIT: usize = 250;
const MTF_CANDLE_LIMIT: usize = 80;
const SYMBOL_REFRESH_SECS: u64 = 1800;

#[derive(Parser, Debug)]
#[command(name = "futuresbot", about = "Automated USDT-M futures trading agent")]
struct Cli {
    /// Force dry-run regardless of environment configuration
    #[arg(long)]
    dry_run: bool,

    /// Force live trading (overrides DRY_RUN=true in the environment)
    #[arg(long, conflicts_with = "dry_run")]
    live: bool,

    /// Use the exchange testnet
    #[arg(long)]
    testnet: bool,

    /// Pin the trading universe to these symbols (disables volume-based
    /// discovery), e.g. --symbols SOL/USDT:USDT,DOGE/USDT:USDT
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    tracing::info!("🚀 futuresbot starting");

    let mut config = BotConfig::from_env();
    if cli.dry_run {
        config.dry_run = true;
    }
    if cli.live {
        config.dry_run = false;
    }
    if cli.testnet {
        config.use_testnet = true;
    }

    // Optional persistence; the bot trades without it
    let db = connect_to_postgres().await;
    if let Some(db) = &db {
        restore_params(db, &mut config).await;
    }
    let config = SharedConfig::new(config);
    let cfg = config.snapshot();

    tracing::info!("📊 Configuration:");
    tracing::info!("  Mode: {}", if cfg.dry_run { "dry-run" } else { "LIVE" });
    tracing::info!("  Leverage: {}x | risk fraction {:.4}", cfg.leverage, cfg.risk_fraction);
    tracing::info!(
        "  Timeframes: entry {} / mtf {} / htf {}",
        cfg.entry_timeframe,
        cfg.mtf_timeframe,
        cfg.htf_timeframe
    );

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if !cfg.dry_run && (api_key.is_empty() || api_secret.is_empty()) {
        return Err("BINANCE_API_KEY/BINANCE_API_SECRET required for live trading".into());
    }

    let exchange: Arc<dyn ExchangeClient> = Arc::new(BinanceFuturesClient::new(
        api_key,
        api_secret,
        cfg.use_testnet,
    ));

    let notifier = Arc::new(Notifier::from_env());
    let manager = Arc::new(OrderLifecycleManager::new(
        Arc::clone(&exchange),
        config.clone(),
        db.clone(),
        Arc::clone(&notifier),
    ));

    // Rebuild tracking from live exchange state before any loop runs
    if !cfg.dry_run {
        tracing::info!("♻️ syncing state from exchange...");
        manager.sync_state_from_exchange().await?;
    }

    let feed = MarketDataFeed::new(Arc::clone(&exchange), cfg.atr_long_len + 100);
    let pinned_universe = !cli.symbols.is_empty();
    if pinned_universe {
        feed.set_symbols(cli.symbols.clone());
        tracing::info!("✅ trading universe pinned: {:?}", cli.symbols);
    } else {
        let tracked = tracked_symbols(&manager).await;
        match feed.refresh_top_symbols(cfg.top_symbol_limit, &tracked).await {
            Ok(symbols) => tracing::info!("✅ trading universe: {:?}", symbols),
            Err(e) => tracing::error!("initial symbol discovery failed: {}", e),
        }
    }

    tracing::info!("🔄 spawning loops...");

    let scan_task = {
        let feed = feed.clone();
        let manager = Arc::clone(&manager);
        let exchange = Arc::clone(&exchange);
        let config = config.clone();
        tokio::spawn(async move {
            scan_loop(feed, manager, exchange, config).await;
        })
    };

    let reconcile_task = {
        let manager = Arc::clone(&manager);
        let config = config.clone();
        tokio::spawn(async move {
            monitor::run_reconciliation_loop(manager, config).await;
        })
    };

    let trailing_task = {
        let manager = Arc::clone(&manager);
        let exchange = Arc::clone(&exchange);
        let config = config.clone();
        tokio::spawn(async move {
            monitor::run_trailing_monitor(manager, exchange, config).await;
        })
    };

    let universe_task = {
        let feed = feed.clone();
        let manager = Arc::clone(&manager);
        let config = config.clone();
        tokio::spawn(async move {
            if pinned_universe {
                // universe fixed by --symbols, nothing to refresh
                std::future::pending::<()>().await;
            }
            symbol_refresh_loop(feed, manager, config).await;
        })
    };

    if let Some(listener) =
        CommandListener::from_env(config.clone(), Arc::clone(&manager), db.clone(), Arc::clone(&notifier))
    {
        tokio::spawn(listener.run());
    } else {
        tracing::warn!("Telegram not configured, operator console disabled");
    }

    tracing::info!("✅ all loops running, Ctrl+C to stop");
    notifier.send_detached(format!(
        "🚀 futuresbot up ({})",
        if cfg.dry_run { "dry-run" } else { "LIVE" }
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️ Ctrl+C received, shutting down...");
        }
        result = scan_task => {
            tracing::error!("scan loop exited: {:?}", result);
        }
        result = reconcile_task => {
            tracing::error!("reconciliation loop exited: {:?}", result);
        }
        result = trailing_task => {
            tracing::error!("trailing monitor exited: {:?}", result);
        }
        result = universe_task => {
            tracing::error!("symbol refresh loop exited: {:?}", result);
        }
    }

    notifier.send("👋 futuresbot stopped").await;
    tracing::info!("👋 futuresbot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "futuresbot=info,futuresbot::strategy=debug".into()),
        )
        .init();
}

async fn connect_to_postgres() -> Option<Arc<Database>> {
    let database_url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, continuing without persistence");
            return None;
        }
    };

    match Database::connect(&database_url).await {
        Ok(db) => {
            tracing::info!("Postgres persistence enabled (trade log & params)");
            Some(Arc::new(db))
        }
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), continuing without persistence",
                e
            );
            None
        }
    }
}

/// Overlay operator-persisted parameters on the env-derived config
async fn restore_params(db: &Database, config: &mut BotConfig) {
    match db.load_params().await {
        Ok(params) => {
            for (key, value) in params {
                match config.apply_kv(&key, &value) {
                    Ok(()) => tracing::info!("  restored {} = {}", key, value),
                    Err(e) => tracing::warn!("  skipping persisted param {}: {}", key, e),
                }
            }
        }
        Err(e) => tracing::warn!("failed to load persisted params: {}", e),
    }
}

async fn tracked_symbols(manager: &OrderLifecycleManager) -> Vec<String> {
    manager
        .status()
        .await
        .open_positions
        .into_iter()
        .map(|(symbol, _, _, _)| symbol)
        .collect()
}

fn timeframe_minutes(timeframe: &str) -> u32 {
    let (value, unit) = timeframe.split_at(timeframe.len().saturating_sub(1));
    let n: u32 = value.parse().unwrap_or(3);
    match unit {
        "h" => n * 60,
        "d" => n * 1440,
        _ => n,
    }
}

/// Instant of the next entry-timeframe bar close, so scans fire right
/// after a candle finishes instead of at an arbitrary process-start
/// offset into the bar
fn next_bar_boundary(minutes: u32) -> Instant {
    let bar_secs = u64::from(minutes) * 60;
    let into_bar = u64::from(Utc::now().num_seconds_from_midnight()) % bar_secs;
    Instant::now() + Duration::from_secs(bar_secs - into_bar)
}

/// Entry scan: once per entry-timeframe bar close, check every symbol in
/// the universe for a setup and size/submit the ones that qualify. Each
/// symbol scans in its own task; one slow fetch never stalls the rest.
async fn scan_loop(
    feed: MarketDataFeed,
    manager: Arc<OrderLifecycleManager>,
    exchange: Arc<dyn ExchangeClient>,
    config: SharedConfig,
) {
    let minutes = timeframe_minutes(&config.snapshot().entry_timeframe);
    let mut ticker = interval_at(
        next_bar_boundary(minutes),
        Duration::from_secs(u64::from(minutes) * 60),
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!("💹 entry scan loop starting ({}m cadence, bar-aligned)", minutes);

    loop {
        ticker.tick().await;

        let cfg = config.snapshot();
        if cfg.is_paused {
            tracing::debug!("paused, skipping scan");
            continue;
        }
        if manager.is_halted() {
            tracing::debug!("halted, skipping scan");
            continue;
        }

        let tasks: Vec<_> = feed
            .symbols()
            .into_iter()
            .map(|symbol| {
                let feed = feed.clone();
                let manager = Arc::clone(&manager);
                let exchange = Arc::clone(&exchange);
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        scan_symbol(&feed, &manager, exchange.as_ref(), &config, &symbol).await
                    {
                        tracing::warn!("{}: scan failed: {}", symbol, e);
                    }
                })
            })
            .collect();

        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("symbol scan task panicked: {}", e);
            }
        }
    }
}

async fn scan_symbol(
    feed: &MarketDataFeed,
    manager: &OrderLifecycleManager,
    exchange: &dyn ExchangeClient,
    config: &SharedConfig,
    symbol: &str,
) -> Result<()> {
    if manager.is_tracked(symbol).await {
        return Ok(());
    }

    let cfg = config.snapshot();
    let entry_limit = cfg.atr_long_len + 60;

    let entry = feed
        .refresh_candles(symbol, &cfg.entry_timeframe, entry_limit)
        .await?;
    let htf = feed
        .refresh_candles(symbol, &cfg.htf_timeframe, HTF_CANDLE_LIMIT)
        .await?;
    let mtf = feed
        .refresh_candles(symbol, &cfg.mtf_timeframe, MTF_CANDLE_LIMIT)
        .await?;

    if entry.len() < 2 {
        return Ok(());
    }
    // Decide on closed bars only
    let closed = &entry[..entry.len() - 1];

    let (open_longs, open_shorts) = manager.direction_counts().await;
    let view = MarketView {
        entry_candles: closed,
        htf_candles: &htf,
        mtf_candles: &mtf,
        order_flow: None,
        session_age_bars: session_age_bars(timeframe_minutes(&cfg.entry_timeframe)),
        open_longs,
        open_shorts,
    };

    let (side, reason) = match StrategyEngine::check_entry(&view, &cfg) {
        EntryDecision::Enter { side, reason } => (side, reason),
        EntryDecision::Skip { reason } => {
            tracing::debug!("{}: skip - {}", symbol, reason);
            return Ok(());
        }
    };

    tracing::info!("🎯 {}: {} setup - {}", symbol, side, reason);

    let atr = match calculate_atr(closed, ATR_PERIOD) {
        Some(atr) => atr,
        None => return Ok(()),
    };
    let last_close = match closed.last() {
        Some(c) => c.close,
        None => return Ok(()),
    };

    let balance = with_backoff("fetch_balance", 2, || exchange.fetch_balance_usdt()).await?;
    let meta = exchange.instrument_meta(symbol).await?;

    let sizer = RiskSizer {
        risk_fraction: cfg.risk_fraction,
        leverage: cfg.leverage,
        min_order_notional: cfg.min_order_notional,
        sl_atr_mult: cfg.sl_atr_mult,
        tp_atr_mult: cfg.tp_atr_mult,
    };
    let size = match sizer.size(balance, last_close, atr, side == Side::Long, &meta) {
        Some(s) => s,
        None => {
            tracing::info!("{}: setup found but sizing rejected it", symbol);
            return Ok(());
        }
    };

    // Mean-reversion fades rest at the trigger close and wait for price
    // to come back; momentum entries cross the spread immediately
    if !cfg.dry_run && reason.starts_with("range") {
        manager
            .place_limit_entry(symbol, side, last_close, size.quantity, atr)
            .await?;
    } else {
        manager
            .place_entry(symbol, side, size.quantity, atr, &reason)
            .await?;
    }
    Ok(())
}

/// Refresh the tradable universe periodically, never dropping symbols
/// with live tracked state
async fn symbol_refresh_loop(
    feed: MarketDataFeed,
    manager: Arc<OrderLifecycleManager>,
    config: SharedConfig,
) {
    let mut ticker = interval(Duration::from_secs(SYMBOL_REFRESH_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // first refresh already ran in main

    loop {
        ticker.tick().await;

        let keep = tracked_symbols(&manager).await;
        if let Err(e) = feed
            .refresh_top_symbols(config.snapshot().top_symbol_limit, &keep)
            .await
        {
            tracing::error!("symbol refresh failed: {}", e);
        }
    }
}
