// =============================================================================
// Wanchai Arbitrage Bot — Main Entry Point
// =============================================================================
//
// Wires the market-data plane (exchange feeds + CLOB books + registry) into
// the strategy scheduler and executor, then runs the session to completion.
//
// Exit codes: 0 = normal session completion, 1 = unrecoverable init failure,
// 2 = risk-limit halt.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod clob;
mod config;
mod detectors;
mod error;
mod executor;
mod journal;
mod ledger;
mod market_data;
mod registry;
mod scheduler;
mod sizing;
mod types;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::clob::{ClobClient, ClobCredentials, TokenBucket};
use crate::config::Config;
use crate::executor::Executor;
use crate::journal::{JournalEvent, LogJournalSink, NotificationKind};
use crate::ledger::Ledger;
use crate::market_data::{BookManager, FeedHandle, PriceAggregator};
use crate::registry::MarketRegistry;
use crate::scheduler::{Scheduler, SessionEnd};

/// Binance combined-stream endpoint.
const BINANCE_STREAM_BASE: &str = "wss://stream.binance.com:9443/stream";
/// CLOB market-channel endpoint.
const CLOB_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";
/// Tokens tracked on one market WebSocket connection.
const MAX_TRACKED_TOKENS: usize = 50;

#[derive(Debug, Parser)]
#[command(name = "wanchai-bot", about = "Prediction-market arbitrage engine")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config/config.yaml")]
    config: String,

    /// Initial capital in USD.
    #[arg(long, default_value_t = 10000.0)]
    capital: f64,

    /// Session length in hours; 0 runs indefinitely.
    #[arg(long, default_value_t = 24.0)]
    duration: f64,

    /// Default scan cadence in seconds for the slow strategies.
    #[arg(long)]
    interval: Option<u64>,

    /// Run in live mode (default is dry run).
    #[arg(long)]
    live: bool,
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) if cli.config == "config/config.yaml" => {
            // The default path is optional; an explicit --config is not.
            warn!(error = %e, "no config file, using defaults");
            Config::default()
        }
        Err(e) => {
            error!(error = %e, path = %cli.config, "failed to load config");
            return 1;
        }
    };
    if cli.live {
        config.bot.dry_run = false;
    }
    if cli.interval.is_some() {
        config.scan_interval_seconds = cli.interval;
    }

    let Some(initial_capital) = Decimal::from_f64(cli.capital).filter(|c| *c > Decimal::ZERO)
    else {
        error!(capital = cli.capital, "initial capital must be positive");
        return 1;
    };

    info!(
        bot = %config.bot.name,
        dry_run = config.bot.dry_run,
        capital = %initial_capital,
        duration_hours = cli.duration,
        symbols = ?config.symbols,
        "starting up"
    );

    // ── 2. Shutdown signal ───────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // ── 3. Journal / notifier channel ────────────────────────────────────
    let (journal, journal_worker) =
        journal::spawn_journal(vec![Box::new(LogJournalSink)], vec![Box::new(LogJournalSink)]);
    journal.record(JournalEvent::SessionStart {
        ts_ms: chrono::Utc::now().timestamp_millis(),
        initial_capital,
        config: serde_json::to_value(&config).unwrap_or_default(),
    });

    // ── 4. CLOB client & market registry ─────────────────────────────────
    let client = Arc::new(ClobClient::new(
        ClobCredentials::from_env(),
        TokenBucket::new(
            config.rate_limit.requests_per_second,
            config.rate_limit.burst,
        ),
    ));
    let registry = Arc::new(MarketRegistry::new());
    match client.get_markets(500, 0, true).await {
        Ok(records) => {
            registry.update_from_catalog(&records);
            info!(markets = registry.len(), "initial market catalog loaded");
        }
        Err(e) => warn!(error = %e, "initial catalog fetch failed, polling will retry"),
    }
    tokio::spawn(registry::run_registry_poll(
        registry.clone(),
        client.clone(),
        config.market_refresh_seconds,
        shutdown_rx.clone(),
    ));

    // ── 5. Exchange price feeds & aggregator ─────────────────────────────
    let aggregator = Arc::new(PriceAggregator::new(
        config.strategies.latency_arbitrage.min_price_deviation,
        config.strategies.latency_arbitrage.impulse_window_ms,
    ));
    let binance = Arc::new(FeedHandle::new("binance", config.symbols.clone()));
    aggregator.add_exchange(binance.clone());
    tokio::spawn(market_data::price_feed::run_feed_stream(
        binance.clone(),
        BINANCE_STREAM_BASE,
    ));
    tokio::spawn(market_data::aggregator::run_feed_consumer(
        aggregator.clone(),
        binance.clone(),
    ));
    for symbol in &config.symbols {
        aggregator.subscribe(symbol);
    }
    info!(symbols = config.symbols.len(), "price feeds launched");

    // ── 6. CLOB order books ──────────────────────────────────────────────
    let books = Arc::new(BookManager::new());
    tokio::spawn(run_clob_books(
        books.clone(),
        registry.clone(),
        shutdown_rx.clone(),
    ));

    // ── 7. Ledger, executor, scheduler ───────────────────────────────────
    let ledger = Arc::new(Ledger::new(initial_capital));
    let executor = Arc::new(Executor::new(
        client.clone(),
        ledger.clone(),
        journal.clone(),
        config.bot.dry_run,
        config.risk.max_position_size,
    ));
    let scheduler = Scheduler::new(
        config.clone(),
        registry.clone(),
        books.clone(),
        aggregator.clone(),
        ledger.clone(),
        executor,
        journal.clone(),
    );

    journal.notify(
        NotificationKind::Info,
        format!(
            "{} session started with ${initial_capital} ({})",
            config.bot.name,
            if config.bot.dry_run { "dry run" } else { "LIVE" }
        ),
    );

    // ── 8. Run the session ───────────────────────────────────────────────
    let end = scheduler.clone().run(shutdown_rx, cli.duration).await;

    let snap = ledger.snapshot();
    journal.record(JournalEvent::SessionEnd {
        ts_ms: chrono::Utc::now().timestamp_millis(),
        final_capital: snap.current_equity,
        total_trades: snap.trade_count,
        total_profit: snap.cumulative_realized,
        win_rate: snap.win_rate(),
    });
    info!(
        final_equity = %snap.current_equity,
        realized = %snap.cumulative_realized,
        trades = snap.trade_count,
        win_rate = snap.win_rate(),
        "session finished"
    );

    // Drop our journal handle and wait for the queue to drain.
    drop(journal);
    drop(scheduler);
    let _ = journal_worker.await;

    match end {
        SessionEnd::Completed => 0,
        SessionEnd::RiskHalt => 2,
    }
}

/// Keep a market WebSocket running over the tokens of every tracked
/// Bitcoin market, reconnecting when the token set changes or the stream
/// drops.
async fn run_clob_books(
    books: Arc<BookManager>,
    registry: Arc<MarketRegistry>,
    shutdown: watch::Receiver<bool>,
) {
    let mut backoff = 1u64;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let tokens = tracked_tokens(&registry);
        if tokens.is_empty() {
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        }

        // Stale ladders from a previous connection cannot be trusted; the
        // subscribe handshake delivers a fresh snapshot per token.
        for token in &tokens {
            books.reset(token);
        }

        match clob::ws::run_market_stream(CLOB_WS_URL, &tokens, &books).await {
            Ok(()) => {
                backoff = 1;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                warn!(error = %e, retry_in_secs = backoff, "market stream error");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(60);
            }
        }
    }
}

/// Tokens worth streaming: every outcome of the active Bitcoin markets,
/// bounded per connection.
fn tracked_tokens(registry: &MarketRegistry) -> Vec<String> {
    let mut tokens: Vec<String> = registry
        .bitcoin_markets()
        .iter()
        .flat_map(|m| m.outcomes.iter().map(|o| o.token_id.clone()))
        .filter(|t| !t.is_empty())
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens.truncate(MAX_TRACKED_TOKENS);
    tokens
}
