// =============================================================================
// Scheduler — strategy cadences, global risk gate, resolution sweep
// =============================================================================
//
// One loop per enabled strategy:
//
//   LatencyArbitrage   1 s            impulse windows are short
//   YesNoArbitrage     book-driven    plus a 30 s fallback scan
//   NearResolved       5 min
//   SpreadTrading      order_refresh_seconds
//   RangeCoverage      5 min
//
// Each tick: scan → rank by confidence × expected profit → risk gate →
// dispatch to the executor. Signals below per-strategy floors are silently
// dropped. When `equity − initial_capital < −max_daily_loss` the session
// halts: no new signals are accepted, in-flight executions finalize, and the
// process exits with code 2.
//
// The resolution sweep runs independently: refresh every market we are
// exposed to, and realize payouts for the ones the registry now reports
// resolved. Payouts apply to the ledger before the refreshed market record
// becomes visible to detectors.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::detectors;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::journal::{JournalEvent, JournalHandle, NotificationKind};
use crate::ledger::Ledger;
use crate::market_data::{BookManager, PriceAggregator};
use crate::registry::MarketRegistry;
use crate::types::{StrategyId, TradeSignal};

/// Latency scans run on this cadence.
const LATENCY_SCAN_SECS: u64 = 1;
/// Minimum spacing between book-driven parity scans.
const PARITY_DEBOUNCE_MS: u64 = 100;
/// Parity fallback cadence when the book stream is quiet.
const PARITY_FALLBACK_SECS: u64 = 30;
/// Slow-moving strategies scan on this cadence.
const SLOW_SCAN_SECS: u64 = 300;

/// How the session ended; maps to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Duration elapsed or shutdown signal. Exit 0.
    Completed,
    /// Risk limit breached. Exit 2.
    RiskHalt,
}

pub struct Scheduler {
    config: Config,
    registry: Arc<MarketRegistry>,
    books: Arc<BookManager>,
    aggregator: Arc<PriceAggregator>,
    ledger: Arc<Ledger>,
    executor: Arc<Executor>,
    journal: JournalHandle,
    risk_halted: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        registry: Arc<MarketRegistry>,
        books: Arc<BookManager>,
        aggregator: Arc<PriceAggregator>,
        ledger: Arc<Ledger>,
        executor: Arc<Executor>,
        journal: JournalHandle,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            registry,
            books,
            aggregator,
            ledger,
            executor,
            journal,
            risk_halted: AtomicBool::new(false),
            stop_tx,
        })
    }

    pub fn is_halted(&self) -> bool {
        self.risk_halted.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Session loop
    // -------------------------------------------------------------------------

    /// Run every strategy loop plus the resolution sweep until shutdown,
    /// duration expiry, or a risk halt.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        duration_hours: f64,
    ) -> SessionEnd {
        let mut tasks = JoinSet::new();
        let strategies = self.config.strategies.clone();
        let slow_scan = self
            .config
            .scan_interval_seconds
            .unwrap_or(SLOW_SCAN_SECS)
            .max(1);

        if strategies.latency_arbitrage.enabled {
            tasks.spawn(self.clone().interval_loop(
                StrategyId::LatencyArbitrage,
                Duration::from_secs(LATENCY_SCAN_SECS),
            ));
        }
        if strategies.yes_no_arbitrage.enabled {
            tasks.spawn(self.clone().parity_loop());
        }
        if strategies.near_resolved_sniping.enabled {
            tasks.spawn(self.clone().interval_loop(
                StrategyId::NearResolvedSniping,
                Duration::from_secs(slow_scan),
            ));
        }
        if strategies.spread_trading.enabled {
            tasks.spawn(self.clone().interval_loop(
                StrategyId::SpreadTrading,
                Duration::from_secs(strategies.spread_trading.order_refresh_seconds.max(1)),
            ));
        }
        if strategies.range_coverage.enabled {
            tasks.spawn(self.clone().interval_loop(
                StrategyId::RangeCoverage,
                Duration::from_secs(slow_scan),
            ));
        }
        tasks.spawn(self.clone().resolution_sweep_loop());

        info!(
            dry_run = self.executor.is_dry_run(),
            duration_hours, "scheduler running"
        );

        // A halt raised before this point (e.g. during wiring) ends the
        // session immediately; the watch below only reports later changes.
        if self.is_halted() {
            tasks.shutdown().await;
            return SessionEnd::RiskHalt;
        }

        let mut halt_watch = self.stop_tx.subscribe();
        let deadline = if duration_hours > 0.0 {
            Some(tokio::time::Instant::now() + Duration::from_secs_f64(duration_hours * 3600.0))
        } else {
            None
        };

        let outcome = tokio::select! {
            _ = shutdown.changed() => {
                info!("shutdown signal received, stopping scheduler");
                SessionEnd::Completed
            }
            _ = halt_watch.changed() => SessionEnd::RiskHalt,
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    // No deadline: park forever.
                    None => std::future::pending::<()>().await,
                }
            } => {
                info!("session duration reached");
                SessionEnd::Completed
            }
        };

        // Stop accepting new signals; in-flight executor calls already hold
        // their reservations and finalize inside the aborting tasks' awaits.
        let _ = self.stop_tx.send(true);
        tasks.shutdown().await;

        outcome
    }

    async fn interval_loop(self: Arc<Self>, strategy: StrategyId, period: Duration) {
        let mut stop = self.stop_tx.subscribe();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(strategy).await,
                _ = stop.changed() => return,
            }
        }
    }

    /// Parity runs on the book stream (debounced) with an interval fallback.
    async fn parity_loop(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let mut books_rx = self.books.snapshots();
        let mut fallback = tokio::time::interval(Duration::from_secs(PARITY_FALLBACK_SECS));
        fallback.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_scan = tokio::time::Instant::now() - Duration::from_secs(1);

        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = fallback.tick() => self.tick(StrategyId::YesNoArbitrage).await,
                event = books_rx.recv() => {
                    match event {
                        Ok(_) => {
                            if last_scan.elapsed() >= Duration::from_millis(PARITY_DEBOUNCE_MS) {
                                last_scan = tokio::time::Instant::now();
                                self.tick(StrategyId::YesNoArbitrage).await;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "parity loop lagged behind book stream");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Scan and dispatch
    // -------------------------------------------------------------------------

    async fn tick(&self, strategy: StrategyId) {
        if self.is_halted() || !self.risk_check() {
            return;
        }
        let signals = self.scan(strategy);
        if signals.is_empty() {
            return;
        }
        self.dispatch(strategy, signals).await;
    }

    fn scan(&self, strategy: StrategyId) -> Vec<TradeSignal> {
        let now_ms = Utc::now().timestamp_millis();
        let ledger = self.ledger.snapshot();
        let strategies = &self.config.strategies;
        match strategy {
            StrategyId::LatencyArbitrage => detectors::latency_lag::scan(
                &self.registry,
                &self.books,
                &self.aggregator,
                &strategies.latency_arbitrage,
                now_ms,
            ),
            StrategyId::YesNoArbitrage => detectors::parity::scan(
                &self.registry,
                &self.books,
                &ledger,
                &strategies.yes_no_arbitrage,
                now_ms,
            ),
            StrategyId::NearResolvedSniping => detectors::near_resolved::scan(
                &self.registry,
                &self.books,
                &ledger,
                &strategies.near_resolved_sniping,
                now_ms,
            ),
            StrategyId::SpreadTrading => detectors::spread_making::scan(
                &self.registry,
                &self.books,
                &ledger,
                &strategies.spread_trading,
                now_ms,
            ),
            StrategyId::RangeCoverage => detectors::range_coverage::scan(
                &self.registry,
                &self.books,
                &strategies.range_coverage,
                now_ms,
            ),
        }
    }

    async fn dispatch(&self, strategy: StrategyId, signals: Vec<TradeSignal>) {
        let (min_confidence, min_profit) = self.floors(strategy);
        let ranked = rank_signals(signals);

        for signal in ranked {
            if self.is_halted() || !self.risk_check() {
                return;
            }
            if !signal.is_actionable(min_confidence, min_profit) {
                continue;
            }
            let signal = self.apply_kelly_ceiling(signal);

            match self.execute_with_retry(&signal).await {
                Ok(report) => {
                    debug!(
                        strategy = %strategy,
                        market_id = %signal.market_id,
                        legs = report.fills.len(),
                        "signal executed"
                    );
                }
                Err(EngineError::InsufficientCapital { requested, available }) => {
                    // Not an error condition; capital is simply committed.
                    debug!(
                        strategy = %strategy,
                        requested = %requested,
                        available = %available,
                        "signal dropped, capital fully committed"
                    );
                }
                Err(e @ EngineError::InvariantViolation(_)) => {
                    warn!(error = %e, "ledger invariant violated, halting session");
                    self.halt(&e.to_string());
                    return;
                }
                Err(e) => {
                    debug!(strategy = %strategy, error = %e, "signal dropped");
                }
            }
        }
    }

    /// Cap high-certainty bets at the fractional-Kelly stake. Advisory only:
    /// a zero Kelly (no edge by its measure) leaves the detector's own
    /// sizing in place rather than vetoing the signal.
    fn apply_kelly_ceiling(&self, mut signal: TradeSignal) -> TradeSignal {
        let cfg = &self.config.strategies.compounding_bets;
        if signal.confidence < cfg.min_certainty || signal.price <= Decimal::ZERO {
            return signal;
        }
        let available = self.ledger.snapshot().available_capital;
        let ceiling = crate::sizing::compound_size(
            available,
            signal.confidence,
            signal.expected_profit_pct,
            cfg,
        );
        let cost = signal.price * signal.size;
        if ceiling > Decimal::ZERO && cost > ceiling {
            debug!(
                strategy = %signal.strategy,
                cost = %cost,
                ceiling = %ceiling,
                "signal capped at fractional-Kelly stake"
            );
            signal.size = ceiling / signal.price;
        }
        signal
    }

    /// One retry on transient transport errors; everything else is final.
    async fn execute_with_retry(
        &self,
        signal: &TradeSignal,
    ) -> Result<crate::executor::ExecutionReport, EngineError> {
        match self.executor.execute(signal).await {
            Err(e) if e.is_retryable() => {
                debug!(error = %e, "transient execution error, retrying once");
                self.executor.execute(signal).await
            }
            other => other,
        }
    }

    // -------------------------------------------------------------------------
    // Risk gate
    // -------------------------------------------------------------------------

    /// True while the session loss stays inside the daily limit.
    fn risk_check(&self) -> bool {
        let snap = self.ledger.snapshot();
        let loss = snap.current_equity - snap.initial_capital;
        if loss < -self.config.risk.max_daily_loss {
            self.halt(&format!(
                "max daily loss breached: equity {} vs initial {} (limit {})",
                snap.current_equity, snap.initial_capital, self.config.risk.max_daily_loss
            ));
            return false;
        }
        true
    }

    fn halt(&self, reason: &str) {
        if self.risk_halted.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(reason, "risk halt: no further signals will be accepted");
        self.journal.notify(NotificationKind::Error, reason.to_string());
        let _ = self.stop_tx.send(true);
    }

    /// Per-strategy actionability floors.
    fn floors(&self, strategy: StrategyId) -> (f64, Decimal) {
        let s = &self.config.strategies;
        match strategy {
            StrategyId::LatencyArbitrage => {
                (s.latency_arbitrage.min_confidence, Decimal::ZERO)
            }
            StrategyId::YesNoArbitrage => {
                (s.yes_no_arbitrage.min_confidence, s.yes_no_arbitrage.min_spread)
            }
            StrategyId::NearResolvedSniping => (
                s.near_resolved_sniping.min_confidence,
                s.near_resolved_sniping.min_yield,
            ),
            StrategyId::SpreadTrading => (s.spread_trading.min_confidence, Decimal::ZERO),
            StrategyId::RangeCoverage => (
                s.range_coverage.min_confidence,
                s.range_coverage.target_profit_pct,
            ),
        }
    }

    // -------------------------------------------------------------------------
    // Resolution sweep
    // -------------------------------------------------------------------------

    async fn resolution_sweep_loop(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.resolution_sweep_seconds.max(1),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep_once().await,
                _ = stop.changed() => return,
            }
        }
    }

    /// Settle every exposed market the registry now reports resolved.
    pub async fn sweep_once(&self) {
        for (market_id, winning_token) in self.resolved_exposures() {
            match self.ledger.apply_resolution(&market_id, &winning_token) {
                Ok(delta) => {
                    info!(
                        market_id = %market_id,
                        realized = %delta.realized_pnl,
                        closed = delta.closed_positions,
                        "resolution settled"
                    );
                    let kind = if delta.realized_pnl >= Decimal::ZERO {
                        NotificationKind::Profit
                    } else {
                        NotificationKind::Warning
                    };
                    self.journal.notify(
                        kind,
                        format!("market {market_id} resolved, pnl {}", delta.realized_pnl),
                    );
                    self.journal.record(JournalEvent::Performance {
                        ts_ms: Utc::now().timestamp_millis(),
                        strategy: StrategyId::NearResolvedSniping,
                        metric: "resolution_pnl".to_string(),
                        value: rust_decimal::prelude::ToPrimitive::to_f64(&delta.realized_pnl)
                            .unwrap_or(0.0),
                    });
                }
                Err(e) => {
                    warn!(market_id = %market_id, error = %e, "resolution settle failed");
                    self.halt(&e.to_string());
                    return;
                }
            }
        }
    }

    /// Exposed markets whose registry record is resolved with a known
    /// winning token.
    fn resolved_exposures(&self) -> Vec<(String, String)> {
        self.ledger
            .exposed_markets()
            .into_iter()
            .filter_map(|market_id| {
                let market = self.registry.by_id(&market_id)?;
                if !market.is_resolved() {
                    return None;
                }
                let winner = market.winning_token()?.to_string();
                Some((market_id, winner))
            })
            .collect()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("halted", &self.is_halted())
            .finish()
    }
}

/// Rank candidate signals best-first by confidence × expected profit.
pub fn rank_signals(mut signals: Vec<TradeSignal>) -> Vec<TradeSignal> {
    signals.sort_by(|a, b| {
        b.rank()
            .partial_cmp(&a.rank())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clob::{ClobClient, ClobCredentials, TokenBucket};
    use crate::ledger::{LegFill, PositionSide};
    use crate::types::{Side, SignalPayload, SignalType};
    use rust_decimal_macros::dec;

    fn scheduler_with_capital(
        initial: Decimal,
        max_daily_loss: Decimal,
    ) -> (Arc<Scheduler>, Arc<Ledger>) {
        let mut config = Config::default();
        config.risk.max_daily_loss = max_daily_loss;
        let ledger = Arc::new(Ledger::new(initial));
        let client = Arc::new(ClobClient::new(
            ClobCredentials::default(),
            TokenBucket::new(100.0, 10),
        ));
        let (journal, _worker) = crate::journal::spawn_journal(vec![], vec![]);
        let executor = Arc::new(Executor::new(
            client,
            ledger.clone(),
            journal.clone(),
            true,
            config.risk.max_position_size,
        ));
        let scheduler = Scheduler::new(
            config,
            Arc::new(MarketRegistry::new()),
            Arc::new(BookManager::new()),
            Arc::new(PriceAggregator::new(0.02, 60_000)),
            ledger.clone(),
            executor,
            journal,
        );
        (scheduler, ledger)
    }

    fn signal(confidence: f64, profit: Decimal) -> TradeSignal {
        TradeSignal {
            strategy: StrategyId::NearResolvedSniping,
            signal_type: SignalType::Buy,
            market_id: "m".into(),
            token_id: "tok".into(),
            side_label: "YES".into(),
            price: dec!(0.97),
            size: dec!(10),
            confidence,
            expected_profit_pct: profit,
            reason: String::new(),
            payload: SignalPayload::Directional { token_id: "tok".into() },
            ts_ms: 0,
        }
    }

    #[tokio::test]
    async fn risk_check_passes_inside_the_limit() {
        // S6 setup one dollar shy of the limit: loss 499 < 500.
        let (scheduler, ledger) = scheduler_with_capital(dec!(10000), dec!(500));
        let res = ledger.reserve(dec!(499)).unwrap();
        ledger
            .apply_fill(
                res,
                &[LegFill {
                    market_id: "m".into(),
                    token_id: "tok".into(),
                    side: Side::Buy,
                    position_side: PositionSide::Yes,
                    price: dec!(0.50),
                    size: dec!(998),
                }],
                StrategyId::NearResolvedSniping,
                1,
            )
            .unwrap();
        ledger.apply_resolution("m", "other").unwrap();

        // Equity 9501: inside the limit.
        assert!(scheduler.risk_check());
        assert!(!scheduler.is_halted());
    }

    #[tokio::test]
    async fn risk_halt_trips_past_the_limit() {
        // S6: initial 10,000, max daily loss 500, equity falls to 9,499.
        let (scheduler, ledger) = scheduler_with_capital(dec!(10000), dec!(500));
        let res = ledger.reserve(dec!(501)).unwrap();
        ledger
            .apply_fill(
                res,
                &[LegFill {
                    market_id: "m".into(),
                    token_id: "tok".into(),
                    side: Side::Buy,
                    position_side: PositionSide::Yes,
                    price: dec!(0.501),
                    size: dec!(1000),
                }],
                StrategyId::NearResolvedSniping,
                1,
            )
            .unwrap();
        ledger.apply_resolution("m", "other").unwrap();

        assert!(!scheduler.risk_check());
        assert!(scheduler.is_halted());

        // Halted scheduler refuses further ticks without dispatching.
        scheduler.tick(StrategyId::NearResolvedSniping).await;
        assert!(scheduler.is_halted());
    }

    #[tokio::test]
    async fn halted_run_returns_risk_halt() {
        let (scheduler, ledger) = scheduler_with_capital(dec!(10000), dec!(500));
        let res = ledger.reserve(dec!(600)).unwrap();
        ledger
            .apply_fill(
                res,
                &[LegFill {
                    market_id: "m".into(),
                    token_id: "tok".into(),
                    side: Side::Buy,
                    position_side: PositionSide::Yes,
                    price: dec!(0.60),
                    size: dec!(1000),
                }],
                StrategyId::NearResolvedSniping,
                1,
            )
            .unwrap();
        ledger.apply_resolution("m", "other").unwrap();
        assert!(!scheduler.risk_check());

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let end = scheduler.run(shutdown_rx, 1.0).await;
        assert_eq!(end, SessionEnd::RiskHalt);
    }

    #[tokio::test]
    async fn shutdown_signal_completes_the_session() {
        let (scheduler, _ledger) = scheduler_with_capital(dec!(10000), dec!(500));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(shutdown_rx, 0.0));
        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), SessionEnd::Completed);
    }

    #[tokio::test]
    async fn kelly_ceiling_caps_fat_edged_high_certainty_bets() {
        let (scheduler, _ledger) = scheduler_with_capital(dec!(10000), dec!(5000));
        // Confidence 0.99 at 2:1 edge: half-Kelly wants ~49% but the 10%
        // position cap binds, so the stake ceiling is $1,000.
        let mut fat = signal(0.99, dec!(2));
        fat.price = dec!(0.5);
        fat.size = dec!(10000); // $5,000 cost before the cap
        let capped = scheduler.apply_kelly_ceiling(fat);
        assert_eq!(capped.size, dec!(1000) / dec!(0.5));

        // Below min_certainty the ceiling never applies.
        let mut modest = signal(0.80, dec!(2));
        modest.price = dec!(0.5);
        modest.size = dec!(10000);
        let untouched = scheduler.apply_kelly_ceiling(modest);
        assert_eq!(untouched.size, dec!(10000));

        // A zero Kelly leaves the detector's sizing alone.
        let mut thin = signal(0.96, dec!(0.01));
        thin.price = dec!(0.96);
        thin.size = dec!(100);
        let unchanged = scheduler.apply_kelly_ceiling(thin);
        assert_eq!(unchanged.size, dec!(100));
    }

    #[test]
    fn ranking_orders_by_confidence_times_profit() {
        let ranked = rank_signals(vec![
            signal(0.5, dec!(0.02)),
            signal(0.9, dec!(0.05)),
            signal(0.9, dec!(0.01)),
        ]);
        assert!((ranked[0].confidence - 0.9).abs() < 1e-12);
        assert_eq!(ranked[0].expected_profit_pct, dec!(0.05));
        assert_eq!(ranked[2].expected_profit_pct, dec!(0.02));
    }

    #[tokio::test]
    async fn sweep_settles_resolved_exposures_via_registry() {
        let (scheduler, ledger) = scheduler_with_capital(dec!(10000), dec!(5000));
        let res = ledger.reserve(dec!(97)).unwrap();
        ledger
            .apply_fill(
                res,
                &[LegFill {
                    market_id: "m1".into(),
                    token_id: "tok-yes".into(),
                    side: Side::Buy,
                    position_side: PositionSide::Yes,
                    price: dec!(0.97),
                    size: dec!(100),
                }],
                StrategyId::NearResolvedSniping,
                1,
            )
            .unwrap();

        // Not resolved yet: nothing to settle.
        assert!(scheduler.resolved_exposures().is_empty());

        scheduler.registry.update_from_catalog(&[serde_json::json!({
            "id": "m1",
            "question": "Near certain",
            "resolved": true,
            "resolvedOutcome": "Yes",
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["tok-yes", "tok-no"],
            "outcomePrices": ["1", "0"],
        })]);

        assert_eq!(
            scheduler.resolved_exposures(),
            vec![("m1".to_string(), "tok-yes".to_string())]
        );
        scheduler.sweep_once().await;
        let snap = ledger.snapshot();
        assert!(snap.positions.is_empty());
        assert_eq!(snap.available_capital, dec!(10003));
        assert_eq!(snap.win_count, 1);
    }
}
