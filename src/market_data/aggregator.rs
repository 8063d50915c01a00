// =============================================================================
// Price Aggregator — merges per-exchange feeds, detects impulses
// =============================================================================
//
// Consumes every feed's broadcast channel, keeps the freshest update per
// (symbol, exchange), and derives cross-venue best bid/ask. Two event kinds
// are published:
//
//   PriceImpulse            — a move of ≥ threshold within the rolling window,
//                             confidence-weighted by how many exchanges agree.
//   CrossExchangeOpportunity — advisory bid/ask dislocation between venues.
//                             Never routed to the CLOB executor.
//
// Within a single symbol consumers observe updates in timestamp order; no
// ordering is guaranteed across symbols.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::types::{CrossExchangeOpportunity, Direction, PriceImpulse, PriceUpdate, Side};

use super::price_feed::FeedHandle;

/// Mid-price points retained per symbol for impulse detection.
const HISTORY_CAP: usize = 1000;
/// Impulses retained for the latency-arbitrage detector to query.
const IMPULSE_CAP: usize = 100;
/// Momentum lookback used when counting confirming exchanges.
const CONFIRM_LOOKBACK: usize = 50;
/// Minimum cross-venue edge worth flagging (0.1 %).
const CROSS_EXCHANGE_MIN_EDGE: Decimal = dec!(0.001);

/// Freshest update per exchange for one symbol, with cross-venue derived
/// fields.
#[derive(Debug, Clone, Default)]
pub struct AggregatedPrice {
    pub symbol: String,
    pub ts_ms: i64,
    pub exchanges: HashMap<String, PriceUpdate>,
}

impl AggregatedPrice {
    /// Highest bid across venues, with the owning exchange.
    pub fn best_bid(&self) -> Option<(Decimal, String)> {
        self.exchanges
            .iter()
            .max_by_key(|(_, u)| u.bid)
            .map(|(name, u)| (u.bid, name.clone()))
    }

    /// Lowest ask across venues, with the owning exchange.
    pub fn best_ask(&self) -> Option<(Decimal, String)> {
        self.exchanges
            .iter()
            .min_by_key(|(_, u)| u.ask)
            .map(|(name, u)| (u.ask, name.clone()))
    }

    pub fn avg_price(&self) -> Decimal {
        if self.exchanges.is_empty() {
            return Decimal::ZERO;
        }
        let sum: Decimal = self.exchanges.values().map(|u| u.mid()).sum();
        sum / Decimal::from(self.exchanges.len())
    }

    /// Widest mid-price difference between venues.
    pub fn price_spread(&self) -> Decimal {
        if self.exchanges.len() < 2 {
            return Decimal::ZERO;
        }
        let mids: Vec<Decimal> = self.exchanges.values().map(|u| u.mid()).collect();
        let max = mids.iter().max().copied().unwrap_or_default();
        let min = mids.iter().min().copied().unwrap_or_default();
        max - min
    }

    pub fn spread_pct(&self) -> Decimal {
        let avg = self.avg_price();
        if avg > Decimal::ZERO {
            self.price_spread() / avg
        } else {
            Decimal::ZERO
        }
    }
}

/// Per-exchange price statistics for one symbol.
#[derive(Debug, Clone)]
pub struct PriceDeviation {
    pub min: Decimal,
    pub max: Decimal,
    pub avg: Decimal,
    pub spread: Decimal,
    pub spread_pct: Decimal,
    pub per_exchange: HashMap<String, Decimal>,
}

#[derive(Debug, Clone)]
struct HistoryPoint {
    ts_ms: i64,
    price: Decimal,
}

struct AggregatorState {
    prices: HashMap<String, AggregatedPrice>,
    history: HashMap<String, VecDeque<HistoryPoint>>,
    recent_impulses: VecDeque<PriceImpulse>,
}

/// Fans a set of [`FeedHandle`]s together.
pub struct PriceAggregator {
    feeds: RwLock<Vec<Arc<FeedHandle>>>,
    state: RwLock<AggregatorState>,
    impulse_tx: broadcast::Sender<PriceImpulse>,
    cross_tx: broadcast::Sender<CrossExchangeOpportunity>,
    /// Impulse threshold as a fraction (0.02 = 2 %). Configuration, not a
    /// constant.
    threshold_pct: f64,
    /// Rolling impulse window in milliseconds.
    window_ms: i64,
}

impl PriceAggregator {
    pub fn new(threshold_pct: f64, window_ms: i64) -> Self {
        let (impulse_tx, _) = broadcast::channel(256);
        let (cross_tx, _) = broadcast::channel(256);
        Self {
            feeds: RwLock::new(Vec::new()),
            state: RwLock::new(AggregatorState {
                prices: HashMap::new(),
                history: HashMap::new(),
                recent_impulses: VecDeque::new(),
            }),
            impulse_tx,
            cross_tx,
            threshold_pct,
            window_ms,
        }
    }

    pub fn add_exchange(&self, feed: Arc<FeedHandle>) {
        info!(exchange = %feed.name(), "exchange added to aggregator");
        self.feeds.write().push(feed);
    }

    pub fn remove_exchange(&self, name: &str) {
        self.feeds.write().retain(|f| f.name() != name);
    }

    /// Broadcast a subscription to every feed that supports the symbol.
    pub fn subscribe(&self, symbol: &str) {
        for feed in self.feeds.read().iter() {
            if feed.supports(symbol) {
                feed.subscribe(symbol);
            }
        }
    }

    pub fn impulses(&self) -> broadcast::Receiver<PriceImpulse> {
        self.impulse_tx.subscribe()
    }

    pub fn cross_exchange(&self) -> broadcast::Receiver<CrossExchangeOpportunity> {
        self.cross_tx.subscribe()
    }

    /// Best price across venues for the given order side: the lowest ask for
    /// a buy, the highest bid for a sell.
    pub fn best(&self, symbol: &str, side: Side) -> Option<(Decimal, String)> {
        let state = self.state.read();
        let agg = state.prices.get(symbol)?;
        match side {
            Side::Buy => agg.best_ask(),
            Side::Sell => agg.best_bid(),
        }
    }

    pub fn aggregated(&self, symbol: &str) -> Option<AggregatedPrice> {
        self.state.read().prices.get(symbol).cloned()
    }

    /// Cross-venue price statistics for `symbol`.
    pub fn deviation(&self, symbol: &str) -> Option<PriceDeviation> {
        let state = self.state.read();
        let agg = state.prices.get(symbol)?;
        if agg.exchanges.is_empty() {
            return None;
        }
        let mids: Vec<Decimal> = agg.exchanges.values().map(|u| u.mid()).collect();
        let min = mids.iter().min().copied().unwrap_or_default();
        let max = mids.iter().max().copied().unwrap_or_default();
        Some(PriceDeviation {
            min,
            max,
            avg: agg.avg_price(),
            spread: max - min,
            spread_pct: agg.spread_pct(),
            per_exchange: agg
                .exchanges
                .iter()
                .map(|(name, u)| (name.clone(), u.mid()))
                .collect(),
        })
    }

    /// Impulses observed within the last `window_ms` milliseconds of `now_ms`.
    pub fn recent_impulses(&self, now_ms: i64, window_ms: i64) -> Vec<PriceImpulse> {
        self.state
            .read()
            .recent_impulses
            .iter()
            .filter(|imp| now_ms - imp.ts_ms <= window_ms)
            .cloned()
            .collect()
    }

    /// Handle one inbound update from any feed. Updates the aggregate, the
    /// history ring, then runs impulse and cross-exchange checks.
    pub fn on_update(&self, update: PriceUpdate) {
        let symbol = update.symbol.clone();
        {
            let mut state = self.state.write();

            let agg = state.prices.entry(symbol.clone()).or_insert_with(|| {
                AggregatedPrice {
                    symbol: symbol.clone(),
                    ..Default::default()
                }
            });
            agg.ts_ms = update.ts_ms;
            agg.exchanges.insert(update.exchange.clone(), update.clone());

            let ring = state
                .history
                .entry(symbol.clone())
                .or_insert_with(|| VecDeque::with_capacity(HISTORY_CAP));
            if ring.len() == HISTORY_CAP {
                ring.pop_front();
            }
            ring.push_back(HistoryPoint {
                ts_ms: update.ts_ms,
                price: update.mid(),
            });
        }

        self.check_impulse(&update);
        self.check_cross_exchange(&symbol);
    }

    // -------------------------------------------------------------------------
    // Impulse detection
    // -------------------------------------------------------------------------

    /// Emit a [`PriceImpulse`] iff there is a history point at or before
    /// `update.ts_ms − window_ms` (falling back to the oldest point) whose
    /// price differs from the current one by at least the threshold.
    fn check_impulse(&self, update: &PriceUpdate) {
        let p_now = update.mid();
        let (p_then, effective_window) = {
            let state = self.state.read();
            let ring = match state.history.get(&update.symbol) {
                Some(r) if r.len() >= 2 => r,
                _ => return,
            };
            let cutoff = update.ts_ms - self.window_ms;
            // Walk backwards to the newest entry at or before the window start.
            let point = ring
                .iter()
                .rev()
                .find(|p| p.ts_ms <= cutoff)
                .or_else(|| ring.front())
                .cloned();
            match point {
                Some(p) => {
                    let span = update.ts_ms - p.ts_ms;
                    (p.price, span)
                }
                None => return,
            }
        };

        if p_then <= Decimal::ZERO {
            return;
        }
        let change_pct = ((p_now - p_then) / p_then).to_f64().unwrap_or(0.0);
        if change_pct.abs() < self.threshold_pct {
            return;
        }

        let direction = if change_pct > 0.0 {
            Direction::Up
        } else {
            Direction::Down
        };
        let confidence = self.confirmation_ratio(&update.symbol, direction);

        let impulse = PriceImpulse {
            symbol: update.symbol.clone(),
            exchange: update.exchange.clone(),
            direction,
            change_pct,
            from_price: p_then,
            to_price: p_now,
            window_ms: effective_window,
            ts_ms: update.ts_ms,
            confidence,
        };

        info!(
            symbol = %impulse.symbol,
            direction = %impulse.direction,
            change_pct = impulse.change_pct,
            confidence = impulse.confidence,
            "price impulse detected"
        );

        {
            let mut state = self.state.write();
            if state.recent_impulses.len() == IMPULSE_CAP {
                state.recent_impulses.pop_front();
            }
            state.recent_impulses.push_back(impulse.clone());
        }
        let _ = self.impulse_tx.send(impulse);
    }

    /// Fraction of tracked exchanges whose own momentum agrees with
    /// `direction`.
    fn confirmation_ratio(&self, symbol: &str, direction: Direction) -> f64 {
        let feeds = self.feeds.read();
        if feeds.is_empty() {
            return 1.0;
        }
        let confirmed = feeds
            .iter()
            .filter(|f| f.momentum(symbol, CONFIRM_LOOKBACK).direction == direction)
            .count();
        confirmed as f64 / feeds.len() as f64
    }

    // -------------------------------------------------------------------------
    // Cross-exchange dislocations
    // -------------------------------------------------------------------------

    /// Advisory signal when one venue's bid crosses another venue's ask by
    /// more than the minimum edge. Possible fiat-side hedge; not routed to
    /// the CLOB executor.
    fn check_cross_exchange(&self, symbol: &str) {
        let opportunity = {
            let state = self.state.read();
            let agg = match state.prices.get(symbol) {
                Some(a) if a.exchanges.len() >= 2 => a,
                _ => return,
            };
            let (best_bid, bid_exchange) = match agg.best_bid() {
                Some(b) => b,
                None => return,
            };
            let (best_ask, ask_exchange) = match agg.best_ask() {
                Some(a) => a,
                None => return,
            };
            if best_bid <= best_ask || bid_exchange == ask_exchange || best_ask <= Decimal::ZERO {
                return;
            }
            let profit_pct = (best_bid - best_ask) / best_ask;
            if profit_pct <= CROSS_EXCHANGE_MIN_EDGE {
                return;
            }
            CrossExchangeOpportunity {
                symbol: symbol.to_string(),
                buy_exchange: ask_exchange,
                buy_price: best_ask,
                sell_exchange: bid_exchange,
                sell_price: best_bid,
                profit_pct,
                ts_ms: agg.ts_ms,
            }
        };

        debug!(
            symbol,
            buy = %opportunity.buy_exchange,
            sell = %opportunity.sell_exchange,
            profit_pct = %opportunity.profit_pct,
            "cross-exchange dislocation"
        );
        let _ = self.cross_tx.send(opportunity);
    }
}

/// Pump one feed's broadcast channel into the aggregator until the channel
/// closes. Lagged receivers skip ahead with a warning rather than stalling
/// the feed.
pub async fn run_feed_consumer(aggregator: Arc<PriceAggregator>, feed: Arc<FeedHandle>) {
    let mut rx = feed.updates();
    loop {
        match rx.recv().await {
            Ok(update) => aggregator.on_update(update),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(exchange = %feed.name(), skipped, "aggregator lagged behind feed");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
