// =============================================================================
// Ledger — single source of truth for capital, positions, and coverages
// =============================================================================
//
// The only component that mutates capital or position state. Every operation
// completes synchronously under one exclusive lock, so reservation → fill →
// journal is observed as an atomic sequence by any concurrent reader. None
// of the methods suspend.
//
// Compounding contract: realized profit returns to available capital
// immediately on `apply_fill` / `apply_resolution`; `peak_capital` tracks
// the equity high-water mark.
//
// Invariants checked after every mutation (violation is fatal and halts the
// session):
//   available_capital ≥ 0
//   win_count ≤ trade_count
//   peak_capital ≥ current_equity
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::{Side, StrategyId};

// ---------------------------------------------------------------------------
// Public records
// ---------------------------------------------------------------------------

/// Which side of the event a position represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PositionSide {
    Yes,
    No,
    Long,
    Short,
}

/// One open position for a (market, token, strategy) triple.
///
/// `size` is signed; it only goes negative for the market-making strategy.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub market_id: String,
    pub token_id: String,
    pub strategy: StrategyId,
    pub side: PositionSide,
    pub size: Decimal,
    pub avg_price: Decimal,
    /// `size × avg_price`, signed with the size.
    pub cost: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub opened_at_ms: i64,
}

/// One filled leg of a range-coverage set.
#[derive(Debug, Clone, Serialize)]
pub struct CoverageFill {
    pub token_id: String,
    pub price: Decimal,
    pub size: Decimal,
}

/// A held range-coverage basket. Pays `min_shares` at resolution when the
/// winning outcome is inside the set.
#[derive(Debug, Clone, Serialize)]
pub struct Coverage {
    pub market_id: String,
    pub strategy: StrategyId,
    pub fills: Vec<CoverageFill>,
    pub total_cost: Decimal,
    pub min_shares: Decimal,
    pub opened_at_ms: i64,
}

impl Coverage {
    pub fn expected_profit(&self) -> Decimal {
        self.min_shares - self.total_cost
    }
}

/// A hold on capital promised to an in-flight execution. Consumed exactly
/// once, by `apply_fill`, `apply_coverage`, or `release`.
#[derive(Debug)]
pub struct Reservation {
    id: u64,
    pub amount: Decimal,
}

/// One fill as reported back by the executor.
#[derive(Debug, Clone)]
pub struct LegFill {
    pub market_id: String,
    pub token_id: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub price: Decimal,
    pub size: Decimal,
}

/// Net effect of a ledger mutation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerDelta {
    pub realized_pnl: Decimal,
    /// Net change to available capital (refunds + proceeds − spend).
    pub cash_flow: Decimal,
    pub closed_positions: usize,
}

/// Cheap read-only copy for risk checks, detectors, and the notifier.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub initial_capital: Decimal,
    pub available_capital: Decimal,
    pub reserved_capital: Decimal,
    pub peak_capital: Decimal,
    pub cumulative_realized: Decimal,
    pub trade_count: u64,
    pub win_count: u64,
    pub current_equity: Decimal,
    pub max_drawdown: Decimal,
    pub positions: Vec<Position>,
    pub coverages: Vec<Coverage>,
}

impl LedgerSnapshot {
    pub fn win_rate(&self) -> f64 {
        if self.trade_count == 0 {
            return 0.0;
        }
        self.win_count as f64 / self.trade_count as f64
    }

    /// Open position for an exact (market, token, strategy) triple.
    pub fn position(
        &self,
        market_id: &str,
        token_id: &str,
        strategy: StrategyId,
    ) -> Option<&Position> {
        self.positions.iter().find(|p| {
            p.market_id == market_id && p.token_id == token_id && p.strategy == strategy
        })
    }

    /// Matched Yes/No inventory a SellPair could unwind: the smaller of the
    /// two long sizes, when both are open for the strategy.
    pub fn pair_inventory(
        &self,
        market_id: &str,
        yes_token: &str,
        no_token: &str,
        strategy: StrategyId,
    ) -> Decimal {
        let yes = self
            .position(market_id, yes_token, strategy)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO);
        let no = self
            .position(market_id, no_token, strategy)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO);
        yes.min(no).max(Decimal::ZERO)
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Hash, PartialEq, Eq, Clone)]
struct PositionKey {
    market_id: String,
    token_id: String,
    strategy: StrategyId,
}

struct Inner {
    available: Decimal,
    peak: Decimal,
    cumulative_realized: Decimal,
    trade_count: u64,
    win_count: u64,
    positions: HashMap<PositionKey, Position>,
    coverages: HashMap<String, Coverage>,
    reservations: HashMap<u64, Decimal>,
    next_reservation_id: u64,
}

impl Inner {
    fn reserved_total(&self) -> Decimal {
        self.reservations.values().copied().sum()
    }

    /// available + reserved + Σ position cost + Σ coverage cost.
    fn equity(&self) -> Decimal {
        let position_cost: Decimal = self.positions.values().map(|p| p.cost).sum();
        let coverage_cost: Decimal = self.coverages.values().map(|c| c.total_cost).sum();
        self.available + self.reserved_total() + position_cost + coverage_cost
    }

    fn record_realized(&mut self, pnl: Decimal) {
        self.cumulative_realized += pnl;
        self.trade_count += 1;
        if pnl > Decimal::ZERO {
            self.win_count += 1;
        }
    }

    fn touch_peak(&mut self) {
        let equity = self.equity();
        if equity > self.peak {
            self.peak = equity;
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct Ledger {
    initial_capital: Decimal,
    inner: Mutex<Inner>,
}

impl Ledger {
    pub fn new(initial_capital: Decimal) -> Self {
        info!(initial_capital = %initial_capital, "ledger initialised");
        Self {
            initial_capital,
            inner: Mutex::new(Inner {
                available: initial_capital,
                peak: initial_capital,
                cumulative_realized: Decimal::ZERO,
                trade_count: 0,
                win_count: 0,
                positions: HashMap::new(),
                coverages: HashMap::new(),
                reservations: HashMap::new(),
                next_reservation_id: 1,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Reservations
    // -------------------------------------------------------------------------

    /// Hold `amount` of available capital for an in-flight execution.
    pub fn reserve(&self, amount: Decimal) -> EngineResult<Reservation> {
        if amount < Decimal::ZERO {
            return Err(EngineError::InvariantViolation(format!(
                "negative reservation requested: {amount}"
            )));
        }
        let mut inner = self.inner.lock();
        if amount > inner.available {
            return Err(EngineError::InsufficientCapital {
                requested: amount,
                available: inner.available,
            });
        }
        inner.available -= amount;
        let id = inner.next_reservation_id;
        inner.next_reservation_id += 1;
        inner.reservations.insert(id, amount);
        debug!(reservation = id, amount = %amount, "capital reserved");
        Ok(Reservation { id, amount })
    }

    /// Return an unused reservation to available capital in full.
    pub fn release(&self, reservation: Reservation) {
        let mut inner = self.inner.lock();
        if let Some(amount) = inner.reservations.remove(&reservation.id) {
            inner.available += amount;
            debug!(reservation = reservation.id, amount = %amount, "reservation released");
        }
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Commit a batch of leg fills against a reservation.
    ///
    /// Buys spend the reservation (size-weighted into position averages);
    /// sells close size-first and realize PnL into available capital. Any
    /// unspent remainder of the reservation is refunded. A sell that would
    /// flip a position net short fails unless the strategy allows shorts.
    pub fn apply_fill(
        &self,
        reservation: Reservation,
        fills: &[LegFill],
        strategy: StrategyId,
        ts_ms: i64,
    ) -> EngineResult<LedgerDelta> {
        let mut inner = self.inner.lock();
        let reserved = inner
            .reservations
            .remove(&reservation.id)
            .unwrap_or(Decimal::ZERO);

        let mut buy_cost = Decimal::ZERO;
        let mut proceeds = Decimal::ZERO;
        let mut realized = Decimal::ZERO;
        let mut closed = 0usize;

        for fill in fills {
            let key = PositionKey {
                market_id: fill.market_id.clone(),
                token_id: fill.token_id.clone(),
                strategy,
            };
            match fill.side {
                Side::Buy => {
                    buy_cost += fill.price * fill.size;
                    let position = inner.positions.entry(key).or_insert_with(|| Position {
                        market_id: fill.market_id.clone(),
                        token_id: fill.token_id.clone(),
                        strategy,
                        side: fill.position_side,
                        size: Decimal::ZERO,
                        avg_price: Decimal::ZERO,
                        cost: Decimal::ZERO,
                        mark_price: fill.price,
                        unrealized_pnl: Decimal::ZERO,
                        opened_at_ms: ts_ms,
                    });

                    if position.size < Decimal::ZERO {
                        // Buying back a short: close size-first, realize
                        // (avg − price) × closed, flip any excess long.
                        let close_size = fill.size.min(-position.size);
                        realized += (position.avg_price - fill.price) * close_size;
                        position.size += close_size;
                        let excess = fill.size - close_size;
                        if excess > Decimal::ZERO {
                            position.size = excess;
                            position.avg_price = fill.price;
                            position.side = fill.position_side;
                        }
                    } else {
                        let new_size = position.size + fill.size;
                        position.avg_price = (position.size * position.avg_price
                            + fill.size * fill.price)
                            / new_size;
                        position.size = new_size;
                    }
                    position.cost = position.size * position.avg_price;
                    position.mark_price = fill.price;
                    if position.size == Decimal::ZERO {
                        inner.positions.retain(|_, p| p.size != Decimal::ZERO);
                        closed += 1;
                    }
                }
                Side::Sell => {
                    proceeds += fill.price * fill.size;

                    let held = inner
                        .positions
                        .get(&key)
                        .map(|p| p.size.max(Decimal::ZERO))
                        .unwrap_or(Decimal::ZERO);
                    if fill.size > held && !strategy.allows_short() {
                        // Restore the reservation and fail; the scheduler
                        // halts the session on this error.
                        inner.reservations.insert(reservation.id, reserved);
                        return Err(EngineError::InvariantViolation(format!(
                            "sell of {} would run {} net short",
                            fill.token_id, strategy
                        )));
                    }

                    if !inner.positions.contains_key(&key) {
                        // Fresh short (market making only, validated above).
                        inner.positions.insert(
                            key.clone(),
                            Position {
                                market_id: fill.market_id.clone(),
                                token_id: fill.token_id.clone(),
                                strategy,
                                side: PositionSide::Short,
                                size: -fill.size,
                                avg_price: fill.price,
                                cost: -fill.size * fill.price,
                                mark_price: fill.price,
                                unrealized_pnl: Decimal::ZERO,
                                opened_at_ms: ts_ms,
                            },
                        );
                        continue;
                    }

                    if let Some(position) = inner.positions.get_mut(&key) {
                        let close_size = fill.size.min(position.size.max(Decimal::ZERO));
                        realized += (fill.price - position.avg_price) * close_size;
                        position.size -= close_size;

                        let excess = fill.size - close_size;
                        if excess > Decimal::ZERO {
                            // Grow (or open) the short side, size-weighted.
                            if position.size == Decimal::ZERO {
                                position.avg_price = fill.price;
                            } else if position.size < Decimal::ZERO {
                                let abs = -position.size;
                                position.avg_price = (abs * position.avg_price
                                    + excess * fill.price)
                                    / (abs + excess);
                            }
                            position.size -= excess;
                            position.side = PositionSide::Short;
                        }
                        position.cost = position.size * position.avg_price;
                        position.mark_price = fill.price;
                        if position.size == Decimal::ZERO {
                            inner.positions.remove(&key);
                            closed += 1;
                        }
                    }
                }
            }
        }

        // Spend from the reservation, refund the remainder; a shortfall is
        // covered from available capital. Realized PnL on sells is already
        // embedded in the proceeds.
        let remainder = reserved - buy_cost;
        inner.available += remainder + proceeds;
        if realized != Decimal::ZERO {
            inner.record_realized(realized);
        }
        inner.touch_peak();

        if inner.available < Decimal::ZERO {
            return Err(EngineError::InvariantViolation(format!(
                "available capital negative after fill: {}",
                inner.available
            )));
        }
        self.check_invariants(&inner)?;

        let delta = LedgerDelta {
            realized_pnl: realized,
            cash_flow: remainder + proceeds,
            closed_positions: closed,
        };
        debug!(
            strategy = %strategy,
            realized = %delta.realized_pnl,
            cash_flow = %delta.cash_flow,
            "fill applied"
        );
        Ok(delta)
    }

    /// Commit a range-coverage basket against a reservation. The basket is
    /// tracked as one unit until resolution rather than as per-token
    /// positions.
    pub fn apply_coverage(
        &self,
        reservation: Reservation,
        market_id: &str,
        fills: Vec<CoverageFill>,
        strategy: StrategyId,
        ts_ms: i64,
    ) -> EngineResult<LedgerDelta> {
        let total_cost: Decimal = fills.iter().map(|f| f.price * f.size).sum();
        let min_shares = fills
            .iter()
            .map(|f| f.size)
            .min()
            .unwrap_or(Decimal::ZERO);

        let mut inner = self.inner.lock();
        let reserved = inner
            .reservations
            .remove(&reservation.id)
            .unwrap_or(Decimal::ZERO);
        let remainder = reserved - total_cost;
        inner.available += remainder;

        if inner.available < Decimal::ZERO {
            return Err(EngineError::InvariantViolation(format!(
                "available capital negative after coverage: {}",
                inner.available
            )));
        }

        let coverage = Coverage {
            market_id: market_id.to_string(),
            strategy,
            fills,
            total_cost,
            min_shares,
            opened_at_ms: ts_ms,
        };
        info!(
            market_id,
            legs = coverage.fills.len(),
            total_cost = %coverage.total_cost,
            min_shares = %coverage.min_shares,
            expected_profit = %coverage.expected_profit(),
            "coverage opened"
        );
        inner.coverages.insert(market_id.to_string(), coverage);
        inner.touch_peak();
        self.check_invariants(&inner)?;

        Ok(LedgerDelta {
            realized_pnl: Decimal::ZERO,
            cash_flow: remainder,
            closed_positions: 0,
        })
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    /// Realize payouts for a resolved market: $1 per share on the winning
    /// token, zero on the rest. Positions and coverages on the market are
    /// destroyed. The winning token comes from the venue's resolution
    /// record; no position is assumed to have won.
    pub fn apply_resolution(
        &self,
        market_id: &str,
        winning_token: &str,
    ) -> EngineResult<LedgerDelta> {
        let mut inner = self.inner.lock();
        let mut realized = Decimal::ZERO;
        let mut payout_total = Decimal::ZERO;
        let mut closed = 0usize;

        let keys: Vec<PositionKey> = inner
            .positions
            .keys()
            .filter(|k| k.market_id == market_id)
            .cloned()
            .collect();

        for key in keys {
            let Some(position) = inner.positions.remove(&key) else {
                continue;
            };
            // Shorts owe the payout on the winning token.
            let payout = if position.token_id == winning_token {
                position.size
            } else {
                Decimal::ZERO
            };
            let pnl = payout - position.cost;
            realized += pnl;
            payout_total += payout;
            inner.available += payout;
            inner.record_realized(pnl);
            closed += 1;
            info!(
                market_id,
                token_id = %position.token_id,
                strategy = %position.strategy,
                payout = %payout,
                pnl = %pnl,
                "position resolved"
            );
        }

        if let Some(coverage) = inner.coverages.remove(market_id) {
            let payout = coverage
                .fills
                .iter()
                .find(|f| f.token_id == winning_token)
                .map(|f| f.size)
                .unwrap_or(Decimal::ZERO);
            let pnl = payout - coverage.total_cost;
            realized += pnl;
            payout_total += payout;
            inner.available += payout;
            inner.record_realized(pnl);
            closed += 1;
            info!(
                market_id,
                payout = %payout,
                pnl = %pnl,
                "coverage resolved"
            );
        }

        inner.touch_peak();
        if inner.available < Decimal::ZERO {
            return Err(EngineError::InvariantViolation(format!(
                "available capital negative after resolution: {}",
                inner.available
            )));
        }
        self.check_invariants(&inner)?;

        Ok(LedgerDelta {
            realized_pnl: realized,
            cash_flow: payout_total,
            closed_positions: closed,
        })
    }

    // -------------------------------------------------------------------------
    // Marks and reads
    // -------------------------------------------------------------------------

    /// Refresh mark price and unrealized PnL for every position on `token_id`.
    pub fn update_mark(&self, token_id: &str, mark: Decimal) {
        let mut inner = self.inner.lock();
        for position in inner.positions.values_mut() {
            if position.token_id == token_id {
                position.mark_price = mark;
                position.unrealized_pnl = (mark - position.avg_price) * position.size;
            }
        }
    }

    /// Markets with exposure the resolution sweep must watch.
    pub fn exposed_markets(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut ids: Vec<String> = inner
            .positions
            .keys()
            .map(|k| k.market_id.clone())
            .chain(inner.coverages.keys().cloned())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let inner = self.inner.lock();
        let equity = inner.equity();
        let max_drawdown = if inner.peak > Decimal::ZERO {
            (inner.peak - equity) / inner.peak
        } else {
            Decimal::ZERO
        };
        LedgerSnapshot {
            initial_capital: self.initial_capital,
            available_capital: inner.available,
            reserved_capital: inner.reserved_total(),
            peak_capital: inner.peak,
            cumulative_realized: inner.cumulative_realized,
            trade_count: inner.trade_count,
            win_count: inner.win_count,
            current_equity: equity,
            max_drawdown,
            positions: inner.positions.values().cloned().collect(),
            coverages: inner.coverages.values().cloned().collect(),
        }
    }

    /// Extrapolate past per-trade returns forward. Reporting aid only; the
    /// output is never fed back into sizing.
    pub fn growth_projection(&self, daily_trades: u32, days: u32) -> Option<f64> {
        let snap = self.snapshot();
        if snap.trade_count == 0 {
            return None;
        }
        let equity = snap.current_equity.to_f64()?;
        if equity <= 0.0 {
            return None;
        }
        let avg_profit =
            snap.cumulative_realized.to_f64()? / snap.trade_count as f64;
        let per_trade_return = avg_profit / equity;
        let growth =
            (1.0 + per_trade_return * snap.win_rate()).powi((daily_trades * days) as i32);
        Some(equity * growth)
    }

    fn check_invariants(&self, inner: &Inner) -> EngineResult<()> {
        if inner.win_count > inner.trade_count {
            return Err(EngineError::InvariantViolation(format!(
                "win_count {} exceeds trade_count {}",
                inner.win_count, inner.trade_count
            )));
        }
        let equity = inner.equity();
        if inner.peak < equity {
            warn!(peak = %inner.peak, equity = %equity, "peak below equity after touch");
            return Err(EngineError::InvariantViolation(
                "peak_capital below current equity".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Ledger")
            .field("available", &inner.available)
            .field("positions", &inner.positions.len())
            .field("coverages", &inner.coverages.len())
            .field("reservations", &inner.reservations.len())
            .finish()
    }
}
