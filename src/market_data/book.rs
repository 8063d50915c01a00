// =============================================================================
// Order Book — per-token ladder maintained from snapshot + delta stream
// =============================================================================
//
// Price levels are keyed by exact `Decimal` prices in `BTreeMap`s, so bid and
// ask ordering falls out of the key order. A delta with `size = 0` deletes a
// level; a delta referencing a missing level with nonzero size is an insert
// (the exchange is authoritative). Transiently crossed books are tolerated.
// On a detectable sequence gap the caller resets the ladder and requests a
// fresh snapshot.
//
// After every apply, a full snapshot is published on the broadcast channel.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::types::{Direction, Momentum, Side};

/// Mid-price points retained per token.
const MID_HISTORY_CAP: usize = 1000;
/// Keeps momentum strength finite on a flat window.
const STRENGTH_EPSILON: f64 = 0.0001;

/// Single price level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderLevel {
    pub price: Decimal,
    pub size: Decimal,
    pub order_count: u32,
}

/// Point-in-time view of one token's ladder. Bids descend, asks ascend.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub token_id: String,
    pub ts_ms: i64,
    pub bids: Vec<OrderLevel>,
    pub asks: Vec<OrderLevel>,
}

impl BookSnapshot {
    /// Best bid; 0 when the bid side is empty.
    pub fn best_bid(&self) -> Decimal {
        self.bids.first().map(|l| l.price).unwrap_or(Decimal::ZERO)
    }

    /// Best ask; 1 when the ask side is empty (prices are probabilities).
    pub fn best_ask(&self) -> Decimal {
        self.asks.first().map(|l| l.price).unwrap_or(Decimal::ONE)
    }

    pub fn mid(&self) -> Decimal {
        (self.best_bid() + self.best_ask()) / dec!(2)
    }

    pub fn spread(&self) -> Decimal {
        self.best_ask() - self.best_bid()
    }

    pub fn spread_pct(&self) -> Decimal {
        let mid = self.mid();
        if mid > Decimal::ZERO {
            self.spread() / mid
        } else {
            Decimal::ZERO
        }
    }

    pub fn bid_depth(&self) -> Decimal {
        self.bids.iter().map(|l| l.size).sum()
    }

    pub fn ask_depth(&self) -> Decimal {
        self.asks.iter().map(|l| l.size).sum()
    }

    /// Book imbalance in [−1, 1]; positive means bid-heavy.
    pub fn imbalance(&self) -> Decimal {
        let bid = self.bid_depth();
        let ask = self.ask_depth();
        let total = bid + ask;
        if total > Decimal::ZERO {
            (bid - ask) / total
        } else {
            Decimal::ZERO
        }
    }

    /// Walk opposite-side levels in price order, filling until `qty` is
    /// consumed or the book runs out.
    ///
    /// Returns `(avg_fill_price, impact_pct)` where the impact is the
    /// deviation of the average fill from the touch.
    pub fn price_impact(&self, side: Side, qty: Decimal) -> Option<(Decimal, Decimal)> {
        let levels = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        let touch = levels.first()?.price;
        if qty <= Decimal::ZERO {
            return Some((touch, Decimal::ZERO));
        }

        let mut remaining = qty;
        let mut total_cost = Decimal::ZERO;
        for level in levels {
            let fill = remaining.min(level.size);
            total_cost += fill * level.price;
            remaining -= fill;
            if remaining <= Decimal::ZERO {
                break;
            }
        }

        let filled = qty - remaining;
        if filled <= Decimal::ZERO {
            return Some((touch, Decimal::ZERO));
        }
        let avg = total_cost / filled;
        let impact = if touch > Decimal::ZERO {
            (avg - touch).abs() / touch
        } else {
            Decimal::ZERO
        };
        Some((avg, impact))
    }

    /// Dollar-weighted average price over the first `depth` dollars of the
    /// relevant side.
    pub fn vwap(&self, side: Side, depth: Decimal) -> Option<Decimal> {
        let levels = match side {
            Side::Buy => &self.asks,
            Side::Sell => &self.bids,
        };
        if levels.is_empty() || depth <= Decimal::ZERO {
            return None;
        }

        let mut total_volume = Decimal::ZERO;
        let mut total_value = Decimal::ZERO;
        for level in levels {
            let level_value = level.price * level.size;
            if total_value + level_value > depth {
                let remaining_value = depth - total_value;
                total_volume += remaining_value / level.price;
                total_value = depth;
                break;
            }
            total_volume += level.size;
            total_value += level_value;
        }

        if total_volume > Decimal::ZERO {
            Some(total_value / total_volume)
        } else {
            None
        }
    }

    /// Non-null when the spread is wide enough for market making.
    pub fn spread_opportunity(&self, min_spread_pct: Decimal) -> Option<SpreadOpportunity> {
        let spread_pct = self.spread_pct();
        if spread_pct < min_spread_pct {
            return None;
        }
        Some(SpreadOpportunity {
            bid: self.best_bid(),
            ask: self.best_ask(),
            spread: self.spread(),
            spread_pct,
            mid: self.mid(),
            potential_profit: self.spread() / dec!(2),
        })
    }
}

/// Spread wide enough to quote inside of.
#[derive(Debug, Clone, Serialize)]
pub struct SpreadOpportunity {
    pub bid: Decimal,
    pub ask: Decimal,
    pub spread: Decimal,
    pub spread_pct: Decimal,
    pub mid: Decimal,
    /// Captured if filled on both sides: half the spread.
    pub potential_profit: Decimal,
}

#[derive(Debug, Clone, Copy)]
struct MidPoint {
    ts_ms: i64,
    mid: f64,
}

#[derive(Default)]
struct Ladder {
    bids: BTreeMap<Decimal, OrderLevel>,
    asks: BTreeMap<Decimal, OrderLevel>,
    last_ts_ms: i64,
    mid_history: VecDeque<MidPoint>,
}

impl Ladder {
    fn snapshot(&self, token_id: &str) -> BookSnapshot {
        BookSnapshot {
            token_id: token_id.to_string(),
            ts_ms: self.last_ts_ms,
            bids: self.bids.values().rev().cloned().collect(),
            asks: self.asks.values().cloned().collect(),
        }
    }
}

/// Owns every tracked token ladder. The WebSocket driver is the single
/// writer; readers obtain immutable snapshots.
pub struct BookManager {
    books: RwLock<HashMap<String, Ladder>>,
    tx: broadcast::Sender<BookSnapshot>,
}

impl BookManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            books: RwLock::new(HashMap::new()),
            tx,
        }
    }

    /// New receiver on the snapshot fan-out channel.
    pub fn snapshots(&self) -> broadcast::Receiver<BookSnapshot> {
        self.tx.subscribe()
    }

    /// Apply a snapshot or delta message: `(price, size)` pairs per side,
    /// `size = 0` deletes the level. Emits the resulting snapshot.
    pub fn apply(
        &self,
        token_id: &str,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
        ts_ms: i64,
    ) {
        let snapshot = {
            let mut books = self.books.write();
            let ladder = books.entry(token_id.to_string()).or_default();

            for &(price, size) in bids {
                if size == Decimal::ZERO {
                    ladder.bids.remove(&price);
                } else {
                    ladder.bids.insert(
                        price,
                        OrderLevel {
                            price,
                            size,
                            order_count: 1,
                        },
                    );
                }
            }
            for &(price, size) in asks {
                if size == Decimal::ZERO {
                    ladder.asks.remove(&price);
                } else {
                    ladder.asks.insert(
                        price,
                        OrderLevel {
                            price,
                            size,
                            order_count: 1,
                        },
                    );
                }
            }
            ladder.last_ts_ms = ts_ms;

            let snapshot = ladder.snapshot(token_id);
            if let Some(mid) = snapshot.mid().to_f64() {
                if ladder.mid_history.len() == MID_HISTORY_CAP {
                    ladder.mid_history.pop_front();
                }
                ladder.mid_history.push_back(MidPoint { ts_ms, mid });
            }
            snapshot
        };

        let _ = self.tx.send(snapshot);
    }

    /// Discard local state for `token_id` after a detected sequence gap; the
    /// stream driver requests a fresh snapshot.
    pub fn reset(&self, token_id: &str) {
        info!(token_id, "order book reset, awaiting fresh snapshot");
        self.books.write().remove(token_id);
    }

    pub fn snapshot(&self, token_id: &str) -> Option<BookSnapshot> {
        self.books.read().get(token_id).map(|l| l.snapshot(token_id))
    }

    pub fn tokens(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }

    /// Momentum of the mid price over the last `lookback` book updates.
    pub fn momentum(&self, token_id: &str, lookback: usize) -> Momentum {
        let books = self.books.read();
        let ladder = match books.get(token_id) {
            Some(l) if l.mid_history.len() >= 2 => l,
            _ => return Momentum::flat(),
        };
        let skip = ladder.mid_history.len().saturating_sub(lookback);
        let recent: Vec<f64> = ladder.mid_history.iter().skip(skip).map(|p| p.mid).collect();
        if recent.len() < 2 {
            return Momentum::flat();
        }

        let first = recent[0];
        let last = recent[recent.len() - 1];
        if first <= 0.0 {
            return Momentum::flat();
        }
        let change_pct = (last - first) / first;
        let avg = recent.iter().sum::<f64>() / recent.len() as f64;
        let variance = recent.iter().map(|p| (p - avg).powi(2)).sum::<f64>() / recent.len() as f64;
        let volatility = variance.sqrt();

        debug!(token_id, change_pct, volatility, "book momentum computed");
        Momentum {
            direction: if change_pct > 0.0 {
                Direction::Up
            } else if change_pct < 0.0 {
                Direction::Down
            } else {
                Direction::Flat
            },
            strength: change_pct.abs() / (volatility + STRENGTH_EPSILON),
            change_pct,
            volatility,
        }
    }
}

impl Default for BookManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookManager")
            .field("tokens", &self.books.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_manager() -> BookManager {
        let mgr = BookManager::new();
        mgr.apply(
            "tok",
            &[(dec!(0.50), dec!(100)), (dec!(0.49), dec!(200))],
            &[(dec!(0.55), dec!(150)), (dec!(0.56), dec!(300))],
            1,
        );
        mgr
    }

    #[test]
    fn snapshot_orders_bids_desc_asks_asc() {
        let snap = seeded_manager().snapshot("tok").unwrap();
        assert_eq!(snap.best_bid(), dec!(0.50));
        assert_eq!(snap.best_ask(), dec!(0.55));
        assert_eq!(snap.bids[1].price, dec!(0.49));
        assert_eq!(snap.asks[1].price, dec!(0.56));
        assert_eq!(snap.mid(), dec!(0.525));
        assert_eq!(snap.spread(), dec!(0.05));
    }

    #[test]
    fn zero_size_delta_deletes_level() {
        let mgr = seeded_manager();
        mgr.apply("tok", &[(dec!(0.50), Decimal::ZERO)], &[], 2);
        let snap = mgr.snapshot("tok").unwrap();
        assert_eq!(snap.best_bid(), dec!(0.49));
        assert_eq!(snap.bids.len(), 1);
    }

    #[test]
    fn delta_on_missing_level_is_an_insert() {
        let mgr = seeded_manager();
        mgr.apply("tok", &[(dec!(0.51), dec!(50))], &[], 2);
        let snap = mgr.snapshot("tok").unwrap();
        assert_eq!(snap.best_bid(), dec!(0.51));
        assert_eq!(snap.bids.len(), 3);
    }

    #[test]
    fn crossed_book_is_tolerated() {
        let mgr = BookManager::new();
        mgr.apply("tok", &[(dec!(0.60), dec!(10))], &[(dec!(0.55), dec!(10))], 1);
        let snap = mgr.snapshot("tok").unwrap();
        assert_eq!(snap.best_bid(), dec!(0.60));
        assert_eq!(snap.best_ask(), dec!(0.55));
        assert!(snap.spread() < Decimal::ZERO);
    }

    #[test]
    fn empty_sides_use_probability_bounds() {
        let mgr = BookManager::new();
        mgr.apply("tok", &[], &[], 1);
        let snap = mgr.snapshot("tok").unwrap();
        assert_eq!(snap.best_bid(), Decimal::ZERO);
        assert_eq!(snap.best_ask(), Decimal::ONE);
    }

    #[test]
    fn depth_and_imbalance() {
        let snap = seeded_manager().snapshot("tok").unwrap();
        assert_eq!(snap.bid_depth(), dec!(300));
        assert_eq!(snap.ask_depth(), dec!(450));
        assert_eq!(snap.imbalance(), (dec!(300) - dec!(450)) / dec!(750));
    }

    #[test]
    fn price_impact_walks_levels_in_order() {
        let snap = seeded_manager().snapshot("tok").unwrap();
        // Buy 200: 150 @ 0.55 + 50 @ 0.56.
        let (avg, impact) = snap.price_impact(Side::Buy, dec!(200)).unwrap();
        assert_eq!(avg, (dec!(150) * dec!(0.55) + dec!(50) * dec!(0.56)) / dec!(200));
        assert_eq!(impact, (avg - dec!(0.55)) / dec!(0.55));
    }

    #[test]
    fn price_impact_within_touch_is_zero() {
        let snap = seeded_manager().snapshot("tok").unwrap();
        let (avg, impact) = snap.price_impact(Side::Buy, dec!(100)).unwrap();
        assert_eq!(avg, dec!(0.55));
        assert_eq!(impact, Decimal::ZERO);
    }

    #[test]
    fn price_impact_book_exhausted_uses_filled_size() {
        let snap = seeded_manager().snapshot("tok").unwrap();
        // Ask side only holds 450 shares.
        let (avg, _) = snap.price_impact(Side::Buy, dec!(10000)).unwrap();
        let expected = (dec!(150) * dec!(0.55) + dec!(300) * dec!(0.56)) / dec!(450);
        assert_eq!(avg, expected);
    }

    #[test]
    fn vwap_respects_dollar_depth() {
        let snap = seeded_manager().snapshot("tok").unwrap();
        // First ask level is worth 82.5 dollars; 50 dollars stays inside it.
        assert_eq!(snap.vwap(Side::Buy, dec!(50)).unwrap(), dec!(0.55));
        // 100 dollars spills into the second level.
        let vwap = snap.vwap(Side::Buy, dec!(100)).unwrap();
        assert!(vwap > dec!(0.55) && vwap < dec!(0.56));
    }

    #[test]
    fn spread_opportunity_threshold() {
        let snap = seeded_manager().snapshot("tok").unwrap();
        // Spread pct here is 0.05 / 0.525 ≈ 9.5%.
        let opp = snap.spread_opportunity(dec!(0.02)).unwrap();
        assert_eq!(opp.bid, dec!(0.50));
        assert_eq!(opp.ask, dec!(0.55));
        assert_eq!(opp.potential_profit, dec!(0.025));
        assert!(snap.spread_opportunity(dec!(0.2)).is_none());
    }

    #[test]
    fn reset_discards_state() {
        let mgr = seeded_manager();
        mgr.reset("tok");
        assert!(mgr.snapshot("tok").is_none());
    }

    #[test]
    fn momentum_tracks_mid_drift() {
        let mgr = BookManager::new();
        for i in 0..20i64 {
            let bid = dec!(0.40) + Decimal::from(i) * dec!(0.01);
            mgr.apply("tok", &[(bid, dec!(10))], &[(bid + dec!(0.02), dec!(10))], i);
        }
        let m = mgr.momentum("tok", 20);
        assert_eq!(m.direction, Direction::Up);
        assert!(m.change_pct > 0.0);
    }
}
