// =============================================================================
// Shared types used across the Wanchai arbitrage engine
// =============================================================================
//
// Money semantics: every price, size, and capital figure is a
// `rust_decimal::Decimal`. Prices on the CLOB are probabilities in [0, 1]
// quoted to 0.001; parity thresholds (0.995 / 1.005) are exact decimal
// comparisons, never binary floats. Statistical values (volatility, momentum
// strength, confidence) are `f64`.
// =============================================================================

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Directions and sides
// ---------------------------------------------------------------------------

/// Direction of a price move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Flat,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Flat => write!(f, "flat"),
        }
    }
}

/// Order side as the venue understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-in-force for a CLOB order.
///
/// FOK is used for arbitrage legs where a partial fill breaks atomicity;
/// GTC for patient strategies; IOC is supported by the contract but unused
/// by current detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Gtc,
    Fok,
    Ioc,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gtc => write!(f, "GTC"),
            Self::Fok => write!(f, "FOK"),
            Self::Ioc => write!(f, "IOC"),
        }
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// The five opportunity detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyId {
    LatencyArbitrage,
    YesNoArbitrage,
    NearResolvedSniping,
    SpreadTrading,
    RangeCoverage,
}

impl StrategyId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LatencyArbitrage => "LatencyArbitrage",
            Self::YesNoArbitrage => "YesNoArbitrage",
            Self::NearResolvedSniping => "NearResolvedSniping",
            Self::SpreadTrading => "SpreadTrading",
            Self::RangeCoverage => "RangeCoverage",
        }
    }

    /// Only market making is ever allowed to run a net-short position.
    pub fn allows_short(&self) -> bool {
        matches!(self, Self::SpreadTrading)
    }
}

impl std::fmt::Display for StrategyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Exchange price stream
// ---------------------------------------------------------------------------

/// Real-time top-of-book update from one external exchange.
///
/// `ts_ms` is the producer's monotonic timestamp in milliseconds; within a
/// single symbol, downstream consumers observe updates in `ts_ms` order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub exchange: String,
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub volume_24h: Decimal,
    pub ts_ms: i64,
    /// Opaque wire payload, kept for the journal.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl PriceUpdate {
    /// Mid price, `(bid + ask) / 2`.
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / dec!(2)
    }

    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    pub fn spread_pct(&self) -> Decimal {
        let mid = self.mid();
        if mid > Decimal::ZERO {
            self.spread() / mid
        } else {
            Decimal::ZERO
        }
    }
}

/// Momentum summary over a feed's recent history window.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Momentum {
    pub direction: Direction,
    /// |change_pct| / (volatility + ε).
    pub strength: f64,
    pub change_pct: f64,
    /// Population standard deviation of mid prices over the window.
    pub volatility: f64,
}

impl Momentum {
    pub fn flat() -> Self {
        Self {
            direction: Direction::Flat,
            strength: 0.0,
            change_pct: 0.0,
            volatility: 0.0,
        }
    }
}

/// A price change of magnitude ≥ threshold within the rolling window.
/// Trigger for the latency-arbitrage detector.
#[derive(Debug, Clone, Serialize)]
pub struct PriceImpulse {
    pub symbol: String,
    pub exchange: String,
    pub direction: Direction,
    pub change_pct: f64,
    pub from_price: Decimal,
    pub to_price: Decimal,
    pub window_ms: i64,
    pub ts_ms: i64,
    /// Fraction of tracked exchanges whose momentum agrees with the move.
    pub confidence: f64,
}

/// Advisory cross-exchange price dislocation. Published for possible
/// fiat-side hedging; never routed to the CLOB executor.
#[derive(Debug, Clone, Serialize)]
pub struct CrossExchangeOpportunity {
    pub symbol: String,
    pub buy_exchange: String,
    pub buy_price: Decimal,
    pub sell_exchange: String,
    pub sell_price: Decimal,
    pub profit_pct: Decimal,
    pub ts_ms: i64,
}

// ---------------------------------------------------------------------------
// Trade signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    Buy,
    Sell,
    BuyPair,
    SellPair,
    CoverSet,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
            Self::BuyPair => write!(f, "BuyPair"),
            Self::SellPair => write!(f, "SellPair"),
            Self::CoverSet => write!(f, "CoverSet"),
        }
    }
}

/// One outcome leg inside a range-coverage set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverLeg {
    pub outcome: String,
    pub token_id: String,
    pub price: Decimal,
    /// Budget weight, proportional to this leg's price within the set.
    pub weight: Decimal,
}

/// Leg-specific data carried by a signal. The executor's leg planning
/// dispatches on the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignalPayload {
    /// Single-token order (latency arbitrage, near-resolved sniping).
    Directional { token_id: String },
    /// Matched Yes/No legs priced per side.
    Pair {
        yes_token: String,
        no_token: String,
        yes_price: Decimal,
        no_price: Decimal,
    },
    /// Multi-outcome coverage set; legs keep catalog order by probability.
    Cover { legs: Vec<CoverLeg> },
    /// Market-making quotes one tick inside the touch, sizes already skewed
    /// for inventory.
    Mm {
        our_bid: Decimal,
        our_ask: Decimal,
        bid_size: Decimal,
        ask_size: Decimal,
    },
}

/// An opportunity emitted by a detector scan.
#[derive(Debug, Clone, Serialize)]
pub struct TradeSignal {
    pub strategy: StrategyId,
    pub signal_type: SignalType,
    pub market_id: String,
    /// Primary token (Yes token for pairs, highest-probability leg for
    /// coverage sets).
    pub token_id: String,
    pub side_label: String,
    /// Target price; for multi-leg signals this is the combined cost per
    /// unit payout.
    pub price: Decimal,
    /// Target size in shares (pairs / unit sets for multi-leg).
    pub size: Decimal,
    pub confidence: f64,
    pub expected_profit_pct: Decimal,
    pub reason: String,
    pub payload: SignalPayload,
    pub ts_ms: i64,
}

impl TradeSignal {
    /// A signal is actionable iff it clears the strategy's confidence and
    /// profit floors and asks for a nonzero size.
    pub fn is_actionable(&self, min_confidence: f64, min_profit_pct: Decimal) -> bool {
        self.confidence >= min_confidence
            && self.size > Decimal::ZERO
            && self.expected_profit_pct >= min_profit_pct
    }

    /// Ranking key used by the scheduler: confidence × expected profit.
    pub fn rank(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.confidence * self.expected_profit_pct.to_f64().unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Outbound order as sent to the CLOB.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub order_type: OrderType,
    /// Client-generated idempotency key: a retry of a POST the venue already
    /// accepted is collapsed rather than duplicated.
    pub client_order_id: String,
}

/// Terminal state of an order as reported by the venue (or synthesized in
/// dry-run mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Open,
    Filled,
    Partial,
    Cancelled,
    Rejected,
    Simulated,
}

impl OrderState {
    /// Whether the order produced shares we own.
    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled | Self::Simulated)
    }

    /// Whether the order may still be resting on the book.
    pub fn is_resting(&self) -> bool {
        matches!(self, Self::Open | Self::Partial)
    }
}

/// Venue response to an order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderState,
    pub filled_size: Decimal,
    pub avg_price: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(bid: Decimal, ask: Decimal) -> PriceUpdate {
        PriceUpdate {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            bid,
            ask,
            volume_24h: dec!(1000),
            ts_ms: 1_700_000_000_000,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn mid_and_spread() {
        let u = update(dec!(100000), dec!(100010));
        assert_eq!(u.mid(), dec!(100005));
        assert_eq!(u.spread(), dec!(10));
        assert_eq!(u.spread_pct(), dec!(10) / dec!(100005));
    }

    #[test]
    fn actionable_requires_all_three_floors() {
        let sig = TradeSignal {
            strategy: StrategyId::YesNoArbitrage,
            signal_type: SignalType::BuyPair,
            market_id: "m1".into(),
            token_id: "yes".into(),
            side_label: "BOTH".into(),
            price: dec!(0.97),
            size: dec!(100),
            confidence: 0.9,
            expected_profit_pct: dec!(0.03),
            reason: String::new(),
            payload: SignalPayload::Pair {
                yes_token: "yes".into(),
                no_token: "no".into(),
                yes_price: dec!(0.48),
                no_price: dec!(0.49),
            },
            ts_ms: 0,
        };
        assert!(sig.is_actionable(0.5, dec!(0.005)));
        assert!(!sig.is_actionable(0.95, dec!(0.005)));
        assert!(!sig.is_actionable(0.5, dec!(0.05)));

        let mut zero = sig.clone();
        zero.size = Decimal::ZERO;
        assert!(!zero.is_actionable(0.5, dec!(0.005)));
    }

    #[test]
    fn rank_orders_by_confidence_times_profit() {
        let mk = |conf: f64, profit: Decimal| TradeSignal {
            strategy: StrategyId::RangeCoverage,
            signal_type: SignalType::CoverSet,
            market_id: "m".into(),
            token_id: "t".into(),
            side_label: "MULTIPLE".into(),
            price: dec!(0.95),
            size: dec!(10),
            confidence: conf,
            expected_profit_pct: profit,
            reason: String::new(),
            payload: SignalPayload::Cover { legs: vec![] },
            ts_ms: 0,
        };
        assert!(mk(0.9, dec!(0.05)).rank() > mk(0.5, dec!(0.05)).rank());
        assert!(mk(0.5, dec!(0.10)).rank() > mk(0.5, dec!(0.05)).rank());
    }

    #[test]
    fn order_type_wire_format() {
        assert_eq!(serde_json::to_string(&OrderType::Fok).unwrap(), "\"FOK\"");
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
    }
}
