// =============================================================================
// Spread making (market making)
// =============================================================================
//
// Quotes one tick inside the touch on tokens whose spread is wide enough,
// capturing the spread when both sides fill. Quote sizes are shaded by
// inventory skew:
//
//   imbalance = position_size / (order_size × 10), clamped to [−1, 1]
//   |imbalance| > max_imbalance  →  bid × (1 − imb), ask × (1 + imb)
//
// so a long book quotes a smaller bid and a larger ask until inventory
// normalizes, and vice versa when short.
// =============================================================================

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::SpreadTradingConfig;
use crate::ledger::LedgerSnapshot;
use crate::market_data::BookManager;
use crate::registry::MarketRegistry;
use crate::types::{SignalPayload, SignalType, StrategyId, TradeSignal};

/// One tick on the venue's price grid.
const TICK: Decimal = dec!(0.001);
/// Inventory normalizer as a multiple of the configured order size.
const INVENTORY_NORMALIZER: Decimal = dec!(10);

pub fn scan(
    registry: &MarketRegistry,
    books: &BookManager,
    ledger: &LedgerSnapshot,
    cfg: &SpreadTradingConfig,
    now_ms: i64,
) -> Vec<TradeSignal> {
    let mut signals = Vec::new();

    for token_id in books.tokens() {
        let Some(snapshot) = books.snapshot(&token_id) else {
            continue;
        };
        let Some(opportunity) = snapshot.spread_opportunity(cfg.min_spread) else {
            continue;
        };
        let Some(market) = registry.market_for_token(&token_id) else {
            continue;
        };
        if !market.is_active() {
            continue;
        }

        let our_bid = opportunity.bid + TICK;
        let our_ask = opportunity.ask - TICK;
        let our_spread = our_ask - our_bid;
        // Keep a meaningful capture after improving both sides.
        if our_spread < cfg.min_spread * opportunity.mid {
            continue;
        }

        let inventory = ledger
            .position(&market.id, &token_id, StrategyId::SpreadTrading)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO);
        let (bid_size, ask_size) = skewed_sizes(inventory, cfg);
        if bid_size <= Decimal::ZERO && ask_size <= Decimal::ZERO {
            continue;
        }

        let spread_pct = opportunity.spread_pct.to_f64().unwrap_or(0.0);
        let min_spread = cfg.min_spread.to_f64().unwrap_or(1.0).max(f64::EPSILON);
        signals.push(TradeSignal {
            strategy: StrategyId::SpreadTrading,
            signal_type: SignalType::Buy,
            market_id: market.id.clone(),
            token_id: token_id.clone(),
            side_label: "BOTH".to_string(),
            price: opportunity.mid,
            size: cfg.order_size,
            confidence: (spread_pct / min_spread / 2.0).min(0.8),
            expected_profit_pct: if opportunity.mid > Decimal::ZERO {
                our_spread / opportunity.mid
            } else {
                Decimal::ZERO
            },
            reason: format!(
                "Spread {:.4} ≥ {:.4} threshold",
                opportunity.spread_pct, cfg.min_spread
            ),
            payload: SignalPayload::Mm {
                our_bid,
                our_ask,
                bid_size,
                ask_size,
            },
            ts_ms: now_ms,
        });
    }

    signals
}

/// Shade quote sizes when inventory skew exceeds the configured ceiling.
fn skewed_sizes(inventory: Decimal, cfg: &SpreadTradingConfig) -> (Decimal, Decimal) {
    let normalizer = cfg.order_size * INVENTORY_NORMALIZER;
    if normalizer <= Decimal::ZERO {
        return (cfg.order_size, cfg.order_size);
    }
    let imbalance = (inventory / normalizer)
        .max(dec!(-1))
        .min(Decimal::ONE);
    let ceiling = Decimal::from_f64(cfg.max_inventory_imbalance).unwrap_or(Decimal::ONE);

    if imbalance.abs() <= ceiling {
        return (cfg.order_size, cfg.order_size);
    }
    let bid = cfg.order_size * (Decimal::ONE - imbalance);
    let ask = cfg.order_size * (Decimal::ONE + imbalance);
    (bid.max(Decimal::ZERO), ask.max(Decimal::ZERO))
}
