// =============================================================================
// Near-resolved sniping
// =============================================================================
//
// Buys outcomes that are virtually certain (default 95–99 % band) close to
// resolution and holds for the residual yield. Sizing scales with how deep
// the probability sits in the band:
//
//   dollars = capital × clamp((p − 0.90) / 0.10, 0, 1) × 0.20
//
// capped at 20 % of available capital per market.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::NearResolvedConfig;
use crate::ledger::LedgerSnapshot;
use crate::market_data::BookManager;
use crate::registry::MarketRegistry;
use crate::types::{SignalPayload, SignalType, StrategyId, TradeSignal};

/// Per-market cap as a fraction of available capital.
const MAX_PER_MARKET_PCT: Decimal = dec!(0.20);
/// Band floor the confidence scale is anchored at.
const CONFIDENCE_ANCHOR: Decimal = dec!(0.90);
/// Smallest position worth placing, in dollars.
const MIN_POSITION_DOLLARS: Decimal = dec!(10);
/// At most this many signals per scan, best yield first.
const MAX_SIGNALS_PER_SCAN: usize = 10;

pub fn scan(
    registry: &MarketRegistry,
    books: &BookManager,
    ledger: &LedgerSnapshot,
    cfg: &NearResolvedConfig,
    now_ms: i64,
) -> Vec<TradeSignal> {
    let mut signals = Vec::new();
    let capital = ledger.available_capital;

    for (market, outcome) in registry.near_resolved(cfg.min_probability, cfg.max_probability) {
        // The book mid is fresher than the catalog price when we have one.
        let price = books
            .snapshot(&outcome.token_id)
            .map(|s| s.mid())
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or(outcome.price);
        if price < cfg.min_probability || price > cfg.max_probability {
            continue;
        }

        if let Some(hours) = market.time_to_end_hours(now_ms) {
            if hours > cfg.max_time_to_resolution_hours || hours < 0.0 {
                continue;
            }
        }

        let expected_yield = Decimal::ONE - price;
        if expected_yield < cfg.min_yield {
            continue;
        }

        let scale = ((price - CONFIDENCE_ANCHOR) / dec!(0.10))
            .max(Decimal::ZERO)
            .min(Decimal::ONE);
        let dollars = capital * scale * MAX_PER_MARKET_PCT;
        if dollars < MIN_POSITION_DOLLARS {
            continue;
        }
        let size = dollars / price;

        signals.push(TradeSignal {
            strategy: StrategyId::NearResolvedSniping,
            signal_type: SignalType::Buy,
            market_id: market.id.clone(),
            token_id: outcome.token_id.clone(),
            side_label: outcome.name.clone(),
            price,
            size,
            confidence: price.to_f64().unwrap_or(0.0),
            expected_profit_pct: expected_yield,
            reason: format!("{} @ {price:.4} = {expected_yield:.4} yield", outcome.name),
            payload: SignalPayload::Directional {
                token_id: outcome.token_id.clone(),
            },
            ts_ms: now_ms,
        });
    }

    signals.sort_by(|a, b| b.expected_profit_pct.cmp(&a.expected_profit_pct));
    signals.truncate(MAX_SIGNALS_PER_SCAN);
    signals
}
