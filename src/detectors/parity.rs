// =============================================================================
// Yes/No parity arbitrage
// =============================================================================
//
// On a binary market, Yes + No should price at exactly $1:
//
//   yes_ask + no_ask < 0.995  →  buy both legs, payout locks in the gap
//   yes_bid + no_bid > 1.005  →  sell both legs, requires matched inventory
//
// The sell side is only emitted when the ledger already holds a matched
// Yes/No pair; minting a pair against $1 collateral is not supported by the
// execution contract.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::YesNoArbitrageConfig;
use crate::ledger::LedgerSnapshot;
use crate::market_data::BookManager;
use crate::registry::MarketRegistry;
use crate::types::{SignalPayload, SignalType, StrategyId, TradeSignal};

/// Buy both sides when the ask sum is below this.
const BUY_PARITY_THRESHOLD: Decimal = dec!(0.995);
/// Sell both sides when the bid sum is above this.
const SELL_PARITY_THRESHOLD: Decimal = dec!(1.005);

pub fn scan(
    registry: &MarketRegistry,
    books: &BookManager,
    ledger: &LedgerSnapshot,
    cfg: &YesNoArbitrageConfig,
    now_ms: i64,
) -> Vec<TradeSignal> {
    let mut signals = Vec::new();

    for market in registry.filtered(|m| m.is_active() && m.is_binary()) {
        let (yes_token, no_token) = match registry.pair_tokens(&market.id) {
            Some(pair) => pair,
            None => continue,
        };
        let (yes_snap, no_snap) = match (books.snapshot(&yes_token), books.snapshot(&no_token)) {
            (Some(y), Some(n)) => (y, n),
            _ => continue,
        };

        let buy_total = yes_snap.best_ask() + no_snap.best_ask();
        if buy_total < BUY_PARITY_THRESHOLD && buy_total > Decimal::ZERO {
            let profit_pct = (Decimal::ONE - buy_total) / buy_total;
            if profit_pct < cfg.min_spread {
                continue;
            }
            let size = cfg.max_position_size / buy_total;
            // Walking the ladder past the touch must not eat the edge.
            let slippage_ok = [&yes_snap, &no_snap].iter().all(|snap| {
                snap.price_impact(crate::types::Side::Buy, size)
                    .map(|(_, impact)| impact <= cfg.max_slippage)
                    .unwrap_or(false)
            });
            if !slippage_ok {
                debug!(market_id = %market.id, "parity edge too thin after slippage");
                continue;
            }
            signals.push(TradeSignal {
                strategy: StrategyId::YesNoArbitrage,
                signal_type: SignalType::BuyPair,
                market_id: market.id.clone(),
                token_id: yes_token.clone(),
                side_label: "BOTH".to_string(),
                price: buy_total,
                size,
                confidence: parity_confidence(profit_pct, cfg.target_profit_pct),
                expected_profit_pct: profit_pct,
                reason: format!("Yes+No=${buy_total:.4} < $1 (profit: {profit_pct:.4})"),
                payload: SignalPayload::Pair {
                    yes_token: yes_token.clone(),
                    no_token: no_token.clone(),
                    yes_price: yes_snap.best_ask(),
                    no_price: no_snap.best_ask(),
                },
                ts_ms: now_ms,
            });
            continue;
        }

        let sell_total = yes_snap.best_bid() + no_snap.best_bid();
        if sell_total > SELL_PARITY_THRESHOLD {
            let inventory = ledger.pair_inventory(
                &market.id,
                &yes_token,
                &no_token,
                StrategyId::YesNoArbitrage,
            );
            if inventory <= Decimal::ZERO {
                debug!(market_id = %market.id, "sell parity seen but no pair inventory");
                continue;
            }
            let profit_pct = sell_total - Decimal::ONE;
            if profit_pct < cfg.min_spread {
                continue;
            }
            signals.push(TradeSignal {
                strategy: StrategyId::YesNoArbitrage,
                signal_type: SignalType::SellPair,
                market_id: market.id.clone(),
                token_id: yes_token.clone(),
                side_label: "BOTH".to_string(),
                price: sell_total,
                size: inventory,
                confidence: parity_confidence(profit_pct, cfg.target_profit_pct),
                expected_profit_pct: profit_pct,
                reason: format!("Yes+No=${sell_total:.4} > $1 (profit: {profit_pct:.4})"),
                payload: SignalPayload::Pair {
                    yes_token: yes_token.clone(),
                    no_token: no_token.clone(),
                    yes_price: yes_snap.best_bid(),
                    no_price: no_snap.best_bid(),
                },
                ts_ms: now_ms,
            });
        }
    }

    signals.sort_by(|a, b| b.expected_profit_pct.cmp(&a.expected_profit_pct));
    signals
}

/// Confidence saturates at 0.95 as the edge approaches the target profit.
fn parity_confidence(profit_pct: Decimal, target: Decimal) -> f64 {
    if target <= Decimal::ZERO {
        return 0.95;
    }
    let ratio = (profit_pct / target).to_f64().unwrap_or(0.0);
    ratio.min(0.95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use serde_json::json;

    fn registry_with_binary() -> MarketRegistry {
        let registry = MarketRegistry::new();
        registry.update_from_catalog(&[json!({
            "id": "m1",
            "question": "Will BTC close above $100k?",
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["yes-tok", "no-tok"],
            "outcomePrices": ["0.48", "0.49"],
        })]);
        registry
    }

    fn books_with(yes_bid: Decimal, yes_ask: Decimal, no_bid: Decimal, no_ask: Decimal) -> BookManager {
        let books = BookManager::new();
        books.apply("yes-tok", &[(yes_bid, dec!(1000))], &[(yes_ask, dec!(1000))], 1);
        books.apply("no-tok", &[(no_bid, dec!(1000))], &[(no_ask, dec!(1000))], 1);
        books
    }

    #[test]
    fn buy_pair_emitted_below_parity() {
        // S1: asks Y@0.48 and N@0.49 with $10,000 capital.
        let registry = registry_with_binary();
        let books = books_with(dec!(0.47), dec!(0.48), dec!(0.48), dec!(0.49));
        let ledger = Ledger::new(dec!(10000)).snapshot();
        let cfg = YesNoArbitrageConfig::default();

        let signals = scan(&registry, &books, &ledger, &cfg, 1);
        assert_eq!(signals.len(), 1);
        let sig = &signals[0];
        assert_eq!(sig.signal_type, SignalType::BuyPair);
        assert_eq!(sig.price, dec!(0.97));
        assert_eq!(sig.size, dec!(10000) / dec!(0.97));
        assert_eq!(sig.expected_profit_pct, dec!(0.03) / dec!(0.97));
        match &sig.payload {
            SignalPayload::Pair { yes_price, no_price, .. } => {
                assert_eq!(*yes_price, dec!(0.48));
                assert_eq!(*no_price, dec!(0.49));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        // ~3.1% edge over a 3% target saturates close to but below 0.95.
        assert!(sig.confidence > 0.9 && sig.confidence <= 0.95);
    }

    #[test]
    fn fair_book_is_silent() {
        let registry = registry_with_binary();
        let books = books_with(dec!(0.49), dec!(0.50), dec!(0.49), dec!(0.50));
        let ledger = Ledger::new(dec!(10000)).snapshot();
        let cfg = YesNoArbitrageConfig::default();

        assert!(scan(&registry, &books, &ledger, &cfg, 1).is_empty());
    }

    #[test]
    fn edge_below_min_spread_is_dropped() {
        let registry = registry_with_binary();
        // Total 0.994: under parity but only ~0.6% edge.
        let books = books_with(dec!(0.48), dec!(0.497), dec!(0.48), dec!(0.497));
        let ledger = Ledger::new(dec!(10000)).snapshot();
        let mut cfg = YesNoArbitrageConfig::default();
        cfg.min_spread = dec!(0.01);

        assert!(scan(&registry, &books, &ledger, &cfg, 1).is_empty());
    }

    #[test]
    fn sell_pair_requires_matched_inventory() {
        let registry = registry_with_binary();
        let books = books_with(dec!(0.52), dec!(0.53), dec!(0.49), dec!(0.50));
        let cfg = YesNoArbitrageConfig::default();

        // Without inventory: silent.
        let empty = Ledger::new(dec!(10000)).snapshot();
        assert!(scan(&registry, &books, &empty, &cfg, 1).is_empty());

        // With a matched pair held by this strategy: SellPair sized to it.
        let ledger = Ledger::new(dec!(10000));
        let res = ledger.reserve(dec!(200)).unwrap();
        ledger
            .apply_fill(
                res,
                &[
                    crate::ledger::LegFill {
                        market_id: "m1".into(),
                        token_id: "yes-tok".into(),
                        side: crate::types::Side::Buy,
                        position_side: crate::ledger::PositionSide::Yes,
                        price: dec!(0.45),
                        size: dec!(150),
                    },
                    crate::ledger::LegFill {
                        market_id: "m1".into(),
                        token_id: "no-tok".into(),
                        side: crate::types::Side::Buy,
                        position_side: crate::ledger::PositionSide::No,
                        price: dec!(0.45),
                        size: dec!(120),
                    },
                ],
                StrategyId::YesNoArbitrage,
                1,
            )
            .unwrap();

        let signals = scan(&registry, &books, &ledger.snapshot(), &cfg, 2);
        assert_eq!(signals.len(), 1);
        let sig = &signals[0];
        assert_eq!(sig.signal_type, SignalType::SellPair);
        assert_eq!(sig.size, dec!(120));
        assert_eq!(sig.price, dec!(1.01));
        assert_eq!(sig.expected_profit_pct, dec!(0.01));
    }

    #[test]
    fn thin_ladder_slippage_blocks_the_buy() {
        let registry = registry_with_binary();
        // Tiny touch sizes force the fill deep into a much worse level.
        let books = BookManager::new();
        books.apply(
            "yes-tok",
            &[(dec!(0.40), dec!(10))],
            &[(dec!(0.48), dec!(100)), (dec!(0.70), dec!(50000))],
            1,
        );
        books.apply(
            "no-tok",
            &[(dec!(0.40), dec!(10))],
            &[(dec!(0.49), dec!(100)), (dec!(0.70), dec!(50000))],
            1,
        );
        let ledger = Ledger::new(dec!(10000)).snapshot();
        let cfg = YesNoArbitrageConfig::default();

        assert!(scan(&registry, &books, &ledger, &cfg, 1).is_empty());
    }

    #[test]
    fn missing_book_is_skipped() {
        let registry = registry_with_binary();
        let books = BookManager::new();
        books.apply("yes-tok", &[(dec!(0.40), dec!(10))], &[(dec!(0.45), dec!(10))], 1);
        let ledger = Ledger::new(dec!(10000)).snapshot();
        let cfg = YesNoArbitrageConfig::default();

        assert!(scan(&registry, &books, &ledger, &cfg, 1).is_empty());
    }
}
