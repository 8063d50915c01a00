// =============================================================================
// Range coverage (probability hedging)
// =============================================================================
//
// On a multi-outcome market, buy the leading outcomes while the summed price
// stays under the cost ceiling. One outcome must win and pays $1 per share,
// so a set costing < $1 locks in the difference.
//
// The walk is greedy in descending probability and stops at the first
// outcome whose addition would push the set past `max_total_cost`; the set
// accumulated before that addition is the candidate.
// =============================================================================

use rust_decimal::Decimal;

use crate::config::RangeCoverageConfig;
use crate::market_data::BookManager;
use crate::registry::{Market, MarketRegistry};
use crate::types::{CoverLeg, SignalPayload, SignalType, StrategyId, TradeSignal};

/// Coverage is a hold-to-resolution lock; confidence is flat and high.
const COVERAGE_CONFIDENCE: f64 = 0.95;

pub fn scan(
    registry: &MarketRegistry,
    books: &BookManager,
    cfg: &RangeCoverageConfig,
    now_ms: i64,
) -> Vec<TradeSignal> {
    let mut signals = Vec::new();

    for market in registry.filtered(|m| m.is_active() && m.outcomes.len() >= 3) {
        let Some((legs, total_cost)) = find_coverage(&market, books, cfg) else {
            continue;
        };
        if legs.len() < cfg.min_outcomes_covered || total_cost <= Decimal::ZERO {
            continue;
        }

        let profit_pct = (Decimal::ONE - total_cost) / total_cost;
        if profit_pct < cfg.target_profit_pct {
            continue;
        }

        let size = cfg.max_position_size / total_cost;
        signals.push(TradeSignal {
            strategy: StrategyId::RangeCoverage,
            signal_type: SignalType::CoverSet,
            market_id: market.id.clone(),
            token_id: legs[0].token_id.clone(),
            side_label: "MULTIPLE".to_string(),
            price: total_cost,
            size,
            confidence: COVERAGE_CONFIDENCE,
            expected_profit_pct: profit_pct,
            reason: format!(
                "Cover {} outcomes @ ${total_cost:.4} (profit: {profit_pct:.4})",
                legs.len()
            ),
            payload: SignalPayload::Cover { legs },
            ts_ms: now_ms,
        });
    }

    signals.sort_by(|a, b| b.expected_profit_pct.cmp(&a.expected_profit_pct));
    signals
}

/// Greedy coverage walk. Leg weights are proportional to each leg's price
/// within the set, so the budget buys more shares of cheaper outcomes.
fn find_coverage(
    market: &Market,
    books: &BookManager,
    cfg: &RangeCoverageConfig,
) -> Option<(Vec<CoverLeg>, Decimal)> {
    // Prefer the live ask over the catalog price where a book exists.
    let mut priced: Vec<(String, String, Decimal)> = market
        .outcomes
        .iter()
        .map(|o| {
            let price = books
                .snapshot(&o.token_id)
                .map(|s| s.best_ask())
                .filter(|p| *p > Decimal::ZERO && *p < Decimal::ONE)
                .unwrap_or(o.price);
            (o.name.clone(), o.token_id.clone(), price)
        })
        .filter(|(_, _, price)| *price > Decimal::ZERO)
        .collect();
    priced.sort_by(|a, b| b.2.cmp(&a.2));

    let mut total = Decimal::ZERO;
    let mut taken = Vec::new();
    for (name, token_id, price) in priced {
        let potential = total + price;
        if potential > cfg.max_total_cost {
            break;
        }
        total = potential;
        taken.push((name, token_id, price));
    }

    if taken.is_empty() {
        return None;
    }
    let legs = taken
        .into_iter()
        .map(|(outcome, token_id, price)| CoverLeg {
            outcome,
            token_id,
            price,
            weight: price / total,
        })
        .collect();
    Some((legs, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn multi_market(prices: &[&str]) -> MarketRegistry {
        let outcomes: Vec<String> = (0..prices.len()).map(|i| format!("range-{i}")).collect();
        let tokens: Vec<String> = (0..prices.len()).map(|i| format!("tok-{i}")).collect();
        let registry = MarketRegistry::new();
        registry.update_from_catalog(&[json!({
            "id": "m1",
            "question": "Which range will BTC close in?",
            "outcomes": outcomes,
            "clobTokenIds": tokens,
            "outcomePrices": prices,
        })]);
        registry
    }

    #[test]
    fn greedy_walk_stops_before_cost_ceiling() {
        // S3: [0.40, 0.30, 0.15, 0.10, 0.05] with ceiling 0.98. Taking all
        // five would total 1.00, so the fifth leg is rejected and the chosen
        // set totals 0.95.
        let registry = multi_market(&["0.40", "0.30", "0.15", "0.10", "0.05"]);
        let books = BookManager::new();
        let cfg = RangeCoverageConfig::default();
        let mut relaxed = cfg.clone();
        relaxed.target_profit_pct = dec!(0.05);

        let signals = scan(&registry, &books, &relaxed, 1);
        assert_eq!(signals.len(), 1);
        let sig = &signals[0];
        assert_eq!(sig.price, dec!(0.95));
        match &sig.payload {
            SignalPayload::Cover { legs } => {
                assert_eq!(legs.len(), 4);
                assert_eq!(legs[0].price, dec!(0.40));
                assert_eq!(legs[3].price, dec!(0.10));
                // Weights are proportional to price and sum to 1.
                assert_eq!(legs[0].weight, dec!(0.40) / dec!(0.95));
                let weight_sum: Decimal = legs.iter().map(|l| l.weight).sum();
                assert!((weight_sum - Decimal::ONE).abs() < dec!(0.0000001));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        // (1 − 0.95) / 0.95 ≈ 5.26 %.
        assert_eq!(sig.expected_profit_pct, dec!(0.05) / dec!(0.95));
    }

    #[test]
    fn default_target_profit_rejects_thin_coverage() {
        // 5.26% profit is far below the default 25% target.
        let registry = multi_market(&["0.40", "0.30", "0.15", "0.10", "0.05"]);
        let books = BookManager::new();
        let cfg = RangeCoverageConfig::default();

        assert!(scan(&registry, &books, &cfg, 1).is_empty());
    }

    #[test]
    fn rich_coverage_clears_default_target() {
        // Total 0.70 → 42.8% profit.
        let registry = multi_market(&["0.30", "0.25", "0.15"]);
        let books = BookManager::new();
        let cfg = RangeCoverageConfig::default();

        let signals = scan(&registry, &books, &cfg, 1);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].price, dec!(0.70));
        assert_eq!(signals[0].size, cfg.max_position_size / dec!(0.70));
    }

    #[test]
    fn binary_markets_are_ignored() {
        let registry = MarketRegistry::new();
        registry.update_from_catalog(&[json!({
            "id": "m1",
            "question": "Binary",
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["y", "n"],
            "outcomePrices": ["0.30", "0.30"],
        })]);
        let books = BookManager::new();
        let cfg = RangeCoverageConfig::default();

        assert!(scan(&registry, &books, &cfg, 1).is_empty());
    }

    #[test]
    fn min_outcomes_floor_applies() {
        // Only the two largest fit under a tight ceiling.
        let registry = multi_market(&["0.40", "0.30", "0.29"]);
        let books = BookManager::new();
        let mut cfg = RangeCoverageConfig::default();
        cfg.max_total_cost = dec!(0.75);
        cfg.target_profit_pct = dec!(0.01);

        assert!(scan(&registry, &books, &cfg, 1).is_empty());
    }

    #[test]
    fn live_ask_overrides_catalog_price() {
        let registry = multi_market(&["0.30", "0.25", "0.15"]);
        let books = BookManager::new();
        // Ask for the top outcome is much richer than the catalog says.
        books.apply("tok-0", &[(dec!(0.50), dec!(10))], &[(dec!(0.55), dec!(10))], 1);
        let mut cfg = RangeCoverageConfig::default();
        cfg.target_profit_pct = dec!(0.01);

        let signals = scan(&registry, &books, &cfg, 1);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].price, dec!(0.55) + dec!(0.25) + dec!(0.15));
    }
}
