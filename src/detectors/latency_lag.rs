// =============================================================================
// Latency arbitrage — exploit CLOB lag behind spot moves
// =============================================================================
//
// Precondition: a recent spot impulse inside the execution window. For each
// Bitcoin-related binary market whose question reads "BTC above/over/reach
// $X" (or "below/under $X"), compare the probability implied by the fresh
// spot price against the quoted Yes price. When the impulse direction aligns
// with a probability increase and the quote lags the implied level by more
// than the threshold, buy Yes before the CLOB catches up.
// =============================================================================

use std::sync::OnceLock;

use regex::Regex;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::LatencyArbitrageConfig;
use crate::market_data::{BookManager, PriceAggregator};
use crate::registry::MarketRegistry;
use crate::types::{Direction, PriceImpulse, SignalPayload, SignalType, StrategyId, TradeSignal};

/// Implied probabilities are clamped into this band.
const PROB_FLOOR: Decimal = dec!(0.05);
const PROB_CEIL: Decimal = dec!(0.95);
/// Confidence ceiling.
const MAX_CONFIDENCE: f64 = 0.95;

fn price_target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$?(\d[\d,]*(?:\.\d+)?)\s*([kK])?").expect("static regex compiles")
    })
}

pub fn scan(
    registry: &MarketRegistry,
    books: &BookManager,
    aggregator: &PriceAggregator,
    cfg: &LatencyArbitrageConfig,
    now_ms: i64,
) -> Vec<TradeSignal> {
    let window_ms = (cfg.execution_window_seconds as i64) * 1000;
    let impulses = aggregator.recent_impulses(now_ms, window_ms);
    let Some(impulse) = impulses.last() else {
        return Vec::new();
    };

    let mut signals = Vec::new();
    for market in registry.bitcoin_markets() {
        if !market.is_binary() {
            continue;
        }
        let question = market.question.to_ascii_lowercase();
        if !cfg.target_markets.is_empty()
            && !cfg
                .target_markets
                .iter()
                .any(|kw| question.contains(&kw.to_ascii_lowercase()))
        {
            continue;
        }
        if let Some(signal) = analyze_market_lag(&market, books, impulse, cfg, now_ms) {
            signals.push(signal);
        }
    }
    signals.sort_by(|a, b| b.expected_profit_pct.cmp(&a.expected_profit_pct));
    signals
}

fn analyze_market_lag(
    market: &crate::registry::Market,
    books: &BookManager,
    impulse: &PriceImpulse,
    cfg: &LatencyArbitrageConfig,
    now_ms: i64,
) -> Option<TradeSignal> {
    let question = market.question.to_ascii_lowercase();
    let is_above = ["above", "over", "reach"].iter().any(|w| question.contains(w));
    let is_below = ["below", "under"].iter().any(|w| question.contains(w));
    if !(is_above || is_below) {
        return None;
    }

    let target = extract_price_target(&question)?;
    if target <= Decimal::ZERO {
        return None;
    }
    let spot = impulse.to_price;

    // Implied Yes probability from the fresh spot print.
    let ratio = spot / target;
    let implied = if is_above {
        ratio.max(PROB_FLOOR).min(PROB_CEIL)
    } else {
        (Decimal::ONE - ratio).max(PROB_FLOOR).min(PROB_CEIL)
    };

    // The impulse must point toward a probability increase for Yes.
    let aligned = (is_above && impulse.direction == Direction::Up)
        || (is_below && impulse.direction == Direction::Down);
    if !aligned {
        return None;
    }

    let yes = market.yes_outcome()?;
    let current = books
        .snapshot(&yes.token_id)
        .map(|s| s.mid())
        .filter(|p| *p > Decimal::ZERO)
        .unwrap_or(yes.price);
    if current <= Decimal::ZERO {
        return None;
    }

    let threshold = Decimal::from_f64(cfg.min_price_deviation)?;
    let lag = implied - current;
    if lag <= threshold {
        return None;
    }

    let lag_ratio = (lag / threshold).to_f64().unwrap_or(0.0);
    let confidence = (impulse.confidence * lag_ratio).min(MAX_CONFIDENCE);
    let dollars = cfg.max_position_size * Decimal::from_f64(confidence)?;
    let size = dollars / current;
    let expected_profit_pct = lag / current;

    debug!(
        market_id = %market.id,
        implied = %implied,
        current = %current,
        lag = %lag,
        "CLOB lagging behind spot"
    );

    Some(TradeSignal {
        strategy: StrategyId::LatencyArbitrage,
        signal_type: SignalType::Buy,
        market_id: market.id.clone(),
        token_id: yes.token_id.clone(),
        side_label: "YES".to_string(),
        price: current,
        size,
        confidence,
        expected_profit_pct,
        reason: format!(
            "BTC {} {:.4}, CLOB lagging by {lag:.4}",
            impulse.direction, impulse.change_pct
        ),
        payload: SignalPayload::Directional {
            token_id: yes.token_id.clone(),
        },
        ts_ms: now_ms,
    })
}

/// Pull the dollar target out of a question like "Will BTC be above
/// $100,000 by year-end?" or "BTC to reach 120k?".
fn extract_price_target(question: &str) -> Option<Decimal> {
    for caps in price_target_re().captures_iter(question) {
        let raw = caps.get(1)?.as_str().replace(',', "");
        let mut value: Decimal = raw.parse().ok()?;
        if caps.get(2).is_some() {
            value *= dec!(1000);
        }
        // Ignore small numerals ("top 3", "q4") that are not price levels.
        if value >= dec!(1000) {
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    use crate::market_data::FeedHandle;
    use crate::types::PriceUpdate;

    fn btc_market(question: &str, yes_price: &str) -> MarketRegistry {
        let registry = MarketRegistry::new();
        registry.update_from_catalog(&[json!({
            "id": "m1",
            "question": question,
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["yes-tok", "no-tok"],
            "outcomePrices": [yes_price, "0.45"],
        })]);
        registry
    }

    /// Drive a real impulse through the aggregator: spot jumps 99,000 →
    /// 101,500 within the window (S5).
    fn aggregator_with_impulse() -> PriceAggregator {
        let agg = PriceAggregator::new(0.02, 60_000);
        let feed = Arc::new(FeedHandle::new("binance", vec!["BTCUSDT".to_string()]));
        agg.add_exchange(feed.clone());
        for (price, ts) in [(dec!(99000), 0i64), (dec!(101500), 40_000)] {
            let update = PriceUpdate {
                exchange: "binance".into(),
                symbol: "BTCUSDT".into(),
                bid: price,
                ask: price,
                volume_24h: Decimal::ZERO,
                ts_ms: ts,
                raw: serde_json::Value::Null,
            };
            feed.record(update.clone());
            agg.on_update(update);
        }
        agg
    }

    #[test]
    fn price_target_parses_commas_and_k_suffix() {
        assert_eq!(
            extract_price_target("will btc be above $100,000 by year-end?"),
            Some(dec!(100000))
        );
        assert_eq!(
            extract_price_target("btc to reach 120k this cycle?"),
            Some(dec!(120000))
        );
        assert_eq!(
            extract_price_target("will btc stay over $95,500.50?"),
            Some(dec!(95500.50))
        );
        assert_eq!(extract_price_target("btc in the top 3?"), None);
    }

    #[test]
    fn lagging_above_market_emits_buy_yes() {
        // S5: implied = clamp(101500/100000) = 0.95, Yes @ 0.55, lag 0.40.
        let registry = btc_market("Will BTC be above $100,000 by year-end?", "0.55");
        let books = BookManager::new();
        let agg = aggregator_with_impulse();
        let cfg = LatencyArbitrageConfig::default();

        let signals = scan(&registry, &books, &agg, &cfg, 41_000);
        assert_eq!(signals.len(), 1);
        let sig = &signals[0];
        assert_eq!(sig.token_id, "yes-tok");
        assert_eq!(sig.price, dec!(0.55));
        assert_eq!(sig.expected_profit_pct, dec!(0.40) / dec!(0.55));
        // confidence = min(0.95, 1.0 × 0.40/0.02) saturates at the cap.
        assert!((sig.confidence - 0.95).abs() < 1e-9);
        assert_eq!(sig.size, cfg.max_position_size * dec!(0.95) / dec!(0.55));
    }

    #[test]
    fn no_impulse_means_no_signals() {
        let registry = btc_market("Will BTC be above $100,000 by year-end?", "0.55");
        let books = BookManager::new();
        let agg = PriceAggregator::new(0.02, 60_000);
        let cfg = LatencyArbitrageConfig::default();

        assert!(scan(&registry, &books, &agg, &cfg, 1).is_empty());
    }

    #[test]
    fn stale_impulse_outside_window_is_ignored() {
        let registry = btc_market("Will BTC be above $100,000 by year-end?", "0.55");
        let books = BookManager::new();
        let agg = aggregator_with_impulse();
        let cfg = LatencyArbitrageConfig::default();

        // 16 minutes after the impulse with a 15 minute window.
        let now = 40_000 + 16 * 60 * 1000;
        assert!(scan(&registry, &books, &agg, &cfg, now).is_empty());
    }

    #[test]
    fn misaligned_direction_is_skipped() {
        // Upward impulse on a "below" market implies Yes should fall.
        let registry = btc_market("Will BTC close below $100,000?", "0.30");
        let books = BookManager::new();
        let agg = aggregator_with_impulse();
        let cfg = LatencyArbitrageConfig::default();

        assert!(scan(&registry, &books, &agg, &cfg, 41_000).is_empty());
    }

    #[test]
    fn small_lag_is_skipped() {
        // Yes already at 0.94; lag to the 0.95 clamp is 0.01 < 0.02.
        let registry = btc_market("Will BTC be above $100,000 by year-end?", "0.94");
        let books = BookManager::new();
        let agg = aggregator_with_impulse();
        let cfg = LatencyArbitrageConfig::default();

        assert!(scan(&registry, &books, &agg, &cfg, 41_000).is_empty());
    }

    #[test]
    fn non_btc_markets_are_ignored() {
        let registry = MarketRegistry::new();
        registry.update_from_catalog(&[json!({
            "id": "m1",
            "question": "Will the S&P close above $6,000?",
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["y", "n"],
            "outcomePrices": ["0.30", "0.70"],
        })]);
        let books = BookManager::new();
        let agg = aggregator_with_impulse();
        let cfg = LatencyArbitrageConfig::default();

        assert!(scan(&registry, &books, &agg, &cfg, 41_000).is_empty());
    }

    #[test]
    fn live_book_mid_overrides_catalog_quote() {
        let registry = btc_market("Will BTC be above $100,000 by year-end?", "0.55");
        let books = BookManager::new();
        // Book already repriced to the implied level; no lag left.
        books.apply(
            "yes-tok",
            &[(dec!(0.94), dec!(100))],
            &[(dec!(0.96), dec!(100))],
            1,
        );
        let agg = aggregator_with_impulse();
        let cfg = LatencyArbitrageConfig::default();

        assert!(scan(&registry, &books, &agg, &cfg, 41_000).is_empty());
    }
}
