// =============================================================================
// Market Registry — CLOB catalog polling and market classification
// =============================================================================
//
// Pulls the venue's market catalog on a slow cadence and keeps a classified
// in-memory view: binary vs multi-outcome, Bitcoin-related, near-resolution,
// Yes/No token pairing. Outcome order is canonical and preserved from the
// catalog.
//
// Prices and probabilities are decimals in [0, 1]; comparisons near parity
// are exact decimal comparisons, never binary-float approximations.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clob::ClobClient;

/// Keywords marking a market as Bitcoin-related.
const BITCOIN_KEYWORDS: [&str; 5] = ["bitcoin", "btc", "crypto", "cryptocurrency", "satoshi"];
/// Catalog page size per poll.
const CATALOG_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarketStatus {
    Active,
    Closed,
    Resolved,
    Disputed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resolution {
    Yes,
    No,
    Unknown,
    Invalid,
}

/// Single outcome in a market.
#[derive(Debug, Clone, Serialize)]
pub struct MarketOutcome {
    pub name: String,
    pub token_id: String,
    pub price: Decimal,
    pub volume_24h: Decimal,
    pub liquidity: Decimal,
}

impl MarketOutcome {
    /// Return per dollar risked if this outcome wins.
    pub fn potential_return(&self) -> Option<Decimal> {
        if self.price > Decimal::ZERO {
            Some((Decimal::ONE - self.price) / self.price)
        } else {
            None
        }
    }
}

/// One prediction market as seen in the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    pub description: String,
    pub tags: Vec<String>,
    pub status: MarketStatus,
    pub resolution: Resolution,
    pub outcomes: Vec<MarketOutcome>,
    pub end_ts_ms: Option<i64>,
    pub created_ts_ms: Option<i64>,
    pub volume: Decimal,
    pub liquidity: Decimal,
}

impl Market {
    /// Build a market from a catalog API record. The catalog serializes the
    /// `outcomes` / `clobTokenIds` / `outcomePrices` arrays either as JSON
    /// arrays or as JSON-encoded strings; both shapes are accepted.
    pub fn from_api_response(data: &serde_json::Value) -> Self {
        let names = string_list(&data["outcomes"]);
        let token_ids = string_list(&data["clobTokenIds"]);
        let prices = string_list(&data["outcomePrices"]);

        let outcomes = names
            .iter()
            .enumerate()
            .map(|(i, name)| MarketOutcome {
                name: name.clone(),
                token_id: token_ids.get(i).cloned().unwrap_or_default(),
                price: prices
                    .get(i)
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(Decimal::ZERO),
                volume_24h: Decimal::ZERO,
                liquidity: Decimal::ZERO,
            })
            .collect();

        let status = if data["resolved"].as_bool().unwrap_or(false) {
            MarketStatus::Resolved
        } else if data["disputed"].as_bool().unwrap_or(false) {
            MarketStatus::Disputed
        } else if data["closed"].as_bool().unwrap_or(false) {
            MarketStatus::Closed
        } else {
            MarketStatus::Active
        };

        let resolution = match data["resolvedOutcome"]
            .as_str()
            .or_else(|| data["resolutionOutcome"].as_str())
        {
            Some(s) if s.eq_ignore_ascii_case("yes") => Resolution::Yes,
            Some(s) if s.eq_ignore_ascii_case("no") => Resolution::No,
            Some(s) if s.eq_ignore_ascii_case("invalid") => Resolution::Invalid,
            _ => Resolution::Unknown,
        };

        Self {
            id: data["id"].as_str().unwrap_or_default().to_string(),
            question: data["question"].as_str().unwrap_or_default().to_string(),
            description: data["description"].as_str().unwrap_or_default().to_string(),
            tags: string_list(&data["tags"]),
            status,
            resolution,
            outcomes,
            end_ts_ms: parse_timestamp(&data["endDate"]),
            created_ts_ms: parse_timestamp(&data["createdAt"]),
            volume: parse_decimal(&data["volume"]),
            liquidity: parse_decimal(&data["liquidity"]),
        }
    }

    pub fn is_binary(&self) -> bool {
        self.outcomes.len() == 2
    }

    pub fn is_active(&self) -> bool {
        self.status == MarketStatus::Active
    }

    pub fn is_resolved(&self) -> bool {
        self.status == MarketStatus::Resolved
    }

    /// Sum of all outcome prices; ~1 on a fair book.
    pub fn total_price(&self) -> Decimal {
        self.outcomes.iter().map(|o| o.price).sum()
    }

    /// Deviation of the price sum from 1, the raw parity indicator.
    pub fn price_deviation(&self) -> Decimal {
        (Decimal::ONE - self.total_price()).abs()
    }

    /// Yes outcome of a binary market; falls back to the first outcome.
    pub fn yes_outcome(&self) -> Option<&MarketOutcome> {
        self.outcomes
            .iter()
            .find(|o| {
                let n = o.name.to_ascii_lowercase();
                n == "yes" || n == "true"
            })
            .or_else(|| self.outcomes.first())
    }

    /// No outcome of a binary market; falls back to the second outcome.
    pub fn no_outcome(&self) -> Option<&MarketOutcome> {
        self.outcomes
            .iter()
            .find(|o| {
                let n = o.name.to_ascii_lowercase();
                n == "no" || n == "false"
            })
            .or_else(|| self.outcomes.get(1))
    }

    pub fn leading_outcome(&self) -> Option<&MarketOutcome> {
        self.outcomes.iter().max_by_key(|o| o.price)
    }

    /// Outcomes whose price sits inside the near-certain band.
    pub fn near_certain_outcomes(&self, min_prob: Decimal, max_prob: Decimal) -> Vec<&MarketOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.price >= min_prob && o.price <= max_prob)
            .collect()
    }

    /// Outcomes priced below `threshold` (long-shot filter).
    pub fn underpriced_outcomes(&self, threshold: Decimal) -> Vec<&MarketOutcome> {
        self.outcomes.iter().filter(|o| o.price < threshold).collect()
    }

    /// Hours until the market ends, relative to `now_ms`.
    pub fn time_to_end_hours(&self, now_ms: i64) -> Option<f64> {
        self.end_ts_ms
            .map(|end| (end - now_ms) as f64 / 3_600_000.0)
    }

    pub fn is_bitcoin_related(&self) -> bool {
        let text = format!("{} {}", self.question, self.description).to_ascii_lowercase();
        let tags: Vec<String> = self.tags.iter().map(|t| t.to_ascii_lowercase()).collect();
        BITCOIN_KEYWORDS
            .iter()
            .any(|kw| text.contains(kw) || tags.iter().any(|t| t == kw))
    }

    /// The token paid out at $1 per share, per the venue's resolution
    /// record. `None` while unresolved or when the record is ambiguous.
    pub fn winning_token(&self) -> Option<&str> {
        if !self.is_resolved() {
            return None;
        }
        match self.resolution {
            Resolution::Yes => self.yes_outcome().map(|o| o.token_id.as_str()),
            Resolution::No => self.no_outcome().map(|o| o.token_id.as_str()),
            Resolution::Invalid => None,
            Resolution::Unknown => {
                // Multi-outcome markets settle the winner's price to 1.
                self.outcomes
                    .iter()
                    .find(|o| o.price >= dec!(0.99))
                    .map(|o| o.token_id.as_str())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// In-memory classified view of the venue catalog.
pub struct MarketRegistry {
    markets: RwLock<HashMap<String, Market>>,
}

impl MarketRegistry {
    pub fn new() -> Self {
        Self {
            markets: RwLock::new(HashMap::new()),
        }
    }

    /// Replace or insert every market parsed from a catalog page.
    pub fn update_from_catalog(&self, records: &[serde_json::Value]) {
        let mut markets = self.markets.write();
        for record in records {
            let market = Market::from_api_response(record);
            if market.id.is_empty() {
                continue;
            }
            markets.insert(market.id.clone(), market);
        }
        debug!(count = markets.len(), "registry updated from catalog");
    }

    pub fn upsert(&self, market: Market) {
        if !market.id.is_empty() {
            self.markets.write().insert(market.id.clone(), market);
        }
    }

    pub fn by_id(&self, market_id: &str) -> Option<Market> {
        self.markets.read().get(market_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.markets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.read().is_empty()
    }

    /// Active markets matching the Bitcoin keyword set.
    pub fn bitcoin_markets(&self) -> Vec<Market> {
        self.markets
            .read()
            .values()
            .filter(|m| m.is_active() && m.is_bitcoin_related())
            .cloned()
            .collect()
    }

    /// Active `(market, outcome)` pairs inside the near-certain band.
    pub fn near_resolved(&self, min_prob: Decimal, max_prob: Decimal) -> Vec<(Market, MarketOutcome)> {
        let markets = self.markets.read();
        let mut hits = Vec::new();
        for market in markets.values().filter(|m| m.is_active()) {
            for outcome in market.near_certain_outcomes(min_prob, max_prob) {
                hits.push((market.clone(), outcome.clone()));
            }
        }
        hits
    }

    /// `(yes_token, no_token)` for a binary market, in canonical catalog
    /// order of the Yes/No outcomes.
    pub fn pair_tokens(&self, market_id: &str) -> Option<(String, String)> {
        let markets = self.markets.read();
        let market = markets.get(market_id)?;
        if !market.is_binary() {
            return None;
        }
        let yes = market.yes_outcome()?;
        let no = market.no_outcome()?;
        if yes.token_id.is_empty() || no.token_id.is_empty() || yes.token_id == no.token_id {
            return None;
        }
        Some((yes.token_id.clone(), no.token_id.clone()))
    }

    /// The market owning `token_id`, if any.
    pub fn market_for_token(&self, token_id: &str) -> Option<Market> {
        self.markets
            .read()
            .values()
            .find(|m| m.outcomes.iter().any(|o| o.token_id == token_id))
            .cloned()
    }

    /// Every active market satisfying `predicate`.
    pub fn filtered(&self, predicate: impl Fn(&Market) -> bool) -> Vec<Market> {
        self.markets
            .read()
            .values()
            .filter(|m| predicate(m))
            .cloned()
            .collect()
    }
}

impl Default for MarketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketRegistry")
            .field("markets", &self.markets.read().len())
            .finish()
    }
}

/// Poll the catalog on `refresh_secs` cadence until shutdown flips.
pub async fn run_registry_poll(
    registry: Arc<MarketRegistry>,
    client: Arc<ClobClient>,
    refresh_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(refresh_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("registry poll stopping");
                    return;
                }
            }
        }

        match client.get_markets(CATALOG_PAGE_SIZE, 0, true).await {
            Ok(records) => registry.update_from_catalog(&records),
            Err(e) => warn!(error = %e, "catalog poll failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// The catalog emits list fields either as arrays or as JSON-encoded strings
/// (`"[\"Yes\", \"No\"]"`).
fn string_list(val: &serde_json::Value) -> Vec<String> {
    match val {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        serde_json::Value::String(s) => serde_json::from_str::<Vec<String>>(s).unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn parse_timestamp(val: &serde_json::Value) -> Option<i64> {
    let raw = val.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

fn parse_decimal(val: &serde_json::Value) -> Decimal {
    if let Some(s) = val.as_str() {
        s.parse().unwrap_or(Decimal::ZERO)
    } else if let Some(f) = val.as_f64() {
        Decimal::try_from(f).unwrap_or(Decimal::ZERO)
    } else {
        Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binary_market_record() -> serde_json::Value {
        json!({
            "id": "m1",
            "question": "Will BTC be above $100,000 by year-end?",
            "description": "Resolves Yes if the price of Bitcoin exceeds...",
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["tok-yes", "tok-no"],
            "outcomePrices": ["0.55", "0.46"],
            "tags": ["Crypto"],
            "endDate": "2026-12-31T12:00:00Z",
            "volume": "125000.5",
        })
    }

    #[test]
    fn parses_binary_market_from_catalog() {
        let m = Market::from_api_response(&binary_market_record());
        assert_eq!(m.id, "m1");
        assert!(m.is_binary());
        assert!(m.is_active());
        assert_eq!(m.outcomes[0].token_id, "tok-yes");
        assert_eq!(m.outcomes[1].price, dec!(0.46));
        assert_eq!(m.total_price(), dec!(1.01));
        assert_eq!(m.price_deviation(), dec!(0.01));
        assert_eq!(m.volume, dec!(125000.5));
        assert!(m.end_ts_ms.is_some());
    }

    #[test]
    fn parses_json_encoded_string_lists() {
        let record = json!({
            "id": "m2",
            "question": "Range market",
            "outcomes": "[\"<90k\", \"90-100k\", \">100k\"]",
            "clobTokenIds": "[\"t1\", \"t2\", \"t3\"]",
            "outcomePrices": "[\"0.2\", \"0.5\", \"0.3\"]",
        });
        let m = Market::from_api_response(&record);
        assert_eq!(m.outcomes.len(), 3);
        assert!(!m.is_binary());
        assert_eq!(m.outcomes[1].price, dec!(0.5));
    }

    #[test]
    fn bitcoin_classification_uses_question_description_and_tags() {
        let m = Market::from_api_response(&binary_market_record());
        assert!(m.is_bitcoin_related());

        let other = Market::from_api_response(&json!({
            "id": "m3",
            "question": "Will it rain in London tomorrow?",
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["a", "b"],
            "outcomePrices": ["0.5", "0.5"],
        }));
        assert!(!other.is_bitcoin_related());

        let tagged = Market::from_api_response(&json!({
            "id": "m4",
            "question": "Will the halving narrative hold?",
            "tags": ["Satoshi"],
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["a", "b"],
            "outcomePrices": ["0.5", "0.5"],
        }));
        assert!(tagged.is_bitcoin_related());
    }

    #[test]
    fn near_certain_band_is_inclusive() {
        let registry = MarketRegistry::new();
        registry.update_from_catalog(&[json!({
            "id": "m5",
            "question": "Near resolved",
            "outcomes": ["Yes", "No"],
            "clobTokenIds": ["y", "n"],
            "outcomePrices": ["0.97", "0.03"],
        })]);

        let hits = registry.near_resolved(dec!(0.95), dec!(0.99));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.token_id, "y");

        assert!(registry.near_resolved(dec!(0.98), dec!(0.99)).is_empty());
    }

    #[test]
    fn pair_tokens_binary_only_and_canonical_order() {
        let registry = MarketRegistry::new();
        registry.update_from_catalog(&[
            binary_market_record(),
            json!({
                "id": "m6",
                "question": "Range",
                "outcomes": ["a", "b", "c"],
                "clobTokenIds": ["1", "2", "3"],
                "outcomePrices": ["0.3", "0.3", "0.4"],
            }),
        ]);

        assert_eq!(
            registry.pair_tokens("m1"),
            Some(("tok-yes".to_string(), "tok-no".to_string()))
        );
        assert_eq!(registry.pair_tokens("m6"), None);
        assert_eq!(registry.pair_tokens("missing"), None);
    }

    #[test]
    fn winning_token_follows_resolution_record() {
        let mut record = binary_market_record();
        record["resolved"] = json!(true);
        record["resolvedOutcome"] = json!("No");
        let m = Market::from_api_response(&record);
        assert_eq!(m.status, MarketStatus::Resolved);
        assert_eq!(m.resolution, Resolution::No);
        assert_eq!(m.winning_token(), Some("tok-no"));
    }

    #[test]
    fn winning_token_falls_back_to_settled_price() {
        let m = Market::from_api_response(&json!({
            "id": "m7",
            "question": "Range",
            "resolved": true,
            "outcomes": ["a", "b", "c"],
            "clobTokenIds": ["1", "2", "3"],
            "outcomePrices": ["0", "1", "0"],
        }));
        assert_eq!(m.winning_token(), Some("2"));
    }

    #[test]
    fn unresolved_market_has_no_winning_token() {
        let m = Market::from_api_response(&binary_market_record());
        assert_eq!(m.winning_token(), None);
    }

    #[test]
    fn leading_outcome_is_highest_price() {
        let m = Market::from_api_response(&binary_market_record());
        assert_eq!(m.leading_outcome().unwrap().token_id, "tok-yes");
    }

    #[test]
    fn time_to_end_is_in_hours() {
        let m = Market::from_api_response(&binary_market_record());
        let end = m.end_ts_ms.unwrap();
        let six_hours_before = end - 6 * 3_600_000;
        let hours = m.time_to_end_hours(six_hours_before).unwrap();
        assert!((hours - 6.0).abs() < 1e-9);
    }
}
