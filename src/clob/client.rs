// =============================================================================
// CLOB REST Client — HMAC-SHA256 signed requests to the prediction venue
// =============================================================================
//
// GET endpoints return parsed structured data; POST/DELETE endpoints carry
// the venue auth headers:
//
//   POLY_API_KEY, POLY_PASSPHRASE, POLY_TIMESTAMP (ms since epoch),
//   POLY_SIGNATURE = HMAC-SHA256(api_secret, timestamp || method || path || body)
//
// hex-encoded. The secret is never logged or serialized.
//
// Error mapping: network failures / timeouts / 5xx are transient and
// retryable; a 4xx on an order endpoint is a venue rejection and final.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::{OrderAck, OrderRequest, OrderState};

use super::rate_limit::TokenBucket;

type HmacSha256 = Hmac<Sha256>;

/// Hard timeout for every venue request.
const HTTP_TIMEOUT_SECS: u64 = 10;

/// Venue credentials pulled from the environment.
#[derive(Clone, Default)]
pub struct ClobCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

impl ClobCredentials {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("POLYMARKET_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("POLYMARKET_API_SECRET").unwrap_or_default(),
            api_passphrase: std::env::var("POLYMARKET_API_PASSPHRASE").unwrap_or_default(),
        }
    }
}

impl std::fmt::Debug for ClobCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("api_passphrase", &"<redacted>")
            .finish()
    }
}

/// REST client for the CLOB and its market-catalog API.
pub struct ClobClient {
    creds: ClobCredentials,
    clob_base: String,
    gamma_base: String,
    client: reqwest::Client,
    limiter: TokenBucket,
}

impl ClobClient {
    pub fn new(creds: ClobCredentials, limiter: TokenBucket) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        debug!("ClobClient initialised (base_url=https://clob.polymarket.com)");

        Self {
            creds,
            clob_base: "https://clob.polymarket.com".to_string(),
            gamma_base: "https://gamma-api.polymarket.com".to_string(),
            client,
            limiter,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Hex HMAC-SHA256 over `timestamp || method || path || body`.
    pub fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.creds.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn auth_headers(&self, method: &str, path: &str, body: &str) -> HeaderMap {
        let timestamp = Self::timestamp_ms().to_string();
        let signature = self.sign(&timestamp, method, path, body);

        let mut headers = HeaderMap::new();
        let mut set = |name: &'static str, value: &str| {
            if let Ok(v) = HeaderValue::from_str(value) {
                headers.insert(name, v);
            }
        };
        set("POLY_API_KEY", &self.creds.api_key);
        set("POLY_PASSPHRASE", &self.creds.api_passphrase);
        set("POLY_TIMESTAMP", &timestamp);
        set("POLY_SIGNATURE", &signature);
        headers
    }

    // -------------------------------------------------------------------------
    // Market catalog
    // -------------------------------------------------------------------------

    /// GET /markets from the catalog API.
    #[instrument(skip(self), name = "clob::get_markets")]
    pub async fn get_markets(
        &self,
        limit: u32,
        offset: u32,
        active: bool,
    ) -> EngineResult<Vec<serde_json::Value>> {
        self.limiter.acquire(1).await;
        let url = format!(
            "{}/markets?limit={}&offset={}&active={}&closed=false",
            self.gamma_base, limit, offset, active
        );

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            return Err(EngineError::TransientTransport(format!(
                "GET /markets returned {status}: {body}"
            )));
        }

        let markets = match body {
            serde_json::Value::Array(items) => items,
            other => other["data"].as_array().cloned().unwrap_or_default(),
        };
        debug!(count = markets.len(), "markets fetched");
        Ok(markets)
    }

    /// GET /markets/{id}.
    #[instrument(skip(self), name = "clob::get_market")]
    pub async fn get_market(&self, market_id: &str) -> EngineResult<serde_json::Value> {
        self.limiter.acquire(1).await;
        let url = format!("{}/markets/{}", self.gamma_base, market_id);

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            return Err(EngineError::TransientTransport(format!(
                "GET /markets/{market_id} returned {status}: {body}"
            )));
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Books and trades
    // -------------------------------------------------------------------------

    /// GET /book?token_id=… → `(bids, asks)` as `(price, size)` pairs.
    #[instrument(skip(self), name = "clob::get_book")]
    pub async fn get_book(
        &self,
        token_id: &str,
    ) -> EngineResult<(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>)> {
        self.limiter.acquire(1).await;
        let url = format!("{}/book?token_id={}", self.clob_base, token_id);

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            return Err(EngineError::TransientTransport(format!(
                "GET /book returned {status}: {body}"
            )));
        }

        Ok((parse_levels(&body["bids"]), parse_levels(&body["asks"])))
    }

    /// GET /trades.
    #[instrument(skip(self), name = "clob::get_trades")]
    pub async fn get_trades(&self) -> EngineResult<Vec<serde_json::Value>> {
        self.limiter.acquire(1).await;
        let url = format!("{}/trades", self.clob_base);
        let headers = self.auth_headers("GET", "/trades", "");

        let resp = self.client.get(&url).headers(headers).send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            return Err(EngineError::TransientTransport(format!(
                "GET /trades returned {status}: {body}"
            )));
        }
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    /// GET /positions — venue-side open positions.
    #[instrument(skip(self), name = "clob::get_positions")]
    pub async fn get_positions(&self) -> EngineResult<Vec<serde_json::Value>> {
        self.limiter.acquire(1).await;
        let url = format!("{}/positions", self.clob_base);
        let headers = self.auth_headers("GET", "/positions", "");

        let resp = self.client.get(&url).headers(headers).send().await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            return Err(EngineError::TransientTransport(format!(
                "GET /positions returned {status}: {body}"
            )));
        }
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /order — submit a new order.
    ///
    /// The request carries the client-generated order id so that a network
    /// retry of a POST the venue already accepted collapses instead of
    /// duplicating.
    #[instrument(
        skip(self, request),
        fields(token_id = %request.token_id, side = %request.side, order_type = %request.order_type),
        name = "clob::place_order"
    )]
    pub async fn place_order(&self, request: &OrderRequest) -> EngineResult<OrderAck> {
        self.limiter.acquire(1).await;
        let path = "/order";
        let payload = json!({
            "tokenID": request.token_id,
            "side": request.side.as_str(),
            "price": request.price.to_string(),
            "size": request.size.to_string(),
            "type": request.order_type.to_string(),
            "clientOrderID": request.client_order_id,
        });
        let body = payload.to_string();
        let headers = self.auth_headers("POST", path, &body);
        let url = format!("{}{}", self.clob_base, path);

        debug!(price = %request.price, size = %request.size, "placing order");

        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .body(body)
            .header("Content-Type", "application/json")
            .send()
            .await?;

        let status = resp.status();
        let response: serde_json::Value = resp.json().await?;

        if status.is_client_error() {
            warn!(%status, token_id = %request.token_id, "order rejected by venue");
            return Err(EngineError::VenueRejected(format!(
                "POST /order returned {status}: {response}"
            )));
        }
        if !status.is_success() {
            return Err(EngineError::TransientTransport(format!(
                "POST /order returned {status}: {response}"
            )));
        }

        let ack = parse_order_ack(&response)?;
        debug!(order_id = %ack.order_id, status = ?ack.status, "order placed");
        Ok(ack)
    }

    /// DELETE /order/{id}.
    #[instrument(skip(self), name = "clob::cancel_order")]
    pub async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        self.limiter.acquire(1).await;
        let path = format!("/order/{order_id}");
        let headers = self.auth_headers("DELETE", &path, "");
        let url = format!("{}{}", self.clob_base, path);

        let resp = self.client.delete(&url).headers(headers).send().await?;
        let status = resp.status();

        if status.is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::VenueRejected(format!(
                "DELETE {path} returned {status}: {body}"
            )));
        }
        if !status.is_success() {
            return Err(EngineError::TransientTransport(format!(
                "DELETE {path} returned {status}"
            )));
        }
        debug!(order_id, "order cancelled");
        Ok(())
    }

    /// DELETE /orders?market=… — cancel every resting order on a market.
    #[instrument(skip(self), name = "clob::cancel_market_orders")]
    pub async fn cancel_market_orders(&self, market_id: &str) -> EngineResult<()> {
        self.limiter.acquire(1).await;
        let path = format!("/orders?market={market_id}");
        let headers = self.auth_headers("DELETE", &path, "");
        let url = format!("{}{}", self.clob_base, path);

        let resp = self.client.delete(&url).headers(headers).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            // Nothing resting; treat as success.
            return Ok(());
        }
        if !status.is_success() {
            return Err(EngineError::TransientTransport(format!(
                "DELETE {path} returned {status}"
            )));
        }
        debug!(market_id, "market orders cancelled");
        Ok(())
    }
}

impl std::fmt::Debug for ClobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobClient")
            .field("creds", &self.creds)
            .field("clob_base", &self.clob_base)
            .field("gamma_base", &self.gamma_base)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Parse a `[{"price": "...", "size": "..."}, …]` array into pairs.
fn parse_levels(val: &serde_json::Value) -> Vec<(Decimal, Decimal)> {
    val.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|lvl| {
                    let price: Decimal = lvl["price"].as_str()?.parse().ok()?;
                    let size: Decimal = lvl["size"].as_str()?.parse().ok()?;
                    Some((price, size))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_order_ack(response: &serde_json::Value) -> EngineResult<OrderAck> {
    let order_id = response["orderID"]
        .as_str()
        .or_else(|| response["orderId"].as_str())
        .unwrap_or_default()
        .to_string();
    let status = parse_order_state(response["status"].as_str().unwrap_or_default());
    let filled_size = parse_decimal_field(&response["filledSize"]);
    let avg_price = parse_decimal_field(&response["avgPrice"]);

    Ok(OrderAck {
        order_id,
        status,
        filled_size,
        avg_price,
    })
}

fn parse_order_state(raw: &str) -> OrderState {
    match raw.to_ascii_lowercase().as_str() {
        "filled" | "matched" => OrderState::Filled,
        "partial" | "partially_filled" => OrderState::Partial,
        "live" | "open" | "delayed" => OrderState::Open,
        "cancelled" | "canceled" | "unmatched" => OrderState::Cancelled,
        "simulated" => OrderState::Simulated,
        _ => OrderState::Rejected,
    }
}

fn parse_decimal_field(val: &serde_json::Value) -> Decimal {
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
    use rust_decimal_macros::dec;

    fn client() -> ClobClient {
        let creds = ClobCredentials {
            api_key: "key".into(),
            api_secret: "hunter2".into(),
            api_passphrase: "pass".into(),
        };
        ClobClient::new(creds, TokenBucket::new(100.0, 10))
    }

    #[test]
    fn signature_covers_timestamp_method_path_body() {
        let c = client();
        let a = c.sign("1700000000000", "POST", "/order", "{}");
        let b = c.sign("1700000000001", "POST", "/order", "{}");
        let d = c.sign("1700000000000", "GET", "/order", "{}");
        let e = c.sign("1700000000000", "POST", "/orders", "{}");
        assert_ne!(a, b);
        assert_ne!(a, d);
        assert_ne!(a, e);
        // Hex-encoded SHA-256 output is 64 chars.
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_is_deterministic() {
        let c = client();
        let body = r#"{"tokenID":"t","side":"BUY"}"#;
        assert_eq!(
            c.sign("1700000000000", "POST", "/order", body),
            c.sign("1700000000000", "POST", "/order", body)
        );
    }

    #[test]
    fn levels_parse_from_string_pairs() {
        let raw = serde_json::json!([
            {"price": "0.48", "size": "1000"},
            {"price": "0.47", "size": "0"},
        ]);
        let levels = parse_levels(&raw);
        assert_eq!(levels, vec![(dec!(0.48), dec!(1000)), (dec!(0.47), dec!(0))]);
    }

    #[test]
    fn order_ack_parses_wire_fields() {
        let raw = serde_json::json!({
            "orderID": "abc-123",
            "status": "matched",
            "filledSize": "250.5",
            "avgPrice": "0.4850",
        });
        let ack = parse_order_ack(&raw).unwrap();
        assert_eq!(ack.order_id, "abc-123");
        assert_eq!(ack.status, OrderState::Filled);
        assert_eq!(ack.filled_size, dec!(250.5));
        assert_eq!(ack.avg_price, dec!(0.4850));
    }

    #[test]
    fn order_state_mapping() {
        assert_eq!(parse_order_state("live"), OrderState::Open);
        assert_eq!(parse_order_state("FILLED"), OrderState::Filled);
        assert_eq!(parse_order_state("canceled"), OrderState::Cancelled);
        assert_eq!(parse_order_state("weird"), OrderState::Rejected);
    }

    #[test]
    fn debug_never_leaks_secrets() {
        let c = client();
        let rendered = format!("{c:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
