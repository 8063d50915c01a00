// =============================================================================
// Price Feed — per-exchange top-of-book streaming with bounded history
// =============================================================================
//
// One `FeedHandle` per external exchange. The WebSocket driver task is the
// only writer of the price cache and history; every other component reads
// immutable clones or consumes the broadcast channel. Within one symbol,
// subscribers observe updates in producer timestamp order.
//
// Reconnection: exponential backoff starting at 1 s, doubling to a 60 s cap,
// reset on a successful connect; the subscription set is re-submitted by
// rebuilding the combined-stream URL.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, Notify};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::{Direction, Momentum, PriceUpdate};

/// Entries retained per symbol in the history ring.
const HISTORY_CAP: usize = 1000;
/// Small constant keeping momentum strength finite on a flat window.
const STRENGTH_EPSILON: f64 = 0.0001;
/// Initial reconnect delay.
const BACKOFF_BASE_SECS: u64 = 1;
/// Reconnect delay ceiling.
const BACKOFF_MAX_SECS: u64 = 60;
/// A stream with no traffic for this long is considered dead.
const READ_IDLE_TIMEOUT_SECS: u64 = 30;

/// Historical OHLCV candle returned by [`fetch_ohlcv`].
#[derive(Debug, Clone)]
pub struct Ohlcv {
    pub ts_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

struct FeedState {
    cache: HashMap<String, PriceUpdate>,
    history: HashMap<String, VecDeque<PriceUpdate>>,
}

/// Shared state for one exchange feed.
pub struct FeedHandle {
    name: String,
    supported: HashSet<String>,
    state: RwLock<FeedState>,
    /// Guards only the subscription-set mutation.
    subscriptions: Mutex<HashSet<String>>,
    /// Wakes the driver when the subscription set changes.
    resubscribe: Arc<Notify>,
    tx: broadcast::Sender<PriceUpdate>,
}

impl FeedHandle {
    pub fn new(name: impl Into<String>, supported: impl IntoIterator<Item = String>) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            name: name.into(),
            supported: supported.into_iter().collect(),
            state: RwLock::new(FeedState {
                cache: HashMap::new(),
                history: HashMap::new(),
            }),
            subscriptions: Mutex::new(HashSet::new()),
            resubscribe: Arc::new(Notify::new()),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supports(&self, symbol: &str) -> bool {
        self.supported.contains(symbol)
    }

    /// Join `symbol` to the subscription set. Idempotent; wakes the transport
    /// driver so a downed connection is re-dialed.
    pub fn subscribe(&self, symbol: &str) {
        let inserted = self.subscriptions.lock().insert(symbol.to_string());
        if inserted {
            info!(exchange = %self.name, symbol, "subscribed");
            self.resubscribe.notify_one();
        }
    }

    /// Drop `symbol` from the subscription set. The transport closes once the
    /// set becomes empty.
    pub fn unsubscribe(&self, symbol: &str) {
        let removed = self.subscriptions.lock().remove(symbol);
        if removed {
            info!(exchange = %self.name, symbol, "unsubscribed");
            self.resubscribe.notify_one();
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// New receiver on the update fan-out channel.
    pub fn updates(&self) -> broadcast::Receiver<PriceUpdate> {
        self.tx.subscribe()
    }

    /// Record an inbound update: cache, history ring, then broadcast.
    /// A lagging consumer never blocks the producer.
    pub fn record(&self, update: PriceUpdate) {
        {
            let mut state = self.state.write();
            state.cache.insert(update.symbol.clone(), update.clone());
            let ring = state
                .history
                .entry(update.symbol.clone())
                .or_insert_with(|| VecDeque::with_capacity(HISTORY_CAP));
            if ring.len() == HISTORY_CAP {
                ring.pop_front();
            }
            ring.push_back(update.clone());
        }
        // Err means no subscribers right now, which is fine.
        let _ = self.tx.send(update);
    }

    /// Last cached update for `symbol`.
    pub fn latest(&self, symbol: &str) -> Option<PriceUpdate> {
        self.state.read().cache.get(symbol).cloned()
    }

    /// Last `n` updates in arrival order.
    pub fn history(&self, symbol: &str, n: usize) -> Vec<PriceUpdate> {
        let state = self.state.read();
        match state.history.get(symbol) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(n);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Population standard deviation of mid prices over the last `lookback`
    /// updates.
    pub fn volatility(&self, symbol: &str, lookback: usize) -> f64 {
        let mids: Vec<f64> = self
            .history(symbol, lookback)
            .iter()
            .filter_map(|u| u.mid().to_f64())
            .collect();
        if mids.len() < 2 {
            return 0.0;
        }
        let avg = mids.iter().sum::<f64>() / mids.len() as f64;
        let variance = mids.iter().map(|p| (p - avg).powi(2)).sum::<f64>() / mids.len() as f64;
        variance.sqrt()
    }

    /// Momentum over the last `lookback` updates.
    pub fn momentum(&self, symbol: &str, lookback: usize) -> Momentum {
        let history = self.history(symbol, lookback);
        if history.len() < 2 {
            return Momentum::flat();
        }

        let first = history.first().and_then(|u| u.mid().to_f64()).unwrap_or(0.0);
        let last = history.last().and_then(|u| u.mid().to_f64()).unwrap_or(0.0);
        if first <= 0.0 {
            return Momentum::flat();
        }

        let change_pct = (last - first) / first;
        let direction = if change_pct > 0.0 {
            Direction::Up
        } else if change_pct < 0.0 {
            Direction::Down
        } else {
            Direction::Flat
        };
        let volatility = self.volatility(symbol, lookback);

        Momentum {
            direction,
            strength: change_pct.abs() / (volatility + STRENGTH_EPSILON),
            change_pct,
            volatility,
        }
    }
}

impl std::fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHandle")
            .field("name", &self.name)
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Binance-style combined-stream driver
// ---------------------------------------------------------------------------

/// Drive the combined WebSocket stream for `handle` until shutdown.
///
/// Stream names follow the `{symbol_lower}@bookTicker` convention joined as
/// `{base}?streams=a/b/c`. The loop re-dials with exponential backoff on any
/// transport failure and rebuilds the URL whenever the subscription set
/// changes.
pub async fn run_feed_stream(handle: Arc<FeedHandle>, stream_base: &str) {
    let mut backoff = BACKOFF_BASE_SECS;

    loop {
        let subs = handle.subscriptions();
        if subs.is_empty() {
            // Nothing to stream; sleep until a subscribe() wakes us.
            handle.resubscribe.notified().await;
            continue;
        }

        let streams: Vec<String> = subs
            .iter()
            .map(|s| format!("{}@bookTicker", s.to_lowercase()))
            .collect();
        let url = format!("{}?streams={}", stream_base, streams.join("/"));
        info!(exchange = %handle.name(), streams = streams.len(), "connecting price stream");

        match connect_async(&url).await {
            Ok((ws, _response)) => {
                info!(exchange = %handle.name(), "price stream connected");
                backoff = BACKOFF_BASE_SECS;

                let (_write, mut read) = ws.split();
                let resubscribed = handle.resubscribe.clone();

                loop {
                    let next = tokio::select! {
                        msg = tokio::time::timeout(
                            Duration::from_secs(READ_IDLE_TIMEOUT_SECS),
                            read.next(),
                        ) => msg,
                        _ = resubscribed.notified() => {
                            debug!(exchange = %handle.name(), "subscription set changed, reconnecting");
                            break;
                        }
                    };

                    match next {
                        Ok(Some(Ok(msg))) => {
                            if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                                match parse_book_ticker(handle.name(), &text) {
                                    Ok(Some(update)) => handle.record(update),
                                    Ok(None) => {}
                                    Err(e) => {
                                        warn!(exchange = %handle.name(), error = %e, "bad stream frame")
                                    }
                                }
                            }
                        }
                        Ok(Some(Err(e))) => {
                            warn!(exchange = %handle.name(), error = %e, "price stream read error");
                            break;
                        }
                        Ok(None) => {
                            warn!(exchange = %handle.name(), "price stream ended");
                            break;
                        }
                        Err(_) => {
                            warn!(
                                exchange = %handle.name(),
                                idle_secs = READ_IDLE_TIMEOUT_SECS,
                                "price stream idle, reconnecting"
                            );
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(
                    exchange = %handle.name(),
                    error = %e,
                    retry_in_secs = backoff,
                    "price stream connect failed"
                );
            }
        }

        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff = (backoff * 2).min(BACKOFF_MAX_SECS);
    }
}

/// Parse a combined-stream bookTicker frame into a [`PriceUpdate`].
///
/// Expected shape:
/// ```json
/// {"stream":"btcusdt@bookTicker",
///  "data":{"s":"BTCUSDT","b":"99000.10","B":"1.2","a":"99000.30","A":"0.8"}}
/// ```
fn parse_book_ticker(exchange: &str, text: &str) -> EngineResult<Option<PriceUpdate>> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| EngineError::TransientTransport(format!("bad stream json: {e}")))?;

    let stream = root["stream"].as_str().unwrap_or_default();
    if !stream.ends_with("@bookTicker") {
        return Ok(None);
    }
    let data = &root["data"];

    let symbol = match data["s"].as_str() {
        Some(s) => s.to_string(),
        None => return Ok(None),
    };
    let bid = parse_decimal(&data["b"]);
    let ask = parse_decimal(&data["a"]);

    Ok(Some(PriceUpdate {
        exchange: exchange.to_string(),
        symbol,
        bid,
        ask,
        volume_24h: Decimal::ZERO,
        ts_ms: Utc::now().timestamp_millis(),
        raw: data.clone(),
    }))
}

fn parse_decimal(val: &serde_json::Value) -> Decimal {
    val.as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::ZERO)
}

/// Synchronous historical klines query against the exchange REST API.
///
/// Response size is bounded by `limit`; transport failures surface as
/// [`EngineError::TransientTransport`].
pub async fn fetch_ohlcv(
    client: &reqwest::Client,
    rest_base: &str,
    symbol: &str,
    timeframe: &str,
    limit: u32,
) -> EngineResult<Vec<Ohlcv>> {
    let url = format!(
        "{rest_base}/api/v3/klines?symbol={symbol}&interval={timeframe}&limit={limit}"
    );

    let resp = client.get(&url).send().await?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await?;

    if !status.is_success() {
        return Err(EngineError::TransientTransport(format!(
            "klines returned {status}: {body}"
        )));
    }

    let raw = body
        .as_array()
        .ok_or_else(|| EngineError::TransientTransport("klines response is not an array".into()))?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = match entry.as_array() {
            Some(a) if a.len() >= 6 => a,
            _ => {
                warn!("skipping malformed kline entry");
                continue;
            }
        };
        candles.push(Ohlcv {
            ts_ms: arr[0].as_i64().unwrap_or(0),
            open: parse_decimal(&arr[1]),
            high: parse_decimal(&arr[2]),
            low: parse_decimal(&arr[3]),
            close: parse_decimal(&arr[4]),
            volume: parse_decimal(&arr[5]),
        });
    }

    debug!(symbol, timeframe, count = candles.len(), "klines fetched");
    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn update(symbol: &str, bid: Decimal, ask: Decimal, ts_ms: i64) -> PriceUpdate {
        PriceUpdate {
            exchange: "binance".into(),
            symbol: symbol.into(),
            bid,
            ask,
            volume_24h: Decimal::ZERO,
            ts_ms,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn subscribe_is_idempotent() {
        let feed = FeedHandle::new("binance", vec!["BTCUSDT".to_string()]);
        feed.subscribe("BTCUSDT");
        feed.subscribe("BTCUSDT");
        assert_eq!(feed.subscriptions().len(), 1);
        feed.unsubscribe("BTCUSDT");
        assert!(feed.subscriptions().is_empty());
    }

    #[test]
    fn history_is_bounded_and_in_arrival_order() {
        let feed = FeedHandle::new("binance", vec!["BTCUSDT".to_string()]);
        for i in 0..(HISTORY_CAP as i64 + 10) {
            feed.record(update("BTCUSDT", dec!(100) + Decimal::from(i), dec!(101), i));
        }
        let full = feed.history("BTCUSDT", HISTORY_CAP + 100);
        assert_eq!(full.len(), HISTORY_CAP);
        // Oldest entries were evicted.
        assert_eq!(full[0].ts_ms, 10);
        let tail = feed.history("BTCUSDT", 3);
        assert_eq!(tail.len(), 3);
        assert!(tail[0].ts_ms < tail[2].ts_ms);
    }

    #[test]
    fn latest_reflects_last_record() {
        let feed = FeedHandle::new("binance", vec!["BTCUSDT".to_string()]);
        assert!(feed.latest("BTCUSDT").is_none());
        feed.record(update("BTCUSDT", dec!(100), dec!(101), 1));
        feed.record(update("BTCUSDT", dec!(102), dec!(103), 2));
        assert_eq!(feed.latest("BTCUSDT").unwrap().ts_ms, 2);
    }

    #[test]
    fn momentum_direction_and_strength() {
        let feed = FeedHandle::new("binance", vec!["BTCUSDT".to_string()]);
        for i in 0..10i64 {
            let px = dec!(100) + Decimal::from(i);
            feed.record(update("BTCUSDT", px, px, i));
        }
        let m = feed.momentum("BTCUSDT", 10);
        assert_eq!(m.direction, Direction::Up);
        assert!((m.change_pct - 0.09).abs() < 1e-9);
        assert!(m.strength > 0.0);
        assert!(m.volatility > 0.0);

        let flat = feed.momentum("ETHUSDT", 10);
        assert_eq!(flat.direction, Direction::Flat);
        assert_eq!(flat.strength, 0.0);
    }

    #[test]
    fn volatility_is_population_stddev() {
        let feed = FeedHandle::new("binance", vec!["BTCUSDT".to_string()]);
        for (i, px) in [dec!(2), dec!(4), dec!(4), dec!(4), dec!(5), dec!(5), dec!(7), dec!(9)]
            .iter()
            .enumerate()
        {
            feed.record(update("BTCUSDT", *px, *px, i as i64));
        }
        // Classic example: population stddev of 2,4,4,4,5,5,7,9 is 2.
        assert!((feed.volatility("BTCUSDT", 8) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn book_ticker_frame_parses() {
        let text = r#"{"stream":"btcusdt@bookTicker","data":{"u":1,"s":"BTCUSDT","b":"99000.10","B":"1.2","a":"99000.30","A":"0.8"}}"#;
        let update = parse_book_ticker("binance", text).unwrap().unwrap();
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.bid, dec!(99000.10));
        assert_eq!(update.ask, dec!(99000.30));
        assert_eq!(update.exchange, "binance");
    }

    #[test]
    fn non_book_ticker_frames_are_skipped() {
        let text = r#"{"stream":"btcusdt@trade","data":{"p":"99000"}}"#;
        assert!(parse_book_ticker("binance", text).unwrap().is_none());
    }
}
