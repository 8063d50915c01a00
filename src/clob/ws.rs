// =============================================================================
// CLOB Market WebSocket — book snapshot/delta stream per token subscription
// =============================================================================
//
// One connection per token set. Client subscribe frame:
//
//   {"type":"subscribe","channel":"market","assets_ids":[token_id, ...]}
//
// Server messages carry `type ∈ {book, price_change, trade}`. A `book`
// message holds `bids`/`asks` arrays of `{price, size}` strings where a zero
// size deletes the level. Frames may arrive as a single event or an array of
// events.
//
// Runs until the stream drops, then returns so the caller can reconnect with
// backoff. A 30 s read-idle window counts as a drop.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::market_data::BookManager;

/// A stream with no traffic for this long is considered dead.
const READ_IDLE_TIMEOUT_SECS: u64 = 30;

/// Connect, subscribe `token_ids` on the market channel, and feed book
/// events into `books` until the stream ends or errors.
pub async fn run_market_stream(
    ws_url: &str,
    token_ids: &[String],
    books: &Arc<BookManager>,
) -> EngineResult<()> {
    info!(url = %ws_url, tokens = token_ids.len(), "connecting market WebSocket");

    let (ws, _response) = connect_async(ws_url).await?;
    let (mut write, mut read) = ws.split();

    let subscribe = json!({
        "type": "subscribe",
        "channel": "market",
        "assets_ids": token_ids,
    });
    write.send(Message::Text(subscribe.to_string())).await?;
    info!(tokens = token_ids.len(), "market channel subscribed");

    loop {
        let next = tokio::time::timeout(
            Duration::from_secs(READ_IDLE_TIMEOUT_SECS),
            read.next(),
        )
        .await;

        match next {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Err(e) = handle_frame(&text, books) {
                    warn!(error = %e, "failed to handle market frame");
                }
            }
            Ok(Some(Ok(Message::Ping(data)))) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                warn!(error = %e, "market WebSocket read error");
                return Err(e.into());
            }
            Ok(None) => {
                warn!("market WebSocket stream ended");
                return Ok(());
            }
            Err(_) => {
                return Err(EngineError::TransientTransport(format!(
                    "market WebSocket idle for {READ_IDLE_TIMEOUT_SECS}s"
                )));
            }
        }
    }
}

/// A frame is either one event object or an array of them.
fn handle_frame(text: &str, books: &Arc<BookManager>) -> EngineResult<()> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| EngineError::TransientTransport(format!("bad market frame: {e}")))?;

    match root {
        serde_json::Value::Array(events) => {
            for event in &events {
                handle_event(event, books);
            }
        }
        event => handle_event(&event, books),
    }
    Ok(())
}

fn handle_event(event: &serde_json::Value, books: &Arc<BookManager>) {
    let msg_type = event["type"]
        .as_str()
        .or_else(|| event["event_type"].as_str())
        .unwrap_or_default();

    match msg_type {
        "book" => apply_book_event(event, books),
        "price_change" => debug!(payload = %event, "price change"),
        "trade" => debug!(payload = %event, "trade executed"),
        other => debug!(msg_type = other, "unhandled market message"),
    }
}

fn apply_book_event(event: &serde_json::Value, books: &Arc<BookManager>) {
    let token_id = match event["asset_id"].as_str() {
        Some(id) => id,
        None => {
            warn!("book event missing asset_id");
            return;
        }
    };

    let bids = parse_levels(&event["bids"]);
    let asks = parse_levels(&event["asks"]);
    let ts_ms = event["timestamp"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| event["timestamp"].as_i64())
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    books.apply(token_id, &bids, &asks, ts_ms);
}

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

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn book_event_populates_ladder() {
        let books = Arc::new(BookManager::new());
        let frame = r#"{
            "type": "book",
            "asset_id": "tok-1",
            "timestamp": "1700000000000",
            "bids": [{"price": "0.48", "size": "1000"}],
            "asks": [{"price": "0.52", "size": "800"}]
        }"#;
        handle_frame(frame, &books).unwrap();

        let snap = books.snapshot("tok-1").unwrap();
        assert_eq!(snap.best_bid(), dec!(0.48));
        assert_eq!(snap.best_ask(), dec!(0.52));
        assert_eq!(snap.ts_ms, 1_700_000_000_000);
    }

    #[test]
    fn array_frame_applies_every_event() {
        let books = Arc::new(BookManager::new());
        let frame = r#"[
            {"type": "book", "asset_id": "a",
             "bids": [{"price": "0.40", "size": "10"}], "asks": []},
            {"type": "book", "asset_id": "b",
             "bids": [], "asks": [{"price": "0.60", "size": "20"}]}
        ]"#;
        handle_frame(frame, &books).unwrap();
        assert!(books.snapshot("a").is_some());
        assert!(books.snapshot("b").is_some());
    }

    #[test]
    fn zero_size_in_book_event_deletes_level() {
        let books = Arc::new(BookManager::new());
        let seed = r#"{"type":"book","asset_id":"tok",
            "bids":[{"price":"0.48","size":"1000"},{"price":"0.47","size":"500"}],
            "asks":[]}"#;
        handle_frame(seed, &books).unwrap();
        let delta = r#"{"type":"book","asset_id":"tok",
            "bids":[{"price":"0.48","size":"0"}],
            "asks":[]}"#;
        handle_frame(delta, &books).unwrap();

        let snap = books.snapshot("tok").unwrap();
        assert_eq!(snap.best_bid(), dec!(0.47));
    }

    #[test]
    fn non_book_events_are_ignored() {
        let books = Arc::new(BookManager::new());
        let frame = r#"{"type":"trade","asset_id":"tok","price":"0.5"}"#;
        handle_frame(frame, &books).unwrap();
        assert!(books.snapshot("tok").is_none());
    }
}
