// =============================================================================
// Journal / Notifier — append-only write-behind channel
// =============================================================================
//
// The engine never blocks on persistence or alerting: events are pushed onto
// an unbounded channel and drained by a worker task into the configured
// sinks. The SQLite journal and the Telegram/Discord fan-out are external
// collaborators implementing `JournalSink` / `NotifierSink`; the default
// sinks log through `tracing`.
//
// Error notifications are rate-limited to one message per
// (kind, first-50-chars) pair per second.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::types::StrategyId;

/// Notification severity/type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
    Trade,
    Profit,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Trade => write!(f, "trade"),
            Self::Profit => write!(f, "profit"),
        }
    }
}

/// One append-only journal row.
#[derive(Debug, Clone, Serialize)]
pub enum JournalEvent {
    Trade {
        ts_ms: i64,
        strategy: StrategyId,
        market_id: String,
        token_id: String,
        side: String,
        price: Decimal,
        size: Decimal,
        cost: Decimal,
        pnl: Decimal,
        status: String,
        simulated: bool,
        metadata: serde_json::Value,
    },
    /// Upserted by market id in the external store.
    PositionUpsert {
        ts_ms: i64,
        position: crate::ledger::Position,
    },
    Performance {
        ts_ms: i64,
        strategy: StrategyId,
        metric: String,
        value: f64,
    },
    SessionStart {
        ts_ms: i64,
        initial_capital: Decimal,
        config: serde_json::Value,
    },
    SessionEnd {
        ts_ms: i64,
        final_capital: Decimal,
        total_trades: u64,
        total_profit: Decimal,
        win_rate: f64,
    },
    Notification {
        ts_ms: i64,
        kind: NotificationKind,
        message: String,
    },
}

/// Persistence collaborator (SQLite journal in production).
pub trait JournalSink: Send + Sync {
    fn record(&self, event: &JournalEvent);
}

/// Alerting collaborator (Telegram/Discord fan-out in production).
pub trait NotifierSink: Send + Sync {
    fn notify(&self, kind: NotificationKind, message: &str);
}

/// Default sink: structured logs.
pub struct LogJournalSink;

impl JournalSink for LogJournalSink {
    fn record(&self, event: &JournalEvent) {
        match event {
            JournalEvent::Trade {
                strategy,
                market_id,
                side,
                price,
                size,
                pnl,
                status,
                simulated,
                ..
            } => info!(
                strategy = %strategy,
                market_id = %market_id,
                side = %side,
                price = %price,
                size = %size,
                pnl = %pnl,
                status = %status,
                simulated,
                "journal trade"
            ),
            JournalEvent::PositionUpsert { position, .. } => info!(
                market_id = %position.market_id,
                token_id = %position.token_id,
                strategy = %position.strategy,
                size = %position.size,
                avg_price = %position.avg_price,
                "journal position"
            ),
            JournalEvent::Performance { strategy, metric, value, .. } => {
                info!(strategy = %strategy, metric = %metric, value, "journal performance")
            }
            JournalEvent::SessionStart { initial_capital, .. } => {
                info!(initial_capital = %initial_capital, "journal session start")
            }
            JournalEvent::SessionEnd {
                final_capital,
                total_trades,
                total_profit,
                win_rate,
                ..
            } => info!(
                final_capital = %final_capital,
                total_trades,
                total_profit = %total_profit,
                win_rate,
                "journal session end"
            ),
            JournalEvent::Notification { kind, message, .. } => match kind {
                NotificationKind::Error => error!(kind = %kind, "{message}"),
                NotificationKind::Warning => warn!(kind = %kind, "{message}"),
                _ => info!(kind = %kind, "{message}"),
            },
        }
    }
}

impl NotifierSink for LogJournalSink {
    fn notify(&self, kind: NotificationKind, message: &str) {
        match kind {
            NotificationKind::Error => error!(kind = %kind, "{message}"),
            NotificationKind::Warning => warn!(kind = %kind, "{message}"),
            _ => info!(kind = %kind, "{message}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle and worker
// ---------------------------------------------------------------------------

/// Cloneable producer half of the journal channel.
#[derive(Clone)]
pub struct JournalHandle {
    tx: mpsc::UnboundedSender<JournalEvent>,
}

impl JournalHandle {
    pub fn record(&self, event: JournalEvent) {
        // A closed channel means we are past shutdown; drop silently.
        let _ = self.tx.send(event);
    }

    pub fn notify(&self, kind: NotificationKind, message: impl Into<String>) {
        self.record(JournalEvent::Notification {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            kind,
            message: message.into(),
        });
    }
}

impl std::fmt::Debug for JournalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalHandle").finish()
    }
}

/// Minimum interval between identical error notifications.
const ERROR_DEDUP_WINDOW: Duration = Duration::from_secs(1);
/// Prefix length used for the dedup key.
const ERROR_KEY_PREFIX: usize = 50;

struct ErrorThrottle {
    last_sent: HashMap<String, Instant>,
}

impl ErrorThrottle {
    fn new() -> Self {
        Self {
            last_sent: HashMap::new(),
        }
    }

    /// True when this (kind, prefix) pair has not fired within the window.
    fn allow(&mut self, kind: NotificationKind, message: &str) -> bool {
        let prefix: String = message.chars().take(ERROR_KEY_PREFIX).collect();
        let key = format!("{kind}:{prefix}");
        let now = Instant::now();
        match self.last_sent.get(&key) {
            Some(last) if now.duration_since(*last) < ERROR_DEDUP_WINDOW => false,
            _ => {
                self.last_sent.insert(key, now);
                true
            }
        }
    }
}

/// Spawn the drain task. The worker runs until every handle is dropped,
/// which flushes the queue and ends the task — the shutdown path simply
/// drops its handles and awaits the join handle.
pub fn spawn_journal(
    journal_sinks: Vec<Box<dyn JournalSink>>,
    notifier_sinks: Vec<Box<dyn NotifierSink>>,
) -> (JournalHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<JournalEvent>();

    let worker = tokio::spawn(async move {
        let mut throttle = ErrorThrottle::new();
        while let Some(event) = rx.recv().await {
            if let JournalEvent::Notification { kind, message, .. } = &event {
                if *kind == NotificationKind::Error && !throttle.allow(*kind, message) {
                    continue;
                }
                for sink in &notifier_sinks {
                    sink.notify(*kind, message);
                }
            }
            for sink in &journal_sinks {
                sink.record(&event);
            }
        }
        info!("journal drained, worker stopping");
    });

    (JournalHandle { tx }, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct CountingSink {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl JournalSink for CountingSink {
        fn record(&self, event: &JournalEvent) {
            let tag = match event {
                JournalEvent::Trade { market_id, .. } => format!("trade:{market_id}"),
                JournalEvent::Notification { message, .. } => format!("note:{message}"),
                JournalEvent::SessionStart { .. } => "session_start".into(),
                JournalEvent::SessionEnd { .. } => "session_end".into(),
                JournalEvent::Performance { metric, .. } => format!("perf:{metric}"),
                JournalEvent::PositionUpsert { position, .. } => {
                    format!("position:{}", position.market_id)
                }
            };
            self.events.lock().push(tag);
        }
    }

    fn trade_event(market: &str) -> JournalEvent {
        JournalEvent::Trade {
            ts_ms: 1,
            strategy: StrategyId::YesNoArbitrage,
            market_id: market.into(),
            token_id: "tok".into(),
            side: "BUY".into(),
            price: Decimal::ONE,
            size: Decimal::ONE,
            cost: Decimal::ONE,
            pnl: Decimal::ZERO,
            status: "filled".into(),
            simulated: true,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn events_flush_in_order_on_shutdown() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = CountingSink { events: events.clone() };
        let (handle, worker) = spawn_journal(vec![Box::new(sink)], vec![]);

        handle.record(trade_event("m1"));
        handle.record(trade_event("m2"));
        drop(handle);
        worker.await.unwrap();

        let seen = events.lock().clone();
        assert_eq!(seen, vec!["trade:m1".to_string(), "trade:m2".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_errors_are_rate_limited() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = CountingSink { events: events.clone() };
        let (handle, worker) = spawn_journal(vec![Box::new(sink)], vec![]);

        handle.notify(NotificationKind::Error, "venue rejected order: price off tick");
        handle.notify(NotificationKind::Error, "venue rejected order: price off tick");
        // Different first-50-chars key passes.
        handle.notify(NotificationKind::Error, "transport timeout on POST /order");
        // Non-error kinds are never throttled.
        handle.notify(NotificationKind::Info, "scan complete");
        handle.notify(NotificationKind::Info, "scan complete");
        drop(handle);
        worker.await.unwrap();

        let seen = events.lock().clone();
        assert_eq!(
            seen,
            vec![
                "note:venue rejected order: price off tick".to_string(),
                "note:transport timeout on POST /order".to_string(),
                "note:scan complete".to_string(),
                "note:scan complete".to_string(),
            ]
        );
    }

    #[test]
    fn throttle_keys_on_kind_and_prefix() {
        let mut throttle = ErrorThrottle::new();
        assert!(throttle.allow(NotificationKind::Error, "same message"));
        assert!(!throttle.allow(NotificationKind::Error, "same message"));
        // Same text under a different kind is a different key.
        assert!(throttle.allow(NotificationKind::Warning, "same message"));
        // Differences beyond the 50-char prefix do not defeat the dedup.
        let base = "x".repeat(50);
        assert!(throttle.allow(NotificationKind::Error, &format!("{base}AAA")));
        assert!(!throttle.allow(NotificationKind::Error, &format!("{base}BBB")));
    }
}
