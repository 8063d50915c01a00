// =============================================================================
// Error taxonomy — how the engine classifies and routes failures
// =============================================================================
//
// Routing rules:
//   TransientTransport — retried with exponential backoff (capped at 60 s);
//                        the pending operation keeps its place in line.
//   VenueRejected      — 4xx order rejection. Signal dropped, reservation
//                        released, journal entry written, no retry.
//   InsufficientCapital — reservation failed. Dropped silently; not an error
//                        condition for the session.
//   PartialFailure     — one leg of an atomic group failed. Remaining legs
//                        cancelled best-effort, reservation released; the
//                        strategy may re-emit next scan.
//   InvariantViolation — the ledger reached an impossible state. Fatal: halt
//                        the session, flush the journal, exit with code 2.
//   Config             — startup only; exit with code 1.
// =============================================================================

use rust_decimal::Decimal;
use thiserror::Error;

/// Engine-wide error type. Transport errors stay local to the component that
/// hit them; everything else bubbles up to the scheduler, which decides
/// between retry, drop, and halt.
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O failure, timeout, or 5xx from a venue. Retryable.
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    /// The venue rejected an order outright (price off, balance, closed
    /// market). Not retryable.
    #[error("venue rejected order: {0}")]
    VenueRejected(String),

    /// A capital reservation could not be granted.
    #[error("insufficient capital: requested {requested}, available {available}")]
    InsufficientCapital {
        requested: Decimal,
        available: Decimal,
    },

    /// One or more legs of an atomic group did not fill.
    #[error("partial failure on {strategy}: {detail}")]
    PartialFailure { strategy: String, detail: String },

    /// The ledger detected an impossible state. Fatal.
    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),

    /// Bad or missing configuration at startup.
    #[error("config error: {0}")]
    Config(String),
}

impl EngineError {
    /// Short stable tag used for journal rows and notification rate-limiting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientTransport(_) => "transient_transport",
            Self::VenueRejected(_) => "venue_rejected",
            Self::InsufficientCapital { .. } => "insufficient_capital",
            Self::PartialFailure { .. } => "partial_failure",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::Config(_) => "config",
        }
    }

    /// Whether the scheduler may retry the operation that produced this.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientTransport(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        Self::TransientTransport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::TransientTransport(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
