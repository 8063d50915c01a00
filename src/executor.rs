// =============================================================================
// Executor — turns trade signals into atomic leg groups
// =============================================================================
//
// Flow per signal: validate against a ledger snapshot → reserve capital →
// plan legs from the payload variant → place orders → commit fills to the
// ledger (or roll back the reservation).
//
// Atomic groups (BuyPair / SellPair / CoverSet) are placed fill-or-kill and
// in parallel:
//
//   all legs filled      → commit fills, journal the trade
//   any leg unfilled     → cancel resting legs, release the reservation,
//                          journal a partial failure, no ledger mutation
//   transport error      → cancel best-effort, release the reservation,
//                          surface a transient error the scheduler may retry
//
// Dry-run mode synthesizes a full fill of every leg at its target price and
// drives the identical ledger path, which keeps backtests reproducible.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clob::ClobClient;
use crate::error::{EngineError, EngineResult};
use crate::journal::{JournalEvent, JournalHandle, NotificationKind};
use crate::ledger::{CoverageFill, Ledger, LedgerDelta, LegFill, PositionSide};
use crate::types::{
    OrderAck, OrderRequest, OrderState, OrderType, Side, SignalPayload, SignalType, StrategyId,
    TradeSignal,
};

/// One order the executor intends to place.
#[derive(Debug, Clone)]
struct PlannedLeg {
    token_id: String,
    side: Side,
    position_side: PositionSide,
    price: Decimal,
    size: Decimal,
    order_type: OrderType,
}

/// How a leg group ended up.
#[derive(Debug, PartialEq, Eq)]
enum GroupOutcome {
    /// Every leg filled in full.
    AllFilled,
    /// At least one leg did not fill; names the first offender.
    Unfilled(usize),
}

/// Result of a committed execution.
#[derive(Debug)]
pub struct ExecutionReport {
    pub order_ids: Vec<String>,
    pub fills: Vec<LegFill>,
    pub delta: LedgerDelta,
    pub simulated: bool,
}

/// Realized PnL from closing a position set.
#[derive(Debug)]
pub struct ClosedPnL {
    pub realized: Decimal,
    pub legs: usize,
}

struct RestingOrder {
    order_id: String,
}

pub struct Executor {
    client: Arc<ClobClient>,
    ledger: Arc<Ledger>,
    journal: JournalHandle,
    dry_run: bool,
    /// Hard cap on any single reservation (risk.max_position_size).
    max_reservation: Decimal,
    /// Resting GTC orders per market, cancelled on requote or close.
    resting: Mutex<HashMap<String, Vec<RestingOrder>>>,
}

impl Executor {
    pub fn new(
        client: Arc<ClobClient>,
        ledger: Arc<Ledger>,
        journal: JournalHandle,
        dry_run: bool,
        max_reservation: Decimal,
    ) -> Self {
        info!(dry_run, max_reservation = %max_reservation, "executor initialised");
        Self {
            client,
            ledger,
            journal,
            dry_run,
            max_reservation,
            resting: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    pub async fn execute(&self, signal: &TradeSignal) -> EngineResult<ExecutionReport> {
        let mut legs = plan_legs(signal)?;
        if legs.is_empty() {
            return Err(EngineError::VenueRejected("signal plans no legs".into()));
        }

        // Scale the whole group down to the reservation ceiling.
        let mut estimate = buy_cost(&legs);
        if estimate > self.max_reservation && estimate > Decimal::ZERO {
            let factor = self.max_reservation / estimate;
            for leg in &mut legs {
                leg.size *= factor;
            }
            debug!(
                strategy = %signal.strategy,
                factor = %factor,
                "signal scaled to reservation ceiling"
            );
            estimate = buy_cost(&legs);
        }

        let reservation = self.ledger.reserve(estimate)?;
        let atomic = matches!(
            signal.signal_type,
            SignalType::BuyPair | SignalType::SellPair | SignalType::CoverSet
        );

        // Market making requotes: clear our previous quotes first.
        if matches!(signal.payload, SignalPayload::Mm { .. }) && !self.dry_run {
            if let Err(e) = self.cancel_resting(&signal.market_id).await {
                warn!(market_id = %signal.market_id, error = %e, "requote cancel failed");
            }
        }

        let acks = if self.dry_run {
            legs.iter().map(simulate_fill).collect::<Vec<_>>()
        } else {
            match self.place_group(&legs, atomic).await {
                Ok(acks) => acks,
                Err(e) => {
                    self.ledger.release(reservation);
                    if !e.is_retryable() {
                        self.journal.notify(NotificationKind::Error, e.to_string());
                    }
                    return Err(e);
                }
            }
        };

        if atomic {
            if let GroupOutcome::Unfilled(idx) = summarize_group(&acks) {
                // Roll back: cancel anything resting, release the hold.
                for ack in acks.iter().filter(|a| a.status.is_resting()) {
                    let _ = self.client.cancel_order(&ack.order_id).await;
                }
                self.ledger.release(reservation);
                let err = EngineError::PartialFailure {
                    strategy: signal.strategy.name().to_string(),
                    detail: format!(
                        "leg {} ({}) not filled: {:?}",
                        idx, legs[idx].token_id, acks[idx].status
                    ),
                };
                self.journal
                    .notify(NotificationKind::Error, err.to_string());
                return Err(err);
            }
        }

        // Track resting GTC remainders for later requote/close cancels.
        {
            let mut resting = self.resting.lock();
            let entry = resting.entry(signal.market_id.clone()).or_default();
            for ack in acks.iter().filter(|a| a.status.is_resting()) {
                entry.push(RestingOrder {
                    order_id: ack.order_id.clone(),
                });
            }
        }

        let fills = collect_fills(signal, &legs, &acks);
        let delta = match &signal.payload {
            SignalPayload::Cover { .. } => {
                let coverage_fills: Vec<CoverageFill> = fills
                    .iter()
                    .map(|f| CoverageFill {
                        token_id: f.token_id.clone(),
                        price: f.price,
                        size: f.size,
                    })
                    .collect();
                self.ledger.apply_coverage(
                    reservation,
                    &signal.market_id,
                    coverage_fills,
                    signal.strategy,
                    signal.ts_ms,
                )?
            }
            _ => self
                .ledger
                .apply_fill(reservation, &fills, signal.strategy, signal.ts_ms)?,
        };

        let estimate_pnl = estimated_pnl(signal, &fills);
        for fill in &fills {
            self.journal.record(JournalEvent::Trade {
                ts_ms: Utc::now().timestamp_millis(),
                strategy: signal.strategy,
                market_id: fill.market_id.clone(),
                token_id: fill.token_id.clone(),
                side: fill.side.to_string(),
                price: fill.price,
                size: fill.size,
                cost: fill.price * fill.size,
                pnl: estimate_pnl,
                status: if self.dry_run { "simulated" } else { "filled" }.to_string(),
                simulated: self.dry_run,
                metadata: serde_json::json!({
                    "signal_type": signal.signal_type.to_string(),
                    "reason": signal.reason,
                }),
            });
        }

        // Mirror the surviving positions into the journal's position table.
        let post = self.ledger.snapshot();
        for fill in &fills {
            if let Some(position) =
                post.position(&fill.market_id, &fill.token_id, signal.strategy)
            {
                self.journal.record(JournalEvent::PositionUpsert {
                    ts_ms: Utc::now().timestamp_millis(),
                    position: position.clone(),
                });
            }
        }

        info!(
            strategy = %signal.strategy,
            market_id = %signal.market_id,
            legs = fills.len(),
            realized = %delta.realized_pnl,
            simulated = self.dry_run,
            "execution committed"
        );

        Ok(ExecutionReport {
            order_ids: acks.into_iter().map(|a| a.order_id).collect(),
            fills,
            delta,
            simulated: self.dry_run,
        })
    }

    /// Market-sell every open position this strategy holds on the market.
    pub async fn close(
        &self,
        market_id: &str,
        strategy: StrategyId,
    ) -> EngineResult<ClosedPnL> {
        if !self.dry_run {
            if let Err(e) = self.cancel_resting(market_id).await {
                warn!(market_id, error = %e, "close-time cancel failed");
            }
        }

        let snapshot = self.ledger.snapshot();
        let positions: Vec<_> = snapshot
            .positions
            .iter()
            .filter(|p| p.market_id == market_id && p.strategy == strategy && p.size > Decimal::ZERO)
            .cloned()
            .collect();
        if positions.is_empty() {
            return Ok(ClosedPnL {
                realized: Decimal::ZERO,
                legs: 0,
            });
        }

        let legs: Vec<PlannedLeg> = positions
            .iter()
            .map(|p| PlannedLeg {
                token_id: p.token_id.clone(),
                side: Side::Sell,
                position_side: p.side,
                price: p.mark_price,
                size: p.size,
                order_type: OrderType::Fok,
            })
            .collect();

        let acks = if self.dry_run {
            legs.iter().map(simulate_fill).collect::<Vec<_>>()
        } else {
            self.place_group(&legs, true).await?
        };

        let reservation = self.ledger.reserve(Decimal::ZERO)?;
        let fills: Vec<LegFill> = legs
            .iter()
            .zip(&acks)
            .filter(|(_, ack)| ack.status.is_filled() && ack.filled_size > Decimal::ZERO)
            .map(|(leg, ack)| LegFill {
                market_id: market_id.to_string(),
                token_id: leg.token_id.clone(),
                side: Side::Sell,
                position_side: leg.position_side,
                price: ack.avg_price,
                size: ack.filled_size,
            })
            .collect();
        let legs_filled = fills.len();
        let delta = self
            .ledger
            .apply_fill(reservation, &fills, strategy, Utc::now().timestamp_millis())?;

        info!(
            market_id,
            strategy = %strategy,
            realized = %delta.realized_pnl,
            "positions closed"
        );
        Ok(ClosedPnL {
            realized: delta.realized_pnl,
            legs: legs_filled,
        })
    }

    // -------------------------------------------------------------------------
    // Placement
    // -------------------------------------------------------------------------

    async fn place_group(
        &self,
        legs: &[PlannedLeg],
        parallel: bool,
    ) -> EngineResult<Vec<OrderAck>> {
        let requests: Vec<OrderRequest> = legs
            .iter()
            .map(|leg| OrderRequest {
                token_id: leg.token_id.clone(),
                side: leg.side,
                price: leg.price,
                size: leg.size,
                order_type: leg.order_type,
                client_order_id: Uuid::new_v4().to_string(),
            })
            .collect();

        if parallel {
            let results = join_all(requests.iter().map(|r| self.client.place_order(r))).await;
            let mut acks = Vec::with_capacity(results.len());
            let mut first_error = None;
            for result in results {
                match result {
                    Ok(ack) => acks.push(ack),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                // Best-effort unwind of whatever is resting.
                for ack in acks.iter().filter(|a| a.status.is_resting()) {
                    let _ = self.client.cancel_order(&ack.order_id).await;
                }
                return Err(e);
            }
            Ok(acks)
        } else {
            let mut acks = Vec::with_capacity(requests.len());
            for request in &requests {
                match self.client.place_order(request).await {
                    Ok(ack) => acks.push(ack),
                    Err(e) => {
                        for ack in acks.iter().filter(|a| a.status.is_resting()) {
                            let _ = self.client.cancel_order(&ack.order_id).await;
                        }
                        return Err(e);
                    }
                }
            }
            Ok(acks)
        }
    }

    async fn cancel_resting(&self, market_id: &str) -> EngineResult<()> {
        let orders = self.resting.lock().remove(market_id).unwrap_or_default();
        for order in &orders {
            if let Err(e) = self.client.cancel_order(&order.order_id).await {
                debug!(order_id = %order.order_id, error = %e, "cancel failed");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("dry_run", &self.dry_run)
            .field("max_reservation", &self.max_reservation)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Planning and summarising (pure)
// ---------------------------------------------------------------------------

fn plan_legs(signal: &TradeSignal) -> EngineResult<Vec<PlannedLeg>> {
    let legs = match (&signal.payload, signal.signal_type) {
        (
            SignalPayload::Pair {
                yes_token,
                no_token,
                yes_price,
                no_price,
            },
            SignalType::BuyPair,
        ) => vec![
            PlannedLeg {
                token_id: yes_token.clone(),
                side: Side::Buy,
                position_side: PositionSide::Yes,
                price: *yes_price,
                size: signal.size,
                order_type: OrderType::Fok,
            },
            PlannedLeg {
                token_id: no_token.clone(),
                side: Side::Buy,
                position_side: PositionSide::No,
                price: *no_price,
                size: signal.size,
                order_type: OrderType::Fok,
            },
        ],
        (
            SignalPayload::Pair {
                yes_token,
                no_token,
                yes_price,
                no_price,
            },
            SignalType::SellPair,
        ) => vec![
            PlannedLeg {
                token_id: yes_token.clone(),
                side: Side::Sell,
                position_side: PositionSide::Yes,
                price: *yes_price,
                size: signal.size,
                order_type: OrderType::Fok,
            },
            PlannedLeg {
                token_id: no_token.clone(),
                side: Side::Sell,
                position_side: PositionSide::No,
                price: *no_price,
                size: signal.size,
                order_type: OrderType::Fok,
            },
        ],
        (SignalPayload::Cover { legs }, SignalType::CoverSet) => legs
            .iter()
            .map(|leg| PlannedLeg {
                token_id: leg.token_id.clone(),
                side: Side::Buy,
                position_side: PositionSide::Yes,
                price: leg.price,
                // Equal share counts per leg lock in min_shares = size.
                size: signal.size,
                order_type: OrderType::Fok,
            })
            .collect(),
        (
            SignalPayload::Mm {
                our_bid,
                our_ask,
                bid_size,
                ask_size,
            },
            _,
        ) => {
            let mut legs = Vec::new();
            if *bid_size > Decimal::ZERO {
                legs.push(PlannedLeg {
                    token_id: signal.token_id.clone(),
                    side: Side::Buy,
                    position_side: PositionSide::Long,
                    price: *our_bid,
                    size: *bid_size,
                    order_type: OrderType::Gtc,
                });
            }
            if *ask_size > Decimal::ZERO {
                legs.push(PlannedLeg {
                    token_id: signal.token_id.clone(),
                    side: Side::Sell,
                    position_side: PositionSide::Short,
                    price: *our_ask,
                    size: *ask_size,
                    order_type: OrderType::Gtc,
                });
            }
            legs
        }
        (SignalPayload::Directional { token_id }, SignalType::Buy) => vec![PlannedLeg {
            token_id: token_id.clone(),
            side: Side::Buy,
            position_side: if signal.side_label.eq_ignore_ascii_case("no") {
                PositionSide::No
            } else {
                PositionSide::Yes
            },
            price: signal.price,
            size: signal.size,
            // Latency plays need speed; sniping can rest on the book.
            order_type: if signal.strategy == StrategyId::LatencyArbitrage {
                OrderType::Fok
            } else {
                OrderType::Gtc
            },
        }],
        (SignalPayload::Directional { token_id }, SignalType::Sell) => vec![PlannedLeg {
            token_id: token_id.clone(),
            side: Side::Sell,
            position_side: PositionSide::Yes,
            price: signal.price,
            size: signal.size,
            order_type: OrderType::Gtc,
        }],
        (payload, signal_type) => {
            return Err(EngineError::VenueRejected(format!(
                "signal type {signal_type} does not match payload {payload:?}"
            )))
        }
    };
    Ok(legs)
}

fn buy_cost(legs: &[PlannedLeg]) -> Decimal {
    legs.iter()
        .filter(|l| l.side == Side::Buy)
        .map(|l| l.price * l.size)
        .sum()
}

fn simulate_fill(leg: &PlannedLeg) -> OrderAck {
    OrderAck {
        order_id: format!("sim-{}", Uuid::new_v4()),
        status: OrderState::Simulated,
        filled_size: leg.size,
        avg_price: leg.price,
    }
}

fn summarize_group(acks: &[OrderAck]) -> GroupOutcome {
    for (idx, ack) in acks.iter().enumerate() {
        if !ack.status.is_filled() {
            return GroupOutcome::Unfilled(idx);
        }
    }
    GroupOutcome::AllFilled
}

fn collect_fills(signal: &TradeSignal, legs: &[PlannedLeg], acks: &[OrderAck]) -> Vec<LegFill> {
    legs.iter()
        .zip(acks)
        .filter(|(_, ack)| ack.status.is_filled() && ack.filled_size > Decimal::ZERO)
        .map(|(leg, ack)| LegFill {
            market_id: signal.market_id.clone(),
            token_id: leg.token_id.clone(),
            side: leg.side,
            position_side: leg.position_side,
            price: ack.avg_price,
            size: ack.filled_size,
        })
        .collect()
}

/// Journal estimate: min_fill − Σ cost for pair/cover groups, expected
/// profit on cost for directional fills.
fn estimated_pnl(signal: &TradeSignal, fills: &[LegFill]) -> Decimal {
    match signal.signal_type {
        SignalType::BuyPair | SignalType::CoverSet => {
            let min_fill = fills
                .iter()
                .map(|f| f.size)
                .min()
                .unwrap_or(Decimal::ZERO);
            let cost: Decimal = fills.iter().map(|f| f.price * f.size).sum();
            min_fill - cost
        }
        _ => {
            let cost: Decimal = fills.iter().map(|f| f.price * f.size).sum();
            signal.expected_profit_pct * cost
        }
    }
}
