// =============================================================================
// Opportunity detectors
// =============================================================================
//
// Five pure scan functions over market-data and ledger snapshots. Each scan
// produces zero or more trade signals; the scheduler ranks and routes them.
// Detectors never mutate shared state and never place orders.
// =============================================================================

pub mod latency_lag;
pub mod near_resolved;
pub mod parity;
pub mod range_coverage;
pub mod spread_making;
