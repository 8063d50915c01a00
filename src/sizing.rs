// =============================================================================
// Position sizing — Kelly criterion with a fractional safety multiplier
// =============================================================================
//
// Kelly fraction for a bet that wins `b` per $1 risked with probability `p`:
//
//     f = (p·b − q) / b,   q = 1 − p
//
// The full fraction is scaled by a configurable multiplier (half-Kelly by
// default) and clamped to the per-bet capital ceiling. A negative Kelly is
// never allowed to size a short.
// =============================================================================

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::config::CompoundingConfig;

/// Full Kelly fraction. Returns 0 for degenerate odds or edge-free bets.
pub fn kelly_fraction(win_probability: f64, win_amount: f64, loss_amount: f64) -> f64 {
    if loss_amount <= 0.0 || win_amount <= 0.0 {
        return 0.0;
    }
    let q = 1.0 - win_probability;
    let b = win_amount / loss_amount;
    let kelly = (win_probability * b - q) / b;
    kelly.max(0.0)
}

/// Dollar size for a compounding bet given current capital.
///
/// The loss side is conservatively assumed to be the full stake. The result
/// is `capital × min(kelly × kelly_fraction, max_position_pct)`.
pub fn compound_size(
    capital: Decimal,
    confidence: f64,
    expected_profit_pct: Decimal,
    config: &CompoundingConfig,
) -> Decimal {
    if capital <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let win_amount = expected_profit_pct.to_f64().unwrap_or(0.0).max(0.01);
    let kelly = kelly_fraction(confidence, win_amount, 1.0);
    let scaled = (kelly * config.kelly_fraction).min(config.max_position_pct);
    let fraction = Decimal::from_f64(scaled).unwrap_or(Decimal::ZERO);
    capital * fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn kelly_zero_without_edge() {
        // 50/50 at even odds has no edge.
        assert_eq!(kelly_fraction(0.5, 1.0, 1.0), 0.0);
        // Degenerate inputs.
        assert_eq!(kelly_fraction(0.9, 0.0, 1.0), 0.0);
        assert_eq!(kelly_fraction(0.9, 1.0, 0.0), 0.0);
    }

    #[test]
    fn kelly_matches_closed_form() {
        // p=0.6, b=1: f = (0.6 − 0.4) / 1 = 0.2.
        assert!((kelly_fraction(0.6, 1.0, 1.0) - 0.2).abs() < 1e-12);
        // p=0.99, b=0.03: f = (0.99·0.03 − 0.01) / 0.03.
        let expected = (0.99 * 0.03 - 0.01) / 0.03;
        assert!((kelly_fraction(0.99, 0.03, 1.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn negative_kelly_never_goes_short() {
        // Unfavourable bet: p=0.3 at even odds.
        assert_eq!(kelly_fraction(0.3, 1.0, 1.0), 0.0);
        let size = compound_size(dec!(1000), 0.3, dec!(1), &CompoundingConfig::default());
        assert_eq!(size, Decimal::ZERO);
    }

    #[test]
    fn compound_size_is_clamped_to_max_position_pct() {
        let config = CompoundingConfig::default();
        // Near-certain fat edge would want far more than 10%.
        let size = compound_size(dec!(1000), 0.99, dec!(2), &config);
        assert_eq!(size, dec!(100));
    }

    #[test]
    fn compound_size_halves_full_kelly() {
        let mut config = CompoundingConfig::default();
        config.max_position_pct = 1.0;
        let full = kelly_fraction(0.8, 1.0, 1.0);
        let size = compound_size(dec!(1000), 0.8, dec!(1), &config);
        let expected = Decimal::from_f64(full * 0.5).unwrap() * dec!(1000);
        assert_eq!(size, expected);
    }
}
