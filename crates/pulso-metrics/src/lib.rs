//! Derived-state engine: per-(legislator, period) metrics and the
//! commerce analysis bundle. Both recomputations are pure functions of the
//! raw tenant state, so re-running them converges and order between
//! concurrent recomputes does not matter.

pub mod analysis;
pub mod legislative;

pub const CRATE_NAME: &str = "pulso-metrics";

/// Ratios are rounded to 4 decimals everywhere they are persisted.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// `numerator / denominator`, 0 when the denominator is 0.
pub fn safe_rate(numerator: i64, denominator: i64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        round4(numerator as f64 / denominator as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_handle_zero_denominators() {
        assert_eq!(safe_rate(3, 0), 0.0);
        assert_eq!(safe_rate(0, 10), 0.0);
        assert_eq!(safe_rate(1, 3), 0.3333);
    }

    #[test]
    fn rounding_is_four_decimals() {
        assert_eq!(round4(0.123456), 0.1235);
        assert_eq!(round4(1.0), 1.0);
        assert_eq!(round4(2.0 / 3.0), 0.6667);
    }
}
