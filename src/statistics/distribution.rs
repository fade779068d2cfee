//! Standard normal distribution helpers.
use std::f64::consts::SQRT_2;

use statrs::distribution::{ContinuousCDF, Normal};

pub use statrs::function::erf::erf;

/// Critical values for the confidence levels experiments are configured with.
const CRITICAL_VALUES: [(f64, f64); 4] = [
    (0.90, 1.645),
    (0.95, 1.96),
    (0.98, 2.326),
    (0.99, 2.576),
];

/// Standard normal CDF, `0.5 * (1 + erf(x / √2))`.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / SQRT_2))
}

/// Standard normal quantile. `p` outside `(0, 1)` maps to the matching infinity.
pub fn normal_quantile(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    Normal::new(0.0, 1.0).map_or(f64::NAN, |normal| normal.inverse_cdf(p))
}

/// Critical z value for `level`.
///
/// The configured confidence levels (90/95/98/99%) map to their conventional two-sided critical
/// values. Any other level is read as a one-sided quantile, which is how sample-size calculation
/// uses it (`1 - α/2` and `power`).
pub fn z_critical(level: f64) -> f64 {
    CRITICAL_VALUES
        .iter()
        .find(|(known, _)| (known - level).abs() < 1e-9)
        .map(|(_, z)| *z)
        .unwrap_or_else(|| normal_quantile(level))
}
