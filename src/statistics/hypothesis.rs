//! Frequentist tests on conversion counts.
use serde::{Deserialize, Serialize};

use super::distribution::{normal_cdf, z_critical};

/// Two-sided confidence interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    #[allow(missing_docs)]
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

/// Result of a two-proportion z-test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ZTest {
    pub z_score: f64,
    pub p_value: f64,
}

impl ZTest {
    const DEGENERATE: ZTest = ZTest {
        z_score: 0.0,
        p_value: 1.0,
    };
}

/// Result of a chi-square test of independence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ChiSquare {
    pub statistic: f64,
    pub p_value: f64,
}

fn rate(conversions: u64, sample_size: u64) -> f64 {
    if sample_size == 0 {
        0.0
    } else {
        conversions as f64 / sample_size as f64
    }
}

/// Pooled two-proportion z-test of `p1 - p2`, two-sided.
///
/// Returns `z = 0, p = 1` when either sample is empty or the pooled rate is 0 or 1.
pub fn z_test(
    conversions1: u64,
    sample_size1: u64,
    conversions2: u64,
    sample_size2: u64,
) -> ZTest {
    if sample_size1 == 0 || sample_size2 == 0 {
        return ZTest::DEGENERATE;
    }

    let (n1, n2) = (sample_size1 as f64, sample_size2 as f64);
    let p1 = conversions1 as f64 / n1;
    let p2 = conversions2 as f64 / n2;
    let pooled = (conversions1 + conversions2) as f64 / (n1 + n2);

    let standard_error = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if standard_error == 0.0 {
        return ZTest::DEGENERATE;
    }

    let z_score = (p1 - p2) / standard_error;
    ZTest {
        z_score,
        p_value: 2.0 * (1.0 - normal_cdf(z_score.abs())),
    }
}

/// Pearson chi-square statistic of a contingency table.
///
/// The p-value always uses the one-degree-of-freedom form `1 - (2Φ(√χ²) - 1)`, whatever the
/// table shape. Cells with zero expected count contribute nothing.
pub fn chi_square<R: AsRef<[u64]>>(observed: &[R]) -> ChiSquare {
    let row_totals: Vec<f64> = observed
        .iter()
        .map(|row| row.as_ref().iter().sum::<u64>() as f64)
        .collect();
    let columns = observed
        .iter()
        .map(|row| row.as_ref().len())
        .max()
        .unwrap_or(0);
    let column_totals: Vec<f64> = (0..columns)
        .map(|j| {
            observed
                .iter()
                .map(|row| row.as_ref().get(j).copied().unwrap_or(0))
                .sum::<u64>() as f64
        })
        .collect();
    let total: f64 = row_totals.iter().sum();

    if total == 0.0 {
        return ChiSquare {
            statistic: 0.0,
            p_value: 1.0,
        };
    }

    let mut statistic = 0.0;
    for (row, row_total) in observed.iter().zip(&row_totals) {
        for (j, column_total) in column_totals.iter().enumerate() {
            let expected = row_total * column_total / total;
            if expected > 0.0 {
                let observed = row.as_ref().get(j).copied().unwrap_or(0) as f64;
                statistic += (observed - expected).powi(2) / expected;
            }
        }
    }

    ChiSquare {
        statistic,
        p_value: 1.0 - (2.0 * normal_cdf(statistic.sqrt()) - 1.0),
    }
}

/// Wilson score interval for `conversions / sample_size`.
///
/// An empty sample yields the uninformative `[0, 1]`.
pub fn wilson_interval(
    conversions: u64,
    sample_size: u64,
    confidence_level: f64,
) -> ConfidenceInterval {
    if sample_size == 0 {
        return ConfidenceInterval {
            lower: 0.0,
            upper: 1.0,
        };
    }

    let n = sample_size as f64;
    let p = conversions as f64 / n;
    let z = z_critical(confidence_level);
    let z2 = z * z;

    let denominator = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denominator;
    let margin = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denominator;

    // Pin the bounds at the extremes against rounding.
    let lower = if conversions == 0 { 0.0 } else { (center - margin).max(0.0) };
    let upper = if conversions >= sample_size { 1.0 } else { (center + margin).min(1.0) };

    ConfidenceInterval { lower, upper }
}

/// Normal-approximation interval on `p1 - p2` with unpooled variance.
pub fn difference_interval(
    conversions1: u64,
    sample_size1: u64,
    conversions2: u64,
    sample_size2: u64,
    confidence_level: f64,
) -> ConfidenceInterval {
    let p1 = rate(conversions1, sample_size1);
    let p2 = rate(conversions2, sample_size2);
    let difference = p1 - p2;

    let variance = |p: f64, n: u64| if n == 0 { 0.0 } else { p * (1.0 - p) / n as f64 };
    let margin = z_critical(confidence_level)
        * (variance(p1, sample_size1) + variance(p2, sample_size2)).sqrt();

    ConfidenceInterval {
        lower: difference - margin,
        upper: difference + margin,
    }
}
