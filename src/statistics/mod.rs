//! Variant comparison and experiment sizing.
//!
//! [`StatisticsEngine`] pools [`ExperimentResult`] records per variant, compares every treatment
//! against the control with a two-proportion z-test and a chi-square test, and declares a winner
//! once every comparison is significant.
mod distribution;
mod hypothesis;
mod result;
mod sample_size;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{EngineConfig, Experiment, Result};

pub use distribution::{erf, normal_cdf, normal_quantile, z_critical};
pub use hypothesis::{
    chi_square, difference_interval, wilson_interval, z_test, ChiSquare, ConfidenceInterval,
    ZTest,
};
pub use result::ExperimentResult;
pub use sample_size::{SampleSizeEstimate, SampleSizeRequest, DEFAULT_ELIGIBLE_FRACTION};

/// Statistics cannot be computed from the given results.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error(
    "insufficient data for experiment {}: {reason}",
    .experiment_id.as_deref().unwrap_or("<unknown>")
)]
pub struct InsufficientData {
    /// `None` when no result record was supplied.
    pub experiment_id: Option<String>,
    #[allow(missing_docs)]
    pub reason: String,
}

/// Summary of one variant, pooled over all its result records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct VariantStatistics {
    pub variant_id: String,
    pub variant_name: Option<String>,
    pub is_control: bool,
    pub sample_size: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    /// Sample standard deviation of the per-period conversion rates. Needs two or more records.
    pub standard_deviation: Option<f64>,
    pub variance: Option<f64>,
    /// Wilson score interval on `conversion_rate`.
    pub confidence_interval: ConfidenceInterval,
    /// Comparison against the control. `None` for the control itself.
    pub comparison: Option<VariantComparison>,
}

/// Treatment versus control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantComparison {
    /// `treatment_rate - control_rate`.
    pub absolute_difference: f64,
    /// Absolute difference as a percentage of the control rate; `0` when the control rate is `0`.
    pub relative_difference: f64,
    #[allow(missing_docs)]
    pub z_test: ZTest,
    #[allow(missing_docs)]
    pub chi_square: ChiSquare,
    /// Interval on the absolute difference.
    pub difference_interval: ConfidenceInterval,
    /// `z_test.p_value < 1 - confidence_level`.
    pub is_significant: bool,
}

/// Experiment-wide summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct OverallStatistics {
    pub experiment_id: String,
    pub control_variant_id: String,
    pub total_sample_size: u64,
    pub total_conversions: u64,
    pub confidence_level: f64,
    pub all_significant: bool,
    pub winner_determined: bool,
    pub winner_variant_id: Option<String>,
    /// Relative difference of the winner, in percent.
    pub winner_lift: Option<f64>,
}

/// Output of [`StatisticsEngine::calculate_experiment_statistics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatistics {
    /// In order of first appearance in the input.
    pub variants: Vec<VariantStatistics>,
    #[allow(missing_docs)]
    pub experiment_stats: OverallStatistics,
}

impl ExperimentStatistics {
    #[allow(missing_docs)]
    pub fn variant(&self, variant_id: &str) -> Option<&VariantStatistics> {
        self.variants.iter().find(|v| v.variant_id == variant_id)
    }

    /// One pooled result record per variant with interval, p-value and significance filled in.
    pub fn to_results(&self) -> Vec<ExperimentResult> {
        let experiment_id = &self.experiment_stats.experiment_id;
        self.variants
            .iter()
            .map(|v| ExperimentResult {
                variant_name: v.variant_name.clone(),
                is_control: v.is_control,
                conversion_rate: Some(v.conversion_rate),
                confidence_interval_lower: Some(v.confidence_interval.lower),
                confidence_interval_upper: Some(v.confidence_interval.upper),
                p_value: v.comparison.as_ref().map(|c| c.z_test.p_value),
                statistical_significance: v.comparison.as_ref().map(|c| c.is_significant),
                ..ExperimentResult::new(
                    experiment_id.clone(),
                    v.variant_id.clone(),
                    v.sample_size,
                    v.conversions,
                )
            })
            .collect()
    }
}

/// Computes [`ExperimentStatistics`] and sample-size estimates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticsEngine {
    confidence_level: f64,
    daily_traffic: u64,
    eligible_fraction: f64,
}

impl Default for StatisticsEngine {
    fn default() -> StatisticsEngine {
        StatisticsEngine {
            confidence_level: 0.95,
            daily_traffic: EngineConfig::DEFAULT_DAILY_TRAFFIC,
            eligible_fraction: DEFAULT_ELIGIBLE_FRACTION,
        }
    }
}

#[derive(Default)]
struct VariantTotals<'a> {
    variant_id: &'a str,
    variant_name: Option<&'a str>,
    is_control: bool,
    sample_size: u64,
    conversions: u64,
    rates: Vec<f64>,
}

impl StatisticsEngine {
    /// Engine at 95% confidence.
    pub fn new() -> StatisticsEngine {
        StatisticsEngine::default()
    }

    /// Engine using the configured daily traffic for duration estimates.
    pub fn from_config(config: &EngineConfig) -> StatisticsEngine {
        StatisticsEngine {
            daily_traffic: config.daily_traffic,
            ..StatisticsEngine::default()
        }
    }

    /// Confidence level as a fraction, e.g. `0.95`.
    pub fn with_confidence_level(mut self, confidence_level: f64) -> StatisticsEngine {
        self.confidence_level = confidence_level;
        self
    }

    /// Share of daily traffic assumed eligible for an experiment.
    pub fn with_eligible_fraction(mut self, eligible_fraction: f64) -> StatisticsEngine {
        self.eligible_fraction = eligible_fraction;
        self
    }

    /// Copy of this engine at the confidence level configured on `experiment`.
    pub fn for_experiment(&self, experiment: &Experiment) -> StatisticsEngine {
        self.with_confidence_level(experiment.confidence_level())
    }

    #[allow(missing_docs)]
    pub fn confidence_level(&self) -> f64 {
        self.confidence_level
    }

    /// Pool `results` per variant and compare each treatment against the control.
    ///
    /// The control is the variant flagged `is_control`, or the first variant when none is.
    /// Records are expected to belong to one experiment; use [`calculate_batch`] for mixed input.
    ///
    /// [`calculate_batch`]: StatisticsEngine::calculate_batch
    pub fn calculate_experiment_statistics(
        &self,
        results: &[ExperimentResult],
    ) -> std::result::Result<ExperimentStatistics, InsufficientData> {
        let Some(first) = results.first() else {
            return Err(InsufficientData {
                experiment_id: None,
                reason: "no results".to_owned(),
            });
        };
        let experiment_id = first.experiment_id.clone();

        let mut totals: Vec<VariantTotals> = Vec::new();
        for result in results {
            let index = match totals.iter().position(|t| t.variant_id == result.variant_id) {
                Some(index) => index,
                None => {
                    totals.push(VariantTotals {
                        variant_id: &result.variant_id,
                        ..VariantTotals::default()
                    });
                    totals.len() - 1
                }
            };
            let entry = &mut totals[index];
            entry.variant_name = entry.variant_name.or(result.variant_name.as_deref());
            entry.is_control |= result.is_control;
            entry.sample_size += result.sample_size;
            entry.conversions += result.conversion_count;
            entry.rates.push(result.rate());
        }

        let total_sample_size: u64 = totals.iter().map(|t| t.sample_size).sum();
        if total_sample_size == 0 {
            log::info!(target: "experiments",
                       experiment_id:display;
                       "no samples recorded, skipping statistics");
            return Err(InsufficientData {
                experiment_id: Some(experiment_id),
                reason: "no samples recorded".to_owned(),
            });
        }

        let control_index = totals.iter().position(|t| t.is_control).unwrap_or(0);
        let control = &totals[control_index];

        let variants: Vec<VariantStatistics> = totals
            .iter()
            .enumerate()
            .map(|(index, variant)| {
                let comparison = (index != control_index).then(|| self.compare(control, variant));
                self.summarize(variant, index == control_index, comparison)
            })
            .collect();

        let experiment_stats = self.overall(experiment_id, &variants, control_index);

        log::debug!(target: "experiments",
                    experiment_id:display = experiment_stats.experiment_id,
                    variants = variants.len(),
                    total_sample_size,
                    winner_determined = experiment_stats.winner_determined;
                    "calculated experiment statistics");

        Ok(ExperimentStatistics {
            variants,
            experiment_stats,
        })
    }

    /// Compute statistics for every experiment present in `results`.
    ///
    /// Experiments without data yield an [`InsufficientData`] entry; the others are unaffected.
    pub fn calculate_batch(
        &self,
        results: &[ExperimentResult],
    ) -> BTreeMap<String, std::result::Result<ExperimentStatistics, InsufficientData>> {
        let mut by_experiment: BTreeMap<&str, Vec<ExperimentResult>> = BTreeMap::new();
        for result in results {
            by_experiment
                .entry(&result.experiment_id)
                .or_default()
                .push(result.clone());
        }

        by_experiment
            .into_iter()
            .map(|(experiment_id, results)| {
                (
                    experiment_id.to_owned(),
                    self.calculate_experiment_statistics(&results),
                )
            })
            .collect()
    }

    /// Size a two-arm experiment and estimate its duration at the configured traffic.
    pub fn required_sample_size(&self, request: &SampleSizeRequest) -> Result<SampleSizeEstimate> {
        request.estimate(self.daily_traffic, self.eligible_fraction)
    }

    fn summarize(
        &self,
        totals: &VariantTotals,
        is_control: bool,
        comparison: Option<VariantComparison>,
    ) -> VariantStatistics {
        let conversion_rate = rate(totals.conversions, totals.sample_size);

        let variance = (totals.rates.len() >= 2).then(|| {
            let n = totals.rates.len() as f64;
            let mean = totals.rates.iter().sum::<f64>() / n;
            totals.rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0)
        });

        VariantStatistics {
            variant_id: totals.variant_id.to_owned(),
            variant_name: totals.variant_name.map(str::to_owned),
            is_control,
            sample_size: totals.sample_size,
            conversions: totals.conversions,
            conversion_rate,
            standard_deviation: variance.map(f64::sqrt),
            variance,
            confidence_interval: wilson_interval(
                totals.conversions,
                totals.sample_size,
                self.confidence_level,
            ),
            comparison,
        }
    }

    fn compare(&self, control: &VariantTotals, treatment: &VariantTotals) -> VariantComparison {
        let control_rate = rate(control.conversions, control.sample_size);
        let treatment_rate = rate(treatment.conversions, treatment.sample_size);
        let absolute_difference = treatment_rate - control_rate;
        let relative_difference = if control_rate == 0.0 {
            0.0
        } else {
            absolute_difference / control_rate * 100.0
        };

        let z_test = z_test(
            treatment.conversions,
            treatment.sample_size,
            control.conversions,
            control.sample_size,
        );
        let chi_square = chi_square(&[
            [
                control.conversions,
                control.sample_size.saturating_sub(control.conversions),
            ],
            [
                treatment.conversions,
                treatment.sample_size.saturating_sub(treatment.conversions),
            ],
        ]);

        VariantComparison {
            absolute_difference,
            relative_difference,
            z_test,
            chi_square,
            difference_interval: difference_interval(
                treatment.conversions,
                treatment.sample_size,
                control.conversions,
                control.sample_size,
                self.confidence_level,
            ),
            is_significant: z_test.p_value < 1.0 - self.confidence_level,
        }
    }

    fn overall(
        &self,
        experiment_id: String,
        variants: &[VariantStatistics],
        control_index: usize,
    ) -> OverallStatistics {
        let comparisons: Vec<(&VariantStatistics, &VariantComparison)> = variants
            .iter()
            .filter_map(|v| v.comparison.as_ref().map(|c| (v, c)))
            .collect();

        let all_significant =
            !comparisons.is_empty() && comparisons.iter().all(|(_, c)| c.is_significant);

        let winner = all_significant
            .then(|| {
                comparisons
                    .iter()
                    .filter(|(_, c)| c.relative_difference > 0.0)
                    .max_by(|(_, a), (_, b)| {
                        a.relative_difference.total_cmp(&b.relative_difference)
                    })
            })
            .flatten();

        OverallStatistics {
            experiment_id,
            control_variant_id: variants[control_index].variant_id.clone(),
            total_sample_size: variants.iter().map(|v| v.sample_size).sum(),
            total_conversions: variants.iter().map(|v| v.conversions).sum(),
            confidence_level: self.confidence_level,
            all_significant,
            winner_determined: winner.is_some(),
            winner_variant_id: winner.map(|(v, _)| v.variant_id.clone()),
            winner_lift: winner.map(|(_, c)| c.relative_difference),
        }
    }
}

fn rate(conversions: u64, sample_size: u64) -> f64 {
    if sample_size == 0 {
        0.0
    } else {
        conversions as f64 / sample_size as f64
    }
}
