use serde::{Deserialize, Serialize};

use super::distribution::z_critical;
use crate::{Error, Result};

/// Share of daily traffic assumed to enter an experiment.
pub const DEFAULT_ELIGIBLE_FRACTION: f64 = 0.10;

/// Parameters of a two-arm conversion experiment to size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleSizeRequest {
    /// Expected conversion rate of the control variant.
    pub baseline_rate: f64,
    /// Smallest absolute lift worth detecting; the treatment rate is `baseline_rate + mde`.
    pub minimum_detectable_effect: f64,
    /// Two-sided false positive rate (α).
    #[serde(default = "default_significance")]
    pub significance_level: f64,
    /// Probability of detecting a true effect of the given size (1 - β).
    #[serde(default = "default_power")]
    pub power: f64,
}

fn default_significance() -> f64 {
    0.05
}

fn default_power() -> f64 {
    0.8
}

/// How large an experiment must be, and how long it will take at the configured traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SampleSizeEstimate {
    pub per_group: u64,
    pub total: u64,
    pub estimated_duration_days: u64,
}

impl SampleSizeRequest {
    /// Request with α = 0.05 and power 0.8.
    pub fn new(baseline_rate: f64, minimum_detectable_effect: f64) -> SampleSizeRequest {
        SampleSizeRequest {
            baseline_rate,
            minimum_detectable_effect,
            significance_level: default_significance(),
            power: default_power(),
        }
    }

    #[allow(missing_docs)]
    pub fn with_significance_level(mut self, significance_level: f64) -> SampleSizeRequest {
        self.significance_level = significance_level;
        self
    }

    #[allow(missing_docs)]
    pub fn with_power(mut self, power: f64) -> SampleSizeRequest {
        self.power = power;
        self
    }

    fn validate(&self) -> Result<()> {
        let open_unit = |x: f64| x > 0.0 && x < 1.0;
        let treatment_rate = self.baseline_rate + self.minimum_detectable_effect;

        if !open_unit(self.baseline_rate) {
            return Err(Error::Configuration(format!(
                "baseline rate must be within (0, 1), got {}",
                self.baseline_rate
            )));
        }
        if self.minimum_detectable_effect <= 0.0 || !open_unit(treatment_rate) {
            return Err(Error::Configuration(format!(
                "minimum detectable effect {} must be positive and keep the treatment rate below 1",
                self.minimum_detectable_effect
            )));
        }
        if !open_unit(self.significance_level) || !open_unit(self.power) {
            return Err(Error::Configuration(format!(
                "significance level ({}) and power ({}) must be within (0, 1)",
                self.significance_level, self.power
            )));
        }
        Ok(())
    }

    /// Sample size per group, `ceil(n)` of the pooled-variance normal approximation.
    pub fn per_group(&self) -> Result<u64> {
        self.validate()?;

        let p1 = self.baseline_rate;
        let p2 = p1 + self.minimum_detectable_effect;
        let pooled = (p1 + p2) / 2.0;

        let z_alpha = z_critical(1.0 - self.significance_level / 2.0);
        let z_beta = z_critical(self.power);

        let n = (z_alpha * (2.0 * pooled * (1.0 - pooled)).sqrt()
            + z_beta * (p1 * (1.0 - p1) + p2 * (1.0 - p2)).sqrt())
        .powi(2)
            / self.minimum_detectable_effect.powi(2);

        Ok(n.ceil() as u64)
    }

    /// Full estimate for an experiment receiving `daily_traffic * eligible_fraction` users a day.
    pub fn estimate(
        &self,
        daily_traffic: u64,
        eligible_fraction: f64,
    ) -> Result<SampleSizeEstimate> {
        if daily_traffic == 0 || !(eligible_fraction > 0.0 && eligible_fraction <= 1.0) {
            return Err(Error::Configuration(format!(
                "cannot estimate duration with daily traffic {daily_traffic} \
                 and eligible fraction {eligible_fraction}"
            )));
        }

        let per_group = self.per_group()?;
        let total = per_group * 2;
        let daily_participants = daily_traffic as f64 * eligible_fraction;

        Ok(SampleSizeEstimate {
            per_group,
            total,
            estimated_duration_days: (total as f64 / daily_participants).ceil() as u64,
        })
    }
}
