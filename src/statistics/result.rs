use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    events::{EventType, ExperimentEvent},
    Experiment, ExperimentAssignment, Timestamp,
};

/// Conversion counts of one variant over one period.
///
/// Several records for the same variant (e.g., one per day) are pooled by the
/// [`StatisticsEngine`](super::StatisticsEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ExperimentResult {
    pub experiment_id: String,
    pub variant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_name: Option<String>,
    #[serde(default)]
    pub is_control: bool,
    pub sample_size: u64,
    pub conversion_count: u64,
    /// Derived from the counts when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_interval_lower: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_interval_upper: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistical_significance: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_start: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_end: Option<Timestamp>,
}

impl ExperimentResult {
    /// Result record with only the counts filled in.
    pub fn new(
        experiment_id: impl Into<String>,
        variant_id: impl Into<String>,
        sample_size: u64,
        conversion_count: u64,
    ) -> ExperimentResult {
        ExperimentResult {
            experiment_id: experiment_id.into(),
            variant_id: variant_id.into(),
            variant_name: None,
            is_control: false,
            sample_size,
            conversion_count,
            conversion_rate: None,
            confidence_interval_lower: None,
            confidence_interval_upper: None,
            p_value: None,
            statistical_significance: None,
            period_start: None,
            period_end: None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_control(mut self) -> ExperimentResult {
        self.is_control = true;
        self
    }

    /// Conversion rate of this record, `0` for an empty sample.
    pub fn rate(&self) -> f64 {
        self.conversion_rate.unwrap_or_else(|| {
            if self.sample_size == 0 {
                0.0
            } else {
                self.conversion_count as f64 / self.sample_size as f64
            }
        })
    }

    /// Aggregate tracked assignments and events into one result per variant of `experiment`.
    ///
    /// The sample of a variant is the set of distinct assignments to it; a conversion is an
    /// assignment with at least one `conversion` event not marked as failed. Records from other
    /// experiments are ignored. Variants are listed control first.
    pub fn from_events(
        experiment: &Experiment,
        assignments: &[ExperimentAssignment],
        events: &[ExperimentEvent],
    ) -> Vec<ExperimentResult> {
        let converted: HashSet<Uuid> = events
            .iter()
            .filter(|event| {
                event.experiment_id == experiment.id
                    && event.event_type == EventType::Conversion
                    && event.success_indicator != Some(false)
            })
            .filter_map(|event| event.assignment_id)
            .collect();

        let period_start = events.iter().filter_map(|e| e.occurred_at).min();
        let period_end = events.iter().filter_map(|e| e.occurred_at).max();

        experiment
            .variants()
            .map(|variant| {
                let sample: HashSet<Uuid> = assignments
                    .iter()
                    .filter(|a| a.experiment_id == experiment.id && a.variant_id == variant.id)
                    .map(|a| a.id)
                    .collect();
                let conversions = sample.iter().filter(|id| converted.contains(id)).count();

                ExperimentResult {
                    variant_name: Some(variant.name.clone()),
                    is_control: variant.id == experiment.control_variant.id,
                    period_start,
                    period_end,
                    ..ExperimentResult::new(
                        experiment.id.clone(),
                        variant.id.clone(),
                        sample.len() as u64,
                        conversions as u64,
                    )
                }
            })
            .collect()
    }
}
