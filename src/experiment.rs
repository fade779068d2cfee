//! Experiment definitions and assignment records.
//!
//! Definitions are served by the experiment backend and treated as immutable snapshots. They are
//! validated once when loaded (see [`Experiment::validate`]).
use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{targeting::AttributeRule, Error, ExperimentContext, Result, Timestamp};

/// Experiment lifecycle status.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl ExperimentStatus {
    #[allow(missing_docs)]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// How admitted traffic is split between variants.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Equal split over `[control, ...treatments]`.
    Uniform,
    /// Split proportional to variant weights.
    Weighted,
    /// Weighted, but a user keeps their first variant across sessions.
    Sticky,
    /// Bucketed by `"{country}_{region}"`.
    Geographic,
    /// Bucketed by the user attribute map.
    UserAttribute,
}

/// Numeric bounds on `user_<N>`-style ids, plus an optional explicit allow-list.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub struct TargetAudience {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_user_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_user_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
}

/// Geographic allow-lists. An absent list allows everything.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub struct GeographicTargeting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countries: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cities: Option<Vec<String>>,
}

/// One arm of an experiment.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExperimentVariant {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub name: String,
    /// Relative weight. Only meaningful for weighted and sticky allocation.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Opaque configuration merged into the rendered prompt request.
    #[serde(default)]
    pub prompt_config: Map<String, Value>,
    #[serde(default)]
    #[allow(missing_docs)]
    pub is_control: bool,
}

fn default_weight() -> u32 {
    1
}

/// Experiment snapshot as served by the backend.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct Experiment {
    pub id: String,
    pub project_id: String,
    pub prompt_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: ExperimentStatus,
    /// Share of eligible contexts admitted into the experiment, in percent.
    pub traffic_percentage: f64,
    pub allocation_strategy: AllocationStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_audience: Option<TargetAudience>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geographic_targeting: Option<GeographicTargeting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_attributes: Option<BTreeMap<String, AttributeRule>>,
    pub control_variant: ExperimentVariant,
    pub treatment_variants: Vec<ExperimentVariant>,
    #[serde(default)]
    pub min_sample_size: u64,
    /// Confidence level in percent (e.g., `95.0`).
    #[serde(default = "default_statistical_significance")]
    pub statistical_significance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_metric: Option<String>,
}

fn default_statistical_significance() -> f64 {
    95.0
}

impl Experiment {
    /// Check structural invariants of the definition.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::Configuration(format!("{}: {}", self.id, msg)));

        if self.treatment_variants.is_empty() {
            return invalid("experiment has no treatment variants".into());
        }
        if !(0.0..=100.0).contains(&self.traffic_percentage) {
            return invalid(format!(
                "traffic_percentage {} is outside [0, 100]",
                self.traffic_percentage
            ));
        }
        if !(self.statistical_significance > 0.0 && self.statistical_significance < 100.0) {
            return invalid(format!(
                "statistical_significance {} is outside (0, 100)",
                self.statistical_significance
            ));
        }

        let mut seen = HashSet::new();
        for variant in self.variants() {
            if !seen.insert(variant.id.as_str()) {
                return invalid(format!("duplicate variant id {:?}", variant.id));
            }
            if variant.weight == 0 {
                return invalid(format!("variant {:?} has zero weight", variant.id));
            }
        }
        if self.treatment_variants.iter().any(|v| v.is_control) {
            return invalid("treatment variant is flagged as control".into());
        }

        Ok(())
    }

    /// Variants in allocation order: control first, then treatments.
    pub fn variants(&self) -> impl Iterator<Item = &ExperimentVariant> {
        std::iter::once(&self.control_variant).chain(self.treatment_variants.iter())
    }

    /// Look up a variant by id.
    pub fn variant(&self, variant_id: &str) -> Option<&ExperimentVariant> {
        self.variants().find(|v| v.id == variant_id)
    }

    #[allow(missing_docs)]
    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }

    /// `statistical_significance` as a fraction (e.g., `0.95`).
    pub fn confidence_level(&self) -> f64 {
        self.statistical_significance / 100.0
    }
}

/// Why an assignment resolved to its variant.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum AssignmentReason {
    TargetingCriteriaNotMet,
    ControlFallback,
    UniformAllocation,
    WeightedAllocation,
    WeightedFallback,
    StickyCached,
    StickyNew,
    GeographicAllocation,
    UserAttributeAllocation,
    NoLocationData,
    NoUserAttributes,
    ErrorFallback,
}

impl AssignmentReason {
    #[allow(missing_docs)]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TargetingCriteriaNotMet => "targeting_criteria_not_met",
            Self::ControlFallback => "control_fallback",
            Self::UniformAllocation => "uniform_allocation",
            Self::WeightedAllocation => "weighted_allocation",
            Self::WeightedFallback => "weighted_fallback",
            Self::StickyCached => "sticky_cached",
            Self::StickyNew => "sticky_new",
            Self::GeographicAllocation => "geographic_allocation",
            Self::UserAttributeAllocation => "user_attribute_allocation",
            Self::NoLocationData => "no_location_data",
            Self::NoUserAttributes => "no_user_attributes",
            Self::ErrorFallback => "error_fallback",
        }
    }
}

/// Result of assigning a context to an experiment variant.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct ExperimentAssignment {
    /// Fresh for every computed assignment. Events reference it.
    pub id: Uuid,
    pub experiment_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub variant_id: String,
    pub variant_name: String,
    /// Copy of the variant's `prompt_config`.
    pub variant_config: Map<String, Value>,
    pub assigned_at: Timestamp,
    pub assignment_reason: AssignmentReason,
    /// Always `true` once computed; the assignment is safe to reuse from cache.
    pub is_consistent: bool,
}

impl ExperimentAssignment {
    pub(crate) fn new(
        experiment: &Experiment,
        context: &ExperimentContext,
        variant: &ExperimentVariant,
        reason: AssignmentReason,
    ) -> ExperimentAssignment {
        ExperimentAssignment {
            id: Uuid::new_v4(),
            experiment_id: experiment.id.clone(),
            session_id: context.session_id.clone(),
            user_id: context.user_id.clone(),
            device_id: context.device_id.clone(),
            variant_id: variant.id.clone(),
            variant_name: variant.name.clone(),
            variant_config: variant.prompt_config.clone(),
            assigned_at: Utc::now(),
            assignment_reason: reason,
            is_consistent: true,
        }
    }

    /// Whether the assignment landed on the experiment's control variant.
    pub fn is_control(&self, experiment: &Experiment) -> bool {
        self.variant_id == experiment.control_variant.id
    }
}
