//! Reusable user segments and their rule evaluation.
use serde::{Deserialize, Serialize};

use crate::{
    rules::{ConditionValue, Operator},
    ExperimentContext,
};

/// A named rule tree used to classify users independent of any single experiment.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct UserSegment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub segment_conditions: SegmentConditions,
    #[serde(default = "default_is_active")]
    pub is_active: bool,
}

fn default_is_active() -> bool {
    true
}

/// Segment rule tree, tagged by rule family.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentConditions {
    /// Rules on dotted paths into context metadata.
    Static {
        #[allow(missing_docs)]
        #[serde(default)]
        rules: Vec<SegmentRule>,
    },
    /// Same shape and semantics as [`SegmentConditions::Static`].
    Demographic {
        #[allow(missing_docs)]
        #[serde(default)]
        rules: Vec<SegmentRule>,
    },
    /// Rules on `metadata.behavior` metrics.
    Behavioral {
        #[allow(missing_docs)]
        #[serde(default)]
        rules: Vec<BehavioralRule>,
    },
    /// Extension point. Currently evaluated like [`SegmentConditions::Static`].
    Custom {
        #[allow(missing_docs)]
        #[serde(default)]
        rules: Vec<SegmentRule>,
    },
}

/// `{field, operator, value}` rule on a dotted metadata path.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct SegmentRule {
    pub field: String,
    pub operator: Operator,
    pub value: ConditionValue,
}

/// Operators allowed on behavior metrics.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum BehavioralOperator {
    Equals,
    NotEquals,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl From<BehavioralOperator> for Operator {
    fn from(value: BehavioralOperator) -> Operator {
        match value {
            BehavioralOperator::Equals => Operator::Equals,
            BehavioralOperator::NotEquals => Operator::NotEquals,
            BehavioralOperator::Gt => Operator::Gt,
            BehavioralOperator::Lt => Operator::Lt,
            BehavioralOperator::Gte => Operator::Gte,
            BehavioralOperator::Lte => Operator::Lte,
        }
    }
}

/// Rule on `metadata.behavior[metric]`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BehavioralRule {
    #[allow(missing_docs)]
    pub metric: String,
    #[allow(missing_docs)]
    pub operator: BehavioralOperator,
    #[allow(missing_docs)]
    pub value: ConditionValue,
    /// Informational only. The caller pre-filters `metadata.behavior` to the right window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<String>,
}

impl SegmentRule {
    /// A rule whose field is absent is skipped (treated as satisfied).
    fn eval(&self, context: &ExperimentContext) -> bool {
        match context.lookup(&self.field) {
            Some(attribute) => self.operator.eval(attribute, &self.value),
            None => true,
        }
    }
}

impl BehavioralRule {
    fn eval(&self, context: &ExperimentContext) -> bool {
        let metric = context
            .behavior()
            .and_then(|behavior| behavior.get(&self.metric))
            .filter(|value| !value.is_null());
        match metric {
            Some(metric) => Operator::from(self.operator).eval(metric, &self.value),
            None => true,
        }
    }
}

/// Evaluates segment membership.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentEvaluator;

impl SegmentEvaluator {
    #[allow(missing_docs)]
    pub fn new() -> SegmentEvaluator {
        SegmentEvaluator
    }

    /// Return `true` if `context` satisfies every rule of `conditions`. Evaluation stops at the
    /// first failing rule.
    pub fn matches(&self, conditions: &SegmentConditions, context: &ExperimentContext) -> bool {
        match conditions {
            SegmentConditions::Static { rules }
            | SegmentConditions::Demographic { rules }
            | SegmentConditions::Custom { rules } => self.matches_static(rules, context),
            SegmentConditions::Behavioral { rules } => {
                rules.iter().all(|rule| rule.eval(context))
            }
        }
    }

    /// Like [`SegmentEvaluator::matches`], but inactive segments never match.
    pub fn matches_segment(&self, segment: &UserSegment, context: &ExperimentContext) -> bool {
        let matches = segment.is_active && self.matches(&segment.segment_conditions, context);
        log::trace!(target: "experiments",
                    segment_id:display = segment.id,
                    session_id:display = context.session_id,
                    matches;
                    "evaluated segment");
        matches
    }

    /// Ids of the segments in `segments` that `context` belongs to.
    pub fn matching_segments<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a UserSegment>,
        context: &ExperimentContext,
    ) -> Vec<&'a str> {
        segments
            .into_iter()
            .filter(|segment| self.matches_segment(segment, context))
            .map(|segment| segment.id.as_str())
            .collect()
    }

    fn matches_static(&self, rules: &[SegmentRule], context: &ExperimentContext) -> bool {
        rules.iter().all(|rule| rule.eval(context))
    }
}
