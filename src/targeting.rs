//! Experiment-level targeting gates: audience bounds, geographic allow-lists, and user-attribute
//! rules.
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{
    error::TargetingError,
    experiment::{GeographicTargeting, TargetAudience},
    rules::{ConditionValue, Operator, Value},
    Experiment, ExperimentContext,
};

/// What to do when targeting evaluation itself fails (e.g., a `user_<N>` bound on a user id with
/// no numeric suffix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetingErrorPolicy {
    /// Treat the context as matching.
    #[default]
    FailOpen,
    /// Treat the context as not matching.
    FailClosed,
}

/// A rule on one entry of `metadata.user_attributes`.
///
/// Deserializes from either a scalar (direct equality) or an operator map such as
/// `{"$gte": 18, "$lt": 65}`. Unknown operator keys are rejected at load time.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum AttributeRule {
    /// Attribute must equal the value.
    Exact(Value),
    /// Attribute must satisfy every operator present.
    Operators(OperatorRule),
}

/// Operator map of an [`AttributeRule`].
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
#[allow(missing_docs)]
pub struct OperatorRule {
    #[serde(rename = "$gt", default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Value>,
    #[serde(rename = "$lt", default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<Value>,
    #[serde(rename = "$gte", default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<Value>,
    #[serde(rename = "$lte", default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<Value>,
    #[serde(rename = "$in", default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<Value>>,
    #[serde(rename = "$nin", default, skip_serializing_if = "Option::is_none")]
    pub not_one_of: Option<Vec<Value>>,
}

impl OperatorRule {
    fn checks(&self) -> Vec<(Operator, ConditionValue)> {
        let single = |op: Operator, v: &Option<Value>| {
            v.as_ref().map(|v| (op, ConditionValue::Single(v.clone())))
        };
        let multiple = |op: Operator, v: &Option<Vec<Value>>| {
            v.as_ref().map(|v| (op, ConditionValue::Multiple(v.clone())))
        };
        [
            single(Operator::Gt, &self.gt),
            single(Operator::Lt, &self.lt),
            single(Operator::Gte, &self.gte),
            single(Operator::Lte, &self.lte),
            multiple(Operator::In, &self.one_of),
            multiple(Operator::NotIn, &self.not_one_of),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

impl AttributeRule {
    fn try_eval(&self, name: &str, attribute: &JsonValue) -> Result<bool, TargetingError> {
        match self {
            AttributeRule::Exact(expected) => Ok(expected.matches_json(attribute)),
            AttributeRule::Operators(rule) => {
                for (operator, operand) in rule.checks() {
                    let passed = operator.try_eval(attribute, &operand).ok_or_else(|| {
                        TargetingError::IncomparableAttribute {
                            attribute: name.to_owned(),
                            operator: operator.as_str(),
                        }
                    })?;
                    if !passed {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

/// Evaluates experiment targeting against a context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetingEvaluator {
    policy: TargetingErrorPolicy,
}

impl TargetingEvaluator {
    /// Create an evaluator with the default [`TargetingErrorPolicy::FailOpen`] policy.
    pub fn new() -> TargetingEvaluator {
        TargetingEvaluator::default()
    }

    #[allow(missing_docs)]
    pub fn with_policy(policy: TargetingErrorPolicy) -> TargetingEvaluator {
        TargetingEvaluator { policy }
    }

    /// Return `true` if `context` passes every targeting gate configured on `experiment`.
    ///
    /// Never fails: evaluation errors are logged and resolved by the configured
    /// [`TargetingErrorPolicy`].
    pub fn matches(&self, experiment: &Experiment, context: &ExperimentContext) -> bool {
        match self.try_matches(experiment, context) {
            Ok(matches) => matches,
            Err(err) => {
                let matches = self.policy == TargetingErrorPolicy::FailOpen;
                log::warn!(target: "experiments",
                           experiment_id:display = experiment.id,
                           session_id:display = context.session_id,
                           matches;
                           "targeting evaluation failed, applying {:?}: {}", self.policy, err);
                matches
            }
        }
    }

    fn try_matches(
        &self,
        experiment: &Experiment,
        context: &ExperimentContext,
    ) -> Result<bool, TargetingError> {
        if let Some(audience) = &experiment.target_audience {
            if !matches_audience(audience, context)? {
                return Ok(false);
            }
        }

        if let Some(geo) = &experiment.geographic_targeting {
            if !matches_geography(geo, context) {
                return Ok(false);
            }
        }

        if let Some(rules) = &experiment.user_attributes {
            let attributes = context.user_attributes();
            for (name, rule) in rules {
                let Some(attribute) = attributes.and_then(|attrs| attrs.get(name)) else {
                    return Ok(false);
                };
                if !rule.try_eval(name, attribute)? {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }
}

fn matches_audience(
    audience: &TargetAudience,
    context: &ExperimentContext,
) -> Result<bool, TargetingError> {
    if let Some(allowed) = &audience.user_ids {
        match &context.user_id {
            Some(user_id) if allowed.contains(user_id) => {}
            _ => return Ok(false),
        }
    }

    if audience.min_user_id.is_none() && audience.max_user_id.is_none() {
        return Ok(true);
    }
    // Anonymous contexts are not subject to id bounds.
    let Some(user_id) = &context.user_id else {
        return Ok(true);
    };
    let number = numeric_suffix(user_id)?;

    Ok(audience.min_user_id.map_or(true, |min| number >= min)
        && audience.max_user_id.map_or(true, |max| number <= max))
}

/// `"user_123"` → `123`.
fn numeric_suffix(user_id: &str) -> Result<u64, TargetingError> {
    user_id
        .rsplit('_')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .ok_or_else(|| TargetingError::NonNumericUserId(user_id.to_owned()))
}

fn matches_geography(geo: &GeographicTargeting, context: &ExperimentContext) -> bool {
    let location = context.location();
    let allowed = |list: &Option<Vec<String>>, value: Option<&str>| match list {
        None => true,
        Some(list) => value.is_some_and(|v| list.iter().any(|item| item == v)),
    };

    allowed(&geo.countries, location.and_then(|l| l.country))
        && allowed(&geo.regions, location.and_then(|l| l.region))
        && allowed(&geo.cities, location.and_then(|l| l.city))
}
