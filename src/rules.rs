//! Typed rule operands and comparison operators shared by targeting and segment evaluation.
//!
//! Rules are deserialized into these types when definitions are loaded, so an unknown operator
//! or a malformed operand is rejected up front rather than during evaluation.
use derive_more::From;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Scalar operand of a rule.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum Value {
    /// A boolean operand.
    Boolean(bool),
    /// A numeric operand.
    Number(f64),
    /// A string operand.
    String(String),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl Value {
    /// Loose equality against a metadata value. Values of different JSON types are never equal.
    pub(crate) fn matches_json(&self, json: &JsonValue) -> bool {
        match (self, json) {
            (Value::Boolean(expected), JsonValue::Bool(actual)) => expected == actual,
            (Value::Number(expected), JsonValue::Number(actual)) => {
                actual.as_f64() == Some(*expected)
            }
            (Value::String(expected), JsonValue::String(actual)) => expected == actual,
            _ => false,
        }
    }
}

/// Right-hand side of a rule: either a single operand or a list (for `in`/`not_in`).
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(untagged)]
pub enum ConditionValue {
    /// A list of operands.
    Multiple(Vec<Value>),
    /// A single operand.
    Single(Value),
}

impl<T: Into<Value>> From<T> for ConditionValue {
    fn from(value: T) -> Self {
        Self::Single(value.into())
    }
}
impl<T: Into<Value>> From<Vec<T>> for ConditionValue {
    fn from(value: Vec<T>) -> Self {
        Self::Multiple(value.into_iter().map(Into::into).collect())
    }
}

/// Comparison operators.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Attribute equals the operand.
    Equals,
    /// Attribute is present and differs from the operand.
    NotEquals,
    /// Attribute is one of the listed operands.
    In,
    /// Attribute is none of the listed operands.
    NotIn,
    /// Attribute string contains the operand, or attribute list contains the operand.
    Contains,
    /// Attribute string matches the operand regex.
    Matches,
    /// Attribute is greater than the operand.
    Gt,
    /// Attribute is less than the operand.
    Lt,
    /// Attribute is greater than or equal to the operand.
    Gte,
    /// Attribute is less than or equal to the operand.
    Lte,
}

impl Operator {
    /// Name used in log records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Contains => "contains",
            Self::Matches => "matches",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Gte => "gte",
            Self::Lte => "lte",
        }
    }

    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    pub fn eval(&self, attribute: &JsonValue, condition_value: &ConditionValue) -> bool {
        self.try_eval(attribute, condition_value).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    pub(crate) fn try_eval(
        &self,
        attribute: &JsonValue,
        condition_value: &ConditionValue,
    ) -> Option<bool> {
        match self {
            Self::Equals | Self::NotEquals => {
                let ConditionValue::Single(expected) = condition_value else {
                    return None;
                };
                let equals = expected.matches_json(attribute);
                Some(equals == (*self == Self::Equals))
            }

            Self::In | Self::NotIn => {
                let ConditionValue::Multiple(values) = condition_value else {
                    return None;
                };
                let is_one_of = values.iter().any(|v| v.matches_json(attribute));
                Some(is_one_of == (*self == Self::In))
            }

            Self::Contains => match (attribute, condition_value) {
                (JsonValue::String(s), ConditionValue::Single(Value::String(needle))) => {
                    Some(s.contains(needle.as_str()))
                }
                (JsonValue::Array(items), ConditionValue::Single(needle)) => {
                    Some(items.iter().any(|item| needle.matches_json(item)))
                }
                _ => None,
            },

            Self::Matches => {
                let s = attribute.as_str()?;
                let regex = match condition_value {
                    ConditionValue::Single(Value::String(s)) => Regex::new(s).ok()?,
                    _ => return None,
                };
                Some(regex.is_match(s))
            }

            Self::Gte | Self::Gt | Self::Lte | Self::Lt => {
                let ConditionValue::Single(expected) = condition_value else {
                    return None;
                };

                let condition_version = match expected {
                    Value::String(s) => Version::parse(s).ok(),
                    _ => None,
                };

                if let Some(condition_version) = condition_version {
                    // semver comparison
                    let attribute_version = Version::parse(attribute.as_str()?).ok()?;
                    self.compare(attribute_version.cmp(&condition_version))
                } else {
                    // numeric comparison
                    let condition_value = match expected {
                        Value::Number(n) => *n,
                        Value::String(s) => s.parse().ok()?,
                        Value::Boolean(_) => return None,
                    };
                    let attribute_value = match attribute {
                        JsonValue::Number(n) => n.as_f64()?,
                        JsonValue::String(s) => s.parse().ok()?,
                        _ => return None,
                    };
                    self.compare(attribute_value.partial_cmp(&condition_value)?)
                }
            }
        }
    }

    fn compare(&self, ordering: std::cmp::Ordering) -> Option<bool> {
        Some(match self {
            Self::Gt => ordering.is_gt(),
            Self::Gte => ordering.is_ge(),
            Self::Lt => ordering.is_lt(),
            Self::Lte => ordering.is_le(),
            _ => return None,
        })
    }
}
