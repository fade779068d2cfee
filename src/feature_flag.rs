use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{segments::SegmentEvaluator, ExperimentContext, UserSegment};

/// A feature flag as served by the experiment backend.
///
/// Flags are consumed read-only. A flag restricted to segments is on for a context that belongs
/// to at least one of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct FeatureFlag {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub is_enabled: bool,
    /// Ids of [`UserSegment`]s the flag is restricted to. Empty means everyone.
    #[serde(default)]
    pub target_segments: Vec<String>,
    #[serde(default)]
    pub configuration: Map<String, Value>,
}

impl FeatureFlag {
    /// Whether the flag is on for `context`.
    ///
    /// Segment ids that are not present in `segments` never match.
    pub fn is_enabled_for<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a UserSegment>,
        evaluator: &SegmentEvaluator,
        context: &ExperimentContext,
    ) -> bool {
        if !self.is_enabled {
            return false;
        }
        if self.target_segments.is_empty() {
            return true;
        }

        segments
            .into_iter()
            .filter(|segment| self.target_segments.contains(&segment.id))
            .any(|segment| evaluator.matches_segment(segment, context))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::FeatureFlag;
    use crate::{segments::SegmentEvaluator, ExperimentContext, UserSegment};

    fn flag(value: serde_json::Value) -> FeatureFlag {
        serde_json::from_value(value).unwrap()
    }

    fn pro_segment() -> UserSegment {
        serde_json::from_value(json!({
            "id": "pro",
            "name": "Pro users",
            "segment_conditions": {
                "type": "demographic",
                "rules": [{"field": "user_attributes.plan", "operator": "equals", "value": "pro"}]
            }
        }))
        .unwrap()
    }

    #[test]
    fn disabled_flag_is_off() {
        let flag = flag(json!({"id": "f", "name": "new-editor", "is_enabled": false}));
        let context = ExperimentContext::new("s");
        assert!(!flag.is_enabled_for([], &SegmentEvaluator::new(), &context));
    }

    #[test]
    fn untargeted_flag_is_on_for_everyone() {
        let flag = flag(json!({"id": "f", "name": "new-editor", "is_enabled": true}));
        let context = ExperimentContext::new("s");
        assert!(flag.is_enabled_for([], &SegmentEvaluator::new(), &context));
    }

    #[test]
    fn targeted_flag_requires_segment_membership() {
        let flag = flag(json!({
            "id": "f",
            "name": "new-editor",
            "is_enabled": true,
            "target_segments": ["pro", "missing"]
        }));
        let segments = [pro_segment()];
        let evaluator = SegmentEvaluator::new();

        let pro = ExperimentContext::new("s1")
            .with_metadata_entry("user_attributes", json!({"plan": "pro"}));
        let free = ExperimentContext::new("s2")
            .with_metadata_entry("user_attributes", json!({"plan": "free"}));

        assert!(flag.is_enabled_for(&segments, &evaluator, &pro));
        assert!(!flag.is_enabled_for(&segments, &evaluator, &free));
    }
}
