use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Timestamp;

/// Free-form context metadata. Targeting and segmentation read the `location`,
/// `user_attributes`, and `behavior` sub-maps.
pub type Metadata = Map<String, Value>;

/// Identity and metadata of the caller being assigned.
///
/// # Examples
/// ```
/// # use prompt_experiments::ExperimentContext;
/// let context = ExperimentContext::new("session-1")
///     .with_user_id("user_42")
///     .with_metadata_entry("location", serde_json::json!({"country": "US", "region": "CA"}));
/// assert_eq!(context.location().unwrap().country, Some("US"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentContext {
    /// Authenticated user, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Caller-generated session id.
    pub session_id: String,
    /// Device identifier, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub metadata: Option<Metadata>,
    /// When the context was captured.
    #[serde(default = "Utc::now")]
    pub timestamp: Timestamp,
}

/// Borrowed view of `metadata.location`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location<'a> {
    #[allow(missing_docs)]
    pub country: Option<&'a str>,
    #[allow(missing_docs)]
    pub region: Option<&'a str>,
    #[allow(missing_docs)]
    pub city: Option<&'a str>,
}

impl Location<'_> {
    /// Geographic bucketing key: `"{country}_{region}"`, with missing parts left empty.
    pub fn bucket_key(&self) -> String {
        format!(
            "{}_{}",
            self.country.unwrap_or_default(),
            self.region.unwrap_or_default()
        )
    }
}

impl ExperimentContext {
    /// Create a context for `session_id` with no other identity fields.
    pub fn new(session_id: impl Into<String>) -> ExperimentContext {
        ExperimentContext {
            user_id: None,
            session_id: session_id.into(),
            device_id: None,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    #[allow(missing_docs)]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> ExperimentContext {
        self.user_id = Some(user_id.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> ExperimentContext {
        self.device_id = Some(device_id.into());
        self
    }

    /// Replace metadata completely.
    pub fn with_metadata(mut self, metadata: Metadata) -> ExperimentContext {
        self.metadata = Some(metadata);
        self
    }

    /// Insert a single top-level metadata entry.
    pub fn with_metadata_entry(
        mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> ExperimentContext {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Non-empty `metadata.location`, if present.
    pub fn location(&self) -> Option<Location<'_>> {
        let location = self.sub_map("location")?;
        let field = |name: &str| location.get(name).and_then(Value::as_str);
        Some(Location {
            country: field("country"),
            region: field("region"),
            city: field("city"),
        })
    }

    /// Non-empty `metadata.user_attributes`, if present.
    pub fn user_attributes(&self) -> Option<&Map<String, Value>> {
        self.sub_map("user_attributes")
    }

    /// Non-empty `metadata.behavior`, if present.
    pub fn behavior(&self) -> Option<&Map<String, Value>> {
        self.sub_map("behavior")
    }

    /// Resolve a dotted path (e.g., `"user_attributes.plan"`) into metadata. `null` values are
    /// treated as absent.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.metadata.as_ref()?.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        (!current.is_null()).then_some(current)
    }

    fn sub_map(&self, key: &str) -> Option<&Map<String, Value>> {
        self.metadata
            .as_ref()?
            .get(key)?
            .as_object()
            .filter(|map| !map.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::ExperimentContext;

    #[test]
    fn lookup_dotted_path() {
        let context = ExperimentContext::new("s1")
            .with_metadata_entry("user_attributes", json!({"plan": "pro", "meta": {"age": 30}}));
        assert_eq!(context.lookup("user_attributes.plan"), Some(&json!("pro")));
        assert_eq!(context.lookup("user_attributes.meta.age"), Some(&json!(30)));
        assert_eq!(context.lookup("user_attributes.missing"), None);
        assert_eq!(context.lookup("user_attributes.plan.deeper"), None);
        assert_eq!(context.lookup("nothing"), None);
    }

    #[test]
    fn null_lookup_is_absent() {
        let context = ExperimentContext::new("s1").with_metadata_entry("tier", json!(null));
        assert_eq!(context.lookup("tier"), None);
    }

    #[test]
    fn empty_sub_maps_are_absent() {
        let context = ExperimentContext::new("s1")
            .with_metadata_entry("location", json!({}))
            .with_metadata_entry("user_attributes", json!("not a map"));
        assert!(context.location().is_none());
        assert!(context.user_attributes().is_none());
        assert!(context.behavior().is_none());
    }

    #[test]
    fn location_bucket_key() {
        let context = ExperimentContext::new("s1")
            .with_metadata_entry("location", json!({"country": "US", "city": "Austin"}));
        let location = context.location().unwrap();
        assert_eq!(location.bucket_key(), "US_");
        assert_eq!(location.city, Some("Austin"));
    }

    #[test]
    fn deserialize_minimal_context() {
        let context: ExperimentContext =
            serde_json::from_value(json!({"session_id": "abc"})).unwrap();
        assert_eq!(context.session_id, "abc");
        assert!(context.user_id.is_none());
    }
}
