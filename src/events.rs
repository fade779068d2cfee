//! Experiment events and their recording.
//!
//! Events are append-only: once an [`ExperimentEvent`] is handed to an [`EventStore`] it is never
//! mutated. They are the input of [`ExperimentResult::from_events`].
//!
//! [`ExperimentResult::from_events`]: crate::ExperimentResult::from_events
mod event_store;
mod event_tracker;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{context::Metadata, ExperimentAssignment, Timestamp};

pub use event_store::{EventStore, InMemoryEventStore};
pub use event_tracker::EventTracker;

/// Kind of an [`ExperimentEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EventType {
    Assignment,
    PromptRequest,
    PromptRender,
    ModelResponse,
    Conversion,
    Error,
    Custom,
}

impl EventType {
    #[allow(missing_docs)]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assignment => "assignment",
            Self::PromptRequest => "prompt_request",
            Self::PromptRender => "prompt_render",
            Self::ModelResponse => "model_response",
            Self::Conversion => "conversion",
            Self::Error => "error",
            Self::Custom => "custom",
        }
    }
}

/// A measurement or outcome associated with an experiment assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct ExperimentEvent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub experiment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<Uuid>,
    pub event_type: EventType,
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_indicator: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Set by [`EventTracker::track`] when left empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<Timestamp>,
}

impl ExperimentEvent {
    /// Create an event with no measurements attached.
    pub fn new(
        experiment_id: impl Into<String>,
        event_type: EventType,
        event_name: impl Into<String>,
    ) -> ExperimentEvent {
        ExperimentEvent {
            id: Uuid::new_v4(),
            experiment_id: experiment_id.into(),
            assignment_id: None,
            event_type,
            event_name: event_name.into(),
            response_time_ms: None,
            tokens_used: None,
            cost_usd: None,
            conversion_value: None,
            success_indicator: None,
            error_message: None,
            metadata: None,
            occurred_at: None,
        }
    }

    /// Conversion event for `assignment_id`, marked successful.
    pub fn conversion(
        experiment_id: impl Into<String>,
        assignment_id: Uuid,
        value: Option<f64>,
    ) -> ExperimentEvent {
        ExperimentEvent {
            assignment_id: Some(assignment_id),
            conversion_value: value,
            success_indicator: Some(true),
            ..ExperimentEvent::new(experiment_id, EventType::Conversion, "conversion")
        }
    }

    /// Record of `assignment` having been served.
    pub fn assignment(assignment: &ExperimentAssignment) -> ExperimentEvent {
        ExperimentEvent {
            assignment_id: Some(assignment.id),
            occurred_at: Some(assignment.assigned_at),
            ..ExperimentEvent::new(
                assignment.experiment_id.clone(),
                EventType::Assignment,
                assignment.assignment_reason.as_str(),
            )
        }
    }

    #[allow(missing_docs)]
    pub fn with_assignment_id(mut self, assignment_id: Uuid) -> ExperimentEvent {
        self.assignment_id = Some(assignment_id);
        self
    }

    /// Attach model response measurements.
    pub fn with_response(
        mut self,
        response_time_ms: f64,
        tokens_used: u64,
        cost_usd: f64,
    ) -> ExperimentEvent {
        self.response_time_ms = Some(response_time_ms);
        self.tokens_used = Some(tokens_used);
        self.cost_usd = Some(cost_usd);
        self
    }

    /// Mark the event as failed with `message`.
    pub fn with_error(mut self, message: impl Into<String>) -> ExperimentEvent {
        self.success_indicator = Some(false);
        self.error_message = Some(message.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_metadata(mut self, metadata: Metadata) -> ExperimentEvent {
        self.metadata = Some(metadata);
        self
    }

    pub(crate) fn stamp(&mut self) {
        self.occurred_at.get_or_insert_with(Utc::now);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::{EventType, ExperimentEvent};

    #[test]
    fn conversion_event() {
        let assignment_id = Uuid::new_v4();
        let event = ExperimentEvent::conversion("exp", assignment_id, Some(9.5));
        assert_eq!(event.event_type, EventType::Conversion);
        assert_eq!(event.assignment_id, Some(assignment_id));
        assert_eq!(event.success_indicator, Some(true));
        assert_eq!(event.conversion_value, Some(9.5));
        assert!(event.occurred_at.is_none());
    }

    #[test]
    fn serializes_without_empty_measurements() {
        let event = ExperimentEvent::new("exp", EventType::ModelResponse, "completion")
            .with_response(120.0, 512, 0.002);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], json!("model_response"));
        assert_eq!(value["tokens_used"], json!(512));
        assert!(value.get("error_message").is_none());
        assert!(value.get("occurred_at").is_none());
    }

    #[test]
    fn deserializes_backend_echo() {
        let event: ExperimentEvent = serde_json::from_value(json!({
            "id": "6f1c1d5e-5a8e-4b7e-9f53-0a5b6d1f2c3e",
            "experiment_id": "exp",
            "event_type": "error",
            "event_name": "timeout",
            "success_indicator": false,
            "error_message": "upstream timed out",
            "occurred_at": "2024-05-01T12:00:00Z"
        }))
        .unwrap();
        assert_eq!(event.event_type, EventType::Error);
        assert!(event.occurred_at.is_some());
    }

    #[test]
    fn stamp_keeps_existing_timestamp() {
        let mut event = ExperimentEvent::new("exp", EventType::Custom, "x");
        event.stamp();
        let first = event.occurred_at;
        event.stamp();
        assert_eq!(event.occurred_at, first);
    }
}
