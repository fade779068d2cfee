use std::sync::Arc;

use uuid::Uuid;

use crate::{
    context::Metadata,
    events::{EventStore, ExperimentEvent},
    ExperimentAssignment, Result,
};

/// Records experiment events into an [`EventStore`].
#[derive(Clone)]
pub struct EventTracker {
    store: Arc<dyn EventStore>,
}

impl EventTracker {
    #[allow(missing_docs)]
    pub fn new(store: Arc<dyn EventStore>) -> EventTracker {
        EventTracker { store }
    }

    /// Record `event`, setting `occurred_at` to now if unset, and return the stored event.
    ///
    /// Store errors are returned to the caller unmodified.
    pub async fn track(&self, mut event: ExperimentEvent) -> Result<ExperimentEvent> {
        event.stamp();

        let stored = self.store.store_event(event).await.inspect_err(|err| {
            log::warn!(target: "experiments", "failed to store experiment event: {:?}", err);
        })?;

        log::debug!(target: "experiments",
                    experiment_id:display = stored.experiment_id,
                    assignment_id:serde = stored.assignment_id,
                    event_type = stored.event_type.as_str(),
                    event_name:display = stored.event_name;
                    "tracked experiment event");

        Ok(stored)
    }

    /// Record a successful conversion for `assignment_id`.
    pub async fn track_conversion(
        &self,
        experiment_id: &str,
        assignment_id: Uuid,
        value: Option<f64>,
        metadata: Option<Metadata>,
    ) -> Result<ExperimentEvent> {
        let event = ExperimentEvent {
            metadata,
            ..ExperimentEvent::conversion(experiment_id, assignment_id, value)
        };
        self.track(event).await
    }

    /// Record that `assignment` was served.
    pub async fn track_assignment(
        &self,
        assignment: &ExperimentAssignment,
    ) -> Result<ExperimentEvent> {
        self.track(ExperimentEvent::assignment(assignment)).await
    }
}
