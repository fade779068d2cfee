use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{events::ExperimentEvent, Result};

/// Destination of tracked events.
///
/// Implemented by [`BackendClient`](crate::BackendClient) (`POST /events`) and by
/// [`InMemoryEventStore`].
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist `event` and return the stored copy.
    async fn store_event(&self, event: ExperimentEvent) -> Result<ExperimentEvent>;
}

/// Append-only in-process event log.
///
/// Useful for recomputing results locally and in tests. Cloning shares the underlying log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    events: Arc<Mutex<Vec<ExperimentEvent>>>,
}

impl InMemoryEventStore {
    #[allow(missing_docs)]
    pub fn new() -> InMemoryEventStore {
        InMemoryEventStore::default()
    }

    /// Snapshot of all stored events in insertion order.
    pub fn events(&self) -> Vec<ExperimentEvent> {
        self.lock().clone()
    }

    /// Snapshot of the events of `experiment_id`.
    pub fn events_for(&self, experiment_id: &str) -> Vec<ExperimentEvent> {
        self.lock()
            .iter()
            .filter(|event| event.experiment_id == experiment_id)
            .cloned()
            .collect()
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ExperimentEvent>> {
        self.events
            .lock()
            .expect("thread holding event log lock should not panic")
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(&self, event: ExperimentEvent) -> Result<ExperimentEvent> {
        self.lock().push(event.clone());
        Ok(event)
    }
}
