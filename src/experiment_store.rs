//! A thread-safe in-memory storage for experiment definitions. [`ExperimentStore`] provides
//! concurrent access for readers (assignment) and writers (whoever fetches definitions from the
//! backend).
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use crate::{Experiment, FeatureFlag, UserSegment};

/// Immutable set of definitions fetched together. Replaced as a whole, never mutated.
#[derive(Debug)]
pub struct Snapshot<T> {
    fetched_at: Instant,
    items: Vec<T>,
}

impl<T> Snapshot<T> {
    fn new(items: Vec<T>) -> Snapshot<T> {
        Snapshot {
            fetched_at: Instant::now(),
            items,
        }
    }

    #[allow(missing_docs)]
    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Whether the snapshot was fetched less than `ttl` ago.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PromptKey {
    prompt_id: String,
    project_id: Option<String>,
}

/// `ExperimentStore` provides a thread-safe (`Sync`) storage for experiment, segment and feature
/// flag definitions.
///
/// Experiments are stored per prompt (and optional project), the granularity the backend serves
/// them at. Snapshots older than the store's TTL are reported as missing.
#[derive(Debug)]
pub struct ExperimentStore {
    ttl: Duration,
    experiments: RwLock<HashMap<PromptKey, Arc<Snapshot<Experiment>>>>,
    segments: RwLock<Option<Arc<Snapshot<UserSegment>>>>,
    feature_flags: RwLock<Option<Arc<Snapshot<FeatureFlag>>>>,
}

impl ExperimentStore {
    /// Create a new empty store whose snapshots expire after `ttl`.
    pub fn new(ttl: Duration) -> ExperimentStore {
        ExperimentStore {
            ttl,
            experiments: RwLock::new(HashMap::new()),
            segments: RwLock::new(None),
            feature_flags: RwLock::new(None),
        }
    }

    /// Get the live experiments of a prompt. Returns `None` if they haven't been stored yet or
    /// have expired.
    pub fn experiments_for(
        &self,
        prompt_id: &str,
        project_id: Option<&str>,
    ) -> Option<Arc<Snapshot<Experiment>>> {
        let key = PromptKey {
            prompt_id: prompt_id.to_owned(),
            project_id: project_id.map(str::to_owned),
        };
        // read() should always return Ok(). Err() is possible only if the lock is poisoned
        // (writer panicked while holding the lock), which should never happen.
        let experiments = self
            .experiments
            .read()
            .expect("thread holding experiments lock should not panic");

        experiments
            .get(&key)
            .filter(|snapshot| snapshot.is_fresh(self.ttl))
            .cloned()
    }

    /// Replace the experiments of a prompt.
    ///
    /// Experiments failing [`Experiment::validate`] are dropped with a warning; the rest are
    /// stored. Returns the stored snapshot.
    pub fn set_experiments(
        &self,
        prompt_id: &str,
        project_id: Option<&str>,
        experiments: Vec<Experiment>,
    ) -> Arc<Snapshot<Experiment>> {
        let valid = experiments
            .into_iter()
            .filter(|experiment| match experiment.validate() {
                Ok(()) => true,
                Err(err) => {
                    log::warn!(target: "experiments",
                               experiment_id:display = experiment.id;
                               "ignoring invalid experiment: {err}");
                    false
                }
            })
            .collect();
        let snapshot = Arc::new(Snapshot::new(valid));

        let mut experiments = self
            .experiments
            .write()
            .expect("thread holding experiments lock should not panic");
        experiments.insert(
            PromptKey {
                prompt_id: prompt_id.to_owned(),
                project_id: project_id.map(str::to_owned),
            },
            snapshot.clone(),
        );

        snapshot
    }

    /// Find a stored, non-expired experiment by id.
    pub fn experiment(&self, experiment_id: &str) -> Option<Experiment> {
        let experiments = self
            .experiments
            .read()
            .expect("thread holding experiments lock should not panic");

        experiments
            .values()
            .filter(|snapshot| snapshot.is_fresh(self.ttl))
            .flat_map(|snapshot| snapshot.items())
            .find(|experiment| experiment.id == experiment_id)
            .cloned()
    }

    /// Drop every stored experiment snapshot.
    pub fn clear_experiments(&self) {
        self.experiments
            .write()
            .expect("thread holding experiments lock should not panic")
            .clear();
    }

    /// Get the stored user segments. Returns `None` if not stored yet or expired.
    pub fn segments(&self) -> Option<Arc<Snapshot<UserSegment>>> {
        Self::get_fresh(&self.segments, self.ttl)
    }

    /// Replace the stored user segments.
    pub fn set_segments(&self, segments: Vec<UserSegment>) -> Arc<Snapshot<UserSegment>> {
        Self::set(&self.segments, segments)
    }

    /// Get the stored feature flags. Returns `None` if not stored yet or expired.
    pub fn feature_flags(&self) -> Option<Arc<Snapshot<FeatureFlag>>> {
        Self::get_fresh(&self.feature_flags, self.ttl)
    }

    /// Replace the stored feature flags.
    pub fn set_feature_flags(&self, flags: Vec<FeatureFlag>) -> Arc<Snapshot<FeatureFlag>> {
        Self::set(&self.feature_flags, flags)
    }

    fn get_fresh<T>(
        slot: &RwLock<Option<Arc<Snapshot<T>>>>,
        ttl: Duration,
    ) -> Option<Arc<Snapshot<T>>> {
        let slot = slot
            .read()
            .expect("thread holding definitions lock should not panic");
        slot.as_ref()
            .filter(|snapshot| snapshot.is_fresh(ttl))
            .cloned()
    }

    fn set<T>(slot: &RwLock<Option<Arc<Snapshot<T>>>>, items: Vec<T>) -> Arc<Snapshot<T>> {
        let snapshot = Arc::new(Snapshot::new(items));
        let mut slot = slot
            .write()
            .expect("thread holding definitions lock should not panic");
        *slot = Some(snapshot.clone());
        snapshot
    }
}
