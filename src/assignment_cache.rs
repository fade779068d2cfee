//! A bounded, TTL-evicting, thread-safe store of computed assignments.
//!
//! [`AssignmentCache`] backs both session consistency (keyed by experiment and session) and
//! sticky allocation (keyed by experiment and user). Expired entries are never returned; they are
//! dropped during the cache's maintenance, which [`sweep`] runs on demand.
//!
//! [`sweep`]: AssignmentCache::sweep
use std::{sync::Arc, time::Duration};

use moka::sync::Cache;

use crate::ExperimentAssignment;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    experiment_id: String,
    identity: String,
}

impl CacheKey {
    fn new(experiment_id: &str, identity: &str) -> CacheKey {
        CacheKey {
            experiment_id: experiment_id.to_owned(),
            identity: identity.to_owned(),
        }
    }
}

/// `(experiment id, identity) → assignment` map.
pub struct AssignmentCache {
    entries: Cache<CacheKey, Arc<ExperimentAssignment>>,
}

impl AssignmentCache {
    /// Create a cache holding at most `capacity` entries, each live for `ttl` after insertion.
    pub fn new(ttl: Duration, capacity: usize) -> AssignmentCache {
        AssignmentCache {
            entries: Cache::builder()
                .max_capacity(capacity as u64)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Get a live assignment.
    pub fn get(&self, experiment_id: &str, identity: &str) -> Option<Arc<ExperimentAssignment>> {
        self.entries.get(&CacheKey::new(experiment_id, identity))
    }

    /// Store `assignment` under `(experiment_id, identity)`, replacing any previous entry.
    pub fn insert(
        &self,
        experiment_id: &str,
        identity: &str,
        assignment: Arc<ExperimentAssignment>,
    ) {
        self.entries
            .insert(CacheKey::new(experiment_id, identity), assignment);
    }

    /// Return the live assignment under `(experiment_id, identity)`, or store the one built by
    /// `init`.
    ///
    /// Concurrent callers for the same key all observe a single stored assignment; `init` runs
    /// at most once among them. The flag is `true` for the caller whose `init` was stored.
    pub fn get_or_insert_with(
        &self,
        experiment_id: &str,
        identity: &str,
        init: impl FnOnce() -> Arc<ExperimentAssignment>,
    ) -> (Arc<ExperimentAssignment>, bool) {
        let entry = self
            .entries
            .entry(CacheKey::new(experiment_id, identity))
            .or_insert_with(init);
        let inserted = entry.is_fresh();
        (entry.into_value(), inserted)
    }

    /// Drop every entry belonging to `experiment_id`. Returns the number of removed entries.
    pub fn invalidate_experiment(&self, experiment_id: &str) -> usize {
        let mut removed = 0;
        for (key, _) in &self.entries {
            if key.experiment_id == experiment_id {
                self.entries.invalidate(&*key);
                removed += 1;
            }
        }
        removed
    }

    /// Evict expired entries and enforce the capacity bound now instead of lazily. Returns the
    /// number of live entries left.
    pub fn sweep(&self) -> u64 {
        self.entries.run_pending_tasks();
        let live = self.entries.entry_count();
        log::debug!(target: "experiments", live; "swept assignment cache");
        live
    }

    /// Number of live entries. Runs pending maintenance first.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        time::Duration,
    };

    use chrono::Utc;
    use serde_json::Map;
    use uuid::Uuid;

    use super::AssignmentCache;
    use crate::{AssignmentReason, ExperimentAssignment};

    fn assignment(experiment_id: &str, session_id: &str) -> Arc<ExperimentAssignment> {
        Arc::new(ExperimentAssignment {
            id: Uuid::new_v4(),
            experiment_id: experiment_id.into(),
            session_id: session_id.into(),
            user_id: None,
            device_id: None,
            variant_id: "a".into(),
            variant_name: "A".into(),
            variant_config: Map::new(),
            assigned_at: Utc::now(),
            assignment_reason: AssignmentReason::UniformAllocation,
            is_consistent: true,
        })
    }

    #[test]
    fn get_returns_inserted_assignment() {
        let cache = AssignmentCache::new(Duration::from_secs(60), 100);
        let stored = assignment("exp", "s1");
        cache.insert("exp", "s1", stored.clone());

        assert_eq!(cache.get("exp", "s1").map(|a| a.id), Some(stored.id));
        assert!(cache.get("exp", "s2").is_none());
        assert!(cache.get("other", "s1").is_none());
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = AssignmentCache::new(Duration::from_millis(20), 100);
        cache.insert("exp", "s1", assignment("exp", "s1"));
        assert!(cache.get("exp", "s1").is_some());

        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("exp", "s1").is_none());
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let cache = AssignmentCache::new(Duration::from_millis(20), 100);
        for i in 0..10 {
            let session = format!("s{i}");
            cache.insert("exp", &session, assignment("exp", &session));
        }
        assert_eq!(cache.len(), 10);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.sweep(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = AssignmentCache::new(Duration::from_secs(60), 10);
        for i in 0..100 {
            let session = format!("s{i}");
            cache.insert("exp", &session, assignment("exp", &session));
        }
        assert!(cache.sweep() <= 10);
    }

    #[test]
    fn invalidate_experiment() {
        let cache = AssignmentCache::new(Duration::from_secs(60), 100);
        cache.insert("exp-1", "s1", assignment("exp-1", "s1"));
        cache.insert("exp-1", "s2", assignment("exp-1", "s2"));
        cache.insert("exp-2", "s1", assignment("exp-2", "s1"));

        assert_eq!(cache.invalidate_experiment("exp-1"), 2);
        assert!(cache.get("exp-1", "s1").is_none());
        assert!(cache.get("exp-2", "s1").is_some());
    }

    #[test]
    fn get_or_insert_keeps_first_value() {
        let cache = AssignmentCache::new(Duration::from_secs(60), 100);
        let first = assignment("exp", "s1");

        let (stored, inserted) = cache.get_or_insert_with("exp", "user_1", || first.clone());
        assert!(inserted);
        assert_eq!(stored.id, first.id);

        let (stored, inserted) =
            cache.get_or_insert_with("exp", "user_1", || assignment("exp", "s2"));
        assert!(!inserted);
        assert_eq!(stored.id, first.id);
    }

    #[test]
    fn concurrent_get_or_insert_stores_one_value() {
        const THREADS: usize = 8;

        let cache = Arc::new(AssignmentCache::new(Duration::from_secs(60), 1000));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|thread| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    (0..100)
                        .map(|user| {
                            let session = format!("t{thread}-s{user}");
                            let (stored, inserted) = cache
                                .get_or_insert_with("exp", &format!("user_{user}"), || {
                                    assignment("exp", &session)
                                });
                            (stored.id, inserted)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<_>> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        for user in 0..100 {
            let ids: Vec<_> = results.iter().map(|thread| thread[user].0).collect();
            assert!(ids.iter().all(|id| *id == ids[0]), "user_{user} diverged");
            let inserted = results.iter().filter(|thread| thread[user].1).count();
            assert_eq!(inserted, 1, "user_{user} stored more than once");
        }
    }
}
