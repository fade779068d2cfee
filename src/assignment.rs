//! Deterministic variant assignment.
//!
//! The assignment key (a SHA-256 of the experiment and identity fields) is the only source of
//! randomness, so the same inputs produce the same variant in every process. The cache only
//! saves recomputation and carries sticky state.
use std::sync::Arc;

use serde_json::json;

use crate::{
    assignment_cache::AssignmentCache,
    error::AssignmentError,
    sharder::{bucket_for, canonical_json, Bucket, Md5Sharder, Sha256Sharder, Sharder},
    targeting::TargetingEvaluator,
    AllocationStrategy, AssignmentReason, EngineConfig, Experiment, ExperimentAssignment,
    ExperimentContext, ExperimentVariant,
};

const ASSIGNMENT_KEY_LEN: usize = 16;

/// Assigns contexts to experiment variants.
///
/// `AssignmentEngine` is `Sync` and is meant to be shared between request handlers.
pub struct AssignmentEngine {
    targeting: TargetingEvaluator,
    identity_sharder: Box<dyn Sharder + Send + Sync>,
    attribute_sharder: Box<dyn Sharder + Send + Sync>,
    session_cache: AssignmentCache,
    sticky_cache: AssignmentCache,
    assignment_consistency: bool,
}

impl AssignmentEngine {
    /// Create an engine with SHA-256 assignment keys and MD5 geographic/attribute buckets.
    pub fn new(config: &EngineConfig) -> AssignmentEngine {
        AssignmentEngine {
            targeting: TargetingEvaluator::new(),
            identity_sharder: Box::new(Sha256Sharder),
            attribute_sharder: Box::new(Md5Sharder),
            session_cache: AssignmentCache::new(config.session_timeout(), config.cache_capacity),
            sticky_cache: AssignmentCache::new(config.cache_ttl(), config.cache_capacity),
            assignment_consistency: config.assignment_consistency,
        }
    }

    /// Replace the targeting evaluator (e.g., to change its error policy).
    pub fn with_targeting(mut self, targeting: TargetingEvaluator) -> AssignmentEngine {
        self.targeting = targeting;
        self
    }

    /// Replace the hash functions used for the assignment key and for geographic/attribute
    /// buckets.
    pub fn with_sharders(
        mut self,
        identity_sharder: impl Sharder + Send + Sync + 'static,
        attribute_sharder: impl Sharder + Send + Sync + 'static,
    ) -> AssignmentEngine {
        self.identity_sharder = Box::new(identity_sharder);
        self.attribute_sharder = Box::new(attribute_sharder);
        self
    }

    /// Assign `context` to a variant of `experiment`.
    ///
    /// Never fails: if the computation itself errors, the control variant is returned with
    /// [`AssignmentReason::ErrorFallback`].
    pub fn assign(
        &self,
        experiment: &Experiment,
        context: &ExperimentContext,
    ) -> ExperimentAssignment {
        if self.assignment_consistency && experiment.is_running() {
            let (assignment, computed) = self.session_cache.get_or_insert_with(
                &experiment.id,
                &context.session_id,
                || Arc::new(self.compute_or_control(experiment, context)),
            );
            if !computed {
                log::trace!(target: "experiments",
                            experiment_id:display = experiment.id,
                            session_id:display = context.session_id,
                            variant_id:display = assignment.variant_id;
                            "reusing session assignment");
            }
            return ExperimentAssignment::clone(&assignment);
        }

        let assignment = self.compute_or_control(experiment, context);
        self.session_cache.insert(
            &experiment.id,
            &context.session_id,
            Arc::new(assignment.clone()),
        );
        assignment
    }

    fn compute_or_control(
        &self,
        experiment: &Experiment,
        context: &ExperimentContext,
    ) -> ExperimentAssignment {
        let assignment = self.compute(experiment, context).unwrap_or_else(|err| {
            log::warn!(target: "experiments",
                       experiment_id:display = experiment.id,
                       session_id:display = context.session_id;
                       "error computing assignment, falling back to control: {}", err);
            control(experiment, context, AssignmentReason::ErrorFallback)
        });

        log::trace!(target: "experiments",
                    experiment_id:display = assignment.experiment_id,
                    session_id:display = assignment.session_id,
                    variant_id:display = assignment.variant_id,
                    reason = assignment.assignment_reason.as_str();
                    "assigned variant");

        assignment
    }

    /// Cached session assignment, if any.
    pub fn cached_assignment(
        &self,
        experiment_id: &str,
        session_id: &str,
    ) -> Option<Arc<ExperimentAssignment>> {
        self.session_cache.get(experiment_id, session_id)
    }

    /// Forget all session and sticky assignments of `experiment_id`.
    pub fn invalidate_experiment(&self, experiment_id: &str) {
        let removed = self.session_cache.invalidate_experiment(experiment_id)
            + self.sticky_cache.invalidate_experiment(experiment_id);
        log::debug!(target: "experiments",
                    experiment_id,
                    removed;
                    "invalidated cached assignments");
    }

    /// Evict expired cache entries. Returns the number of live cached assignments.
    pub fn sweep(&self) -> u64 {
        self.session_cache.sweep() + self.sticky_cache.sweep()
    }

    /// 16-hex-character key derived from the experiment and identity fields.
    pub(crate) fn assignment_key(
        &self,
        experiment: &Experiment,
        context: &ExperimentContext,
    ) -> Result<String, AssignmentError> {
        let input = json!({
            "experiment_id": experiment.id,
            "session_id": context.session_id,
            "user_id": context.user_id.as_deref().unwrap_or("anonymous"),
            "device_id": context.device_id.as_deref().unwrap_or("unknown"),
        });
        let bytes =
            canonical_json(&input).map_err(|err| AssignmentError::HashInput(err.to_string()))?;

        let mut key = self.identity_sharder.hex_digest(&bytes);
        if key.len() < ASSIGNMENT_KEY_LEN {
            return Err(AssignmentError::ShortDigest);
        }
        key.truncate(ASSIGNMENT_KEY_LEN);
        Ok(key)
    }

    fn compute(
        &self,
        experiment: &Experiment,
        context: &ExperimentContext,
    ) -> Result<ExperimentAssignment, AssignmentError> {
        let key = self.assignment_key(experiment, context)?;

        if !self.targeting.matches(experiment, context) {
            return Ok(control(
                experiment,
                context,
                AssignmentReason::TargetingCriteriaNotMet,
            ));
        }

        let bucket = Bucket::from_hex(&key).ok_or(AssignmentError::ShortDigest)?;
        if !bucket.admitted(experiment.traffic_percentage) {
            return Ok(control(experiment, context, AssignmentReason::ControlFallback));
        }

        let (variant, reason) = match experiment.allocation_strategy {
            AllocationStrategy::Uniform => (
                uniform(experiment, bucket),
                AssignmentReason::UniformAllocation,
            ),
            AllocationStrategy::Weighted => weighted(experiment, bucket),
            AllocationStrategy::Sticky => return Ok(self.sticky(experiment, context, bucket)),
            AllocationStrategy::Geographic => match context.location() {
                None => (&experiment.control_variant, AssignmentReason::NoLocationData),
                Some(location) => {
                    let key = location.bucket_key();
                    let digest = self.attribute_sharder.hex_digest(key.as_bytes());
                    let geo_bucket =
                        Bucket::from_hex(&digest).ok_or(AssignmentError::ShortDigest)?;
                    hashed(experiment, geo_bucket, AssignmentReason::GeographicAllocation)
                }
            },
            AllocationStrategy::UserAttribute => match context.user_attributes() {
                None => (&experiment.control_variant, AssignmentReason::NoUserAttributes),
                Some(attributes) => {
                    let attribute_bucket =
                        bucket_for(self.attribute_sharder.as_ref(), attributes)?;
                    hashed(
                        experiment,
                        attribute_bucket,
                        AssignmentReason::UserAttributeAllocation,
                    )
                }
            },
        };

        Ok(ExperimentAssignment::new(experiment, context, variant, reason))
    }

    fn sticky(
        &self,
        experiment: &Experiment,
        context: &ExperimentContext,
        bucket: Bucket,
    ) -> ExperimentAssignment {
        let Some(user_id) = &context.user_id else {
            let (variant, _) = weighted(experiment, bucket);
            return ExperimentAssignment::new(
                experiment,
                context,
                variant,
                AssignmentReason::StickyNew,
            );
        };

        let (assignment, inserted) = self.sticky_cache.get_or_insert_with(
            &experiment.id,
            user_id,
            || {
                let (variant, _) = weighted(experiment, bucket);
                let reason = AssignmentReason::StickyNew;
                Arc::new(ExperimentAssignment::new(experiment, context, variant, reason))
            },
        );
        if inserted {
            ExperimentAssignment::clone(&assignment)
        } else {
            ExperimentAssignment {
                assignment_reason: AssignmentReason::StickyCached,
                ..ExperimentAssignment::clone(&assignment)
            }
        }
    }
}

fn control(
    experiment: &Experiment,
    context: &ExperimentContext,
    reason: AssignmentReason,
) -> ExperimentAssignment {
    ExperimentAssignment::new(experiment, context, &experiment.control_variant, reason)
}

fn uniform(experiment: &Experiment, bucket: Bucket) -> &ExperimentVariant {
    let variants: Vec<&ExperimentVariant> = experiment.variants().collect();
    variants[bucket.index(variants.len())]
}

/// Walk variants in allocation order until the cumulative weight reaches the bucket's share of
/// the total weight.
fn weighted(experiment: &Experiment, bucket: Bucket) -> (&ExperimentVariant, AssignmentReason) {
    let total_weight: f64 = experiment.variants().map(|v| v.weight as f64).sum();
    let target = bucket.fraction() * total_weight;

    let mut accumulated = 0.0;
    for variant in experiment.variants() {
        accumulated += variant.weight as f64;
        if accumulated >= target {
            return (variant, AssignmentReason::WeightedAllocation);
        }
    }

    (&experiment.control_variant, AssignmentReason::WeightedFallback)
}

/// Geographic and user-attribute allocation: re-apply the traffic gate with the attribute
/// bucket, then pick a variant by index.
fn hashed(
    experiment: &Experiment,
    bucket: Bucket,
    reason: AssignmentReason,
) -> (&ExperimentVariant, AssignmentReason) {
    if !bucket.admitted(experiment.traffic_percentage) {
        return (&experiment.control_variant, AssignmentReason::ControlFallback);
    }
    (uniform(experiment, bucket), reason)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Barrier};

    use serde_json::json;

    use super::*;
    use crate::{
        experiment::tests::experiment, targeting::TargetingErrorPolicy, ExperimentStatus,
        TargetAudience,
    };

    fn engine() -> AssignmentEngine {
        AssignmentEngine::new(&EngineConfig::default())
    }

    fn context() -> ExperimentContext {
        ExperimentContext::new("session-1")
            .with_user_id("user_1")
            .with_device_id("device-1")
    }

    #[test]
    fn assignment_key_matches_reference_value() {
        let exp = experiment(AllocationStrategy::Uniform);
        let engine = engine();

        assert_eq!(
            engine.assignment_key(&exp, &context()).unwrap(),
            "8b3aab8837ef0464"
        );
        assert_eq!(
            engine
                .assignment_key(&exp, &ExperimentContext::new("session-1"))
                .unwrap(),
            "7a5bc1755bf2cd61"
        );
    }

    #[test]
    fn uniform_and_weighted_reference_buckets() {
        // hash_value = 0x8b3aab88 = 2335878024, 54.39% of the hash space.
        let assignment = engine().assign(&experiment(AllocationStrategy::Uniform), &context());
        assert_eq!(assignment.variant_id, "control");
        assert_eq!(assignment.assignment_reason, AssignmentReason::UniformAllocation);

        // Weights 1/1/2: target = 0.5439 * 4 = 2.18, crossed by the third variant.
        let assignment = engine().assign(&experiment(AllocationStrategy::Weighted), &context());
        assert_eq!(assignment.variant_id, "b");
        assert_eq!(assignment.assignment_reason, AssignmentReason::WeightedAllocation);
        assert!(assignment.is_consistent);
    }

    #[test]
    fn assignment_is_deterministic_without_cache() {
        let exp = experiment(AllocationStrategy::Weighted);
        for i in 0..50 {
            let ctx = ExperimentContext::new(format!("session-{i}"));
            let a = engine().assign(&exp, &ctx);
            let b = engine().assign(&exp, &ctx);
            assert_eq!(a.variant_id, b.variant_id);
            assert_ne!(a.id, b.id);
        }
    }

    #[test]
    fn warm_cache_returns_same_assignment() {
        let exp = experiment(AllocationStrategy::Uniform);
        let engine = engine();
        let first = engine.assign(&exp, &context());
        let second = engine.assign(&exp, &context());
        assert_eq!(first, second);
        assert_eq!(
            engine.cached_assignment(&exp.id, "session-1").map(|a| a.id),
            Some(first.id)
        );
    }

    #[test]
    fn consistency_disabled_recomputes() {
        let exp = experiment(AllocationStrategy::Uniform);
        let engine =
            AssignmentEngine::new(&EngineConfig::default().with_assignment_consistency(false));
        let first = engine.assign(&exp, &context());
        let second = engine.assign(&exp, &context());
        assert_eq!(first.variant_id, second.variant_id);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn zero_traffic_always_yields_control() {
        let mut exp = experiment(AllocationStrategy::Uniform);
        exp.traffic_percentage = 0.0;
        for i in 0..200 {
            let assignment = engine().assign(&exp, &ExperimentContext::new(format!("s{i}")));
            assert_eq!(assignment.variant_id, "control");
            assert_eq!(assignment.assignment_reason, AssignmentReason::ControlFallback);
        }
    }

    #[test]
    fn full_traffic_never_falls_back() {
        let exp = experiment(AllocationStrategy::Uniform);
        for i in 0..200 {
            let assignment = engine().assign(&exp, &ExperimentContext::new(format!("s{i}")));
            assert_ne!(assignment.assignment_reason, AssignmentReason::ControlFallback);
        }
    }

    #[test]
    fn traffic_gate_uses_hash_percentage() {
        let mut exp = experiment(AllocationStrategy::Uniform);
        // Reference context sits at 54.39%.
        exp.traffic_percentage = 54.0;
        assert_eq!(
            engine().assign(&exp, &context()).assignment_reason,
            AssignmentReason::ControlFallback
        );
        exp.traffic_percentage = 55.0;
        assert_eq!(
            engine().assign(&exp, &context()).assignment_reason,
            AssignmentReason::UniformAllocation
        );
    }

    #[test]
    fn weighted_proportions() {
        let exp = experiment(AllocationStrategy::Weighted);
        let engine = AssignmentEngine::new(
            &EngineConfig::default()
                .with_assignment_consistency(false)
                .with_cache_capacity(16),
        );

        let total = 100_000;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..total {
            let ctx = ExperimentContext::new(format!("session-{i}"));
            let assignment = engine.assign(&exp, &ctx);
            *counts.entry(assignment.variant_id).or_default() += 1;
        }

        let share = |id: &str| counts.get(id).copied().unwrap_or(0) as f64 / total as f64;
        assert!((share("control") - 0.25).abs() < 0.02, "control: {}", share("control"));
        assert!((share("a") - 0.25).abs() < 0.02, "a: {}", share("a"));
        assert!((share("b") - 0.50).abs() < 0.02, "b: {}", share("b"));
    }

    #[test]
    fn sticky_is_stable_across_sessions() {
        let exp = experiment(AllocationStrategy::Sticky);
        let engine = engine();

        let first = engine.assign(&exp, &ExperimentContext::new("s-1").with_user_id("user_7"));
        assert_eq!(first.assignment_reason, AssignmentReason::StickyNew);

        for i in 2..50 {
            let ctx = ExperimentContext::new(format!("s-{i}")).with_user_id("user_7");
            let next = engine.assign(&exp, &ctx);
            assert_eq!(next.variant_id, first.variant_id);
            assert_eq!(next.id, first.id);
            assert_eq!(next.assignment_reason, AssignmentReason::StickyCached);
        }
    }

    #[test]
    fn sticky_is_stable_across_concurrent_sessions() {
        const USERS: usize = 200;

        let exp = Arc::new(experiment(AllocationStrategy::Sticky));
        let engine = Arc::new(engine());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|thread| {
                let (exp, engine, barrier) = (exp.clone(), engine.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    (0..USERS)
                        .map(|user| {
                            let ctx = ExperimentContext::new(format!("t{thread}-s{user}"))
                                .with_user_id(format!("user_{user}"));
                            engine.assign(&exp, &ctx)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut results = handles.into_iter().map(|handle| handle.join().unwrap());
        let (first, second) = (results.next().unwrap(), results.next().unwrap());

        let divergent = first
            .iter()
            .zip(&second)
            .filter(|(a, b)| a.variant_id != b.variant_id)
            .count();
        assert_eq!(divergent, 0);

        let computed = first
            .iter()
            .chain(&second)
            .filter(|a| a.assignment_reason == AssignmentReason::StickyNew)
            .count();
        assert_eq!(computed, USERS, "one computed assignment per user");
    }

    #[test]
    fn concurrent_calls_share_session_assignment() {
        let exp = Arc::new(experiment(AllocationStrategy::Uniform));
        let engine = Arc::new(engine());
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (exp, engine, barrier) = (exp.clone(), engine.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    engine.assign(&exp, &ExperimentContext::new("session-shared")).id
                })
            })
            .collect();
        let ids: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[test]
    fn sticky_first_assignment_uses_weighted_bucket() {
        let exp = experiment(AllocationStrategy::Sticky);
        let assignment = engine().assign(&exp, &context());
        // Same bucket as the weighted reference case.
        assert_eq!(assignment.variant_id, "b");

        let anonymous = engine().assign(&exp, &ExperimentContext::new("anon"));
        assert_eq!(anonymous.assignment_reason, AssignmentReason::StickyNew);
    }

    #[test]
    fn uniform_differs_across_sessions() {
        let exp = experiment(AllocationStrategy::Uniform);
        let engine = engine();
        let variants: std::collections::HashSet<String> = (0..50)
            .map(|i| {
                let ctx = ExperimentContext::new(format!("s-{i}")).with_user_id("user_7");
                engine.assign(&exp, &ctx).variant_id
            })
            .collect();
        assert!(variants.len() > 1);
    }

    #[test]
    fn geographic_allocation() {
        let exp = experiment(AllocationStrategy::Geographic);
        let ctx =
            context().with_metadata_entry("location", json!({"country": "US", "region": "CA"}));
        // md5("US_CA") starts with 0x7b64b48b = 2070197387; 2070197387 mod 3 = 2.
        let assignment = engine().assign(&exp, &ctx);
        assert_eq!(assignment.variant_id, "b");
        assert_eq!(assignment.assignment_reason, AssignmentReason::GeographicAllocation);

        let assignment = engine().assign(&exp, &context());
        assert_eq!(assignment.variant_id, "control");
        assert_eq!(assignment.assignment_reason, AssignmentReason::NoLocationData);
    }

    #[test]
    fn geographic_reapplies_traffic_gate() {
        let mut exp = experiment(AllocationStrategy::Geographic);
        // The identity bucket (47.80%) passes a 48% gate, the geo bucket (48.20%) does not.
        exp.traffic_percentage = 48.0;
        let ctx = ExperimentContext::new("session-1")
            .with_metadata_entry("location", json!({"country": "US", "region": "CA"}));
        let assignment = engine().assign(&exp, &ctx);
        assert_eq!(assignment.variant_id, "control");
        assert_eq!(assignment.assignment_reason, AssignmentReason::ControlFallback);
    }

    #[test]
    fn user_attribute_allocation() {
        let exp = experiment(AllocationStrategy::UserAttribute);
        let ctx = context()
            .with_metadata_entry("user_attributes", json!({"plan": "pro", "age": 30}));
        // md5('{"age": 30, "plan": "pro"}') starts with 0xc0e6b632; 3236345394 mod 3 = 0.
        let assignment = engine().assign(&exp, &ctx);
        assert_eq!(assignment.variant_id, "control");
        assert_eq!(assignment.assignment_reason, AssignmentReason::UserAttributeAllocation);

        // Key order in the context does not matter.
        let reordered = ExperimentContext::new("other-session")
            .with_metadata_entry("user_attributes", json!({"age": 30, "plan": "pro"}));
        assert_eq!(engine().assign(&exp, &reordered).variant_id, assignment.variant_id);

        let assignment = engine().assign(&exp, &context());
        assert_eq!(assignment.assignment_reason, AssignmentReason::NoUserAttributes);
    }

    #[test]
    fn targeting_failure_assigns_control() {
        let mut exp = experiment(AllocationStrategy::Uniform);
        exp.target_audience = Some(TargetAudience {
            min_user_id: Some(10),
            ..Default::default()
        });
        let assignment = engine().assign(&exp, &context());
        assert_eq!(assignment.variant_id, "control");
        assert_eq!(assignment.assignment_reason, AssignmentReason::TargetingCriteriaNotMet);

        let engine = engine().with_targeting(TargetingEvaluator::with_policy(
            TargetingErrorPolicy::FailClosed,
        ));
        let ctx = ExperimentContext::new("s").with_user_id("no-number");
        assert_eq!(
            engine.assign(&exp, &ctx).assignment_reason,
            AssignmentReason::TargetingCriteriaNotMet
        );
    }

    #[test]
    fn broken_sharder_falls_back_to_control() {
        struct Truncated;
        impl Sharder for Truncated {
            fn digest(&self, _input: &[u8]) -> Vec<u8> {
                vec![0xab]
            }
        }

        let engine = engine().with_sharders(Truncated, Md5Sharder);
        let assignment = engine.assign(&experiment(AllocationStrategy::Uniform), &context());
        assert_eq!(assignment.variant_id, "control");
        assert_eq!(assignment.assignment_reason, AssignmentReason::ErrorFallback);
    }

    #[test]
    fn paused_experiment_is_not_served_from_cache() {
        let mut exp = experiment(AllocationStrategy::Uniform);
        let engine = engine();
        let first = engine.assign(&exp, &context());

        exp.status = ExperimentStatus::Paused;
        let second = engine.assign(&exp, &context());
        assert_eq!(first.variant_id, second.variant_id);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn invalidate_experiment_clears_sticky_state() {
        let exp = experiment(AllocationStrategy::Sticky);
        let engine = engine();
        let first = engine.assign(&exp, &ExperimentContext::new("s-1").with_user_id("user_7"));
        engine.invalidate_experiment(&exp.id);

        let second = engine.assign(&exp, &ExperimentContext::new("s-1").with_user_id("user_7"));
        assert_eq!(second.assignment_reason, AssignmentReason::StickyNew);
        assert_eq!(second.variant_id, first.variant_id);
    }
}
