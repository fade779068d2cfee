use std::sync::Arc;

use uuid::Uuid;

use crate::{
    backend::{BackendClient, VariantPerformance},
    context::Metadata,
    events::{EventStore, EventTracker, ExperimentEvent},
    experiment_store::{ExperimentStore, Snapshot},
    segments::SegmentEvaluator,
    statistics::{ExperimentStatistics, SampleSizeEstimate, SampleSizeRequest, StatisticsEngine},
    AssignmentEngine, EngineConfig, Error, Experiment, ExperimentAssignment, ExperimentContext,
    ExperimentResult, FeatureFlag, Result, UserSegment,
};

/// A client for prompt experiments.
///
/// Wires definition fetching, assignment, event tracking and statistics together and honours the
/// feature switches of [`EngineConfig`]. Definitions fetched from the backend are kept in an
/// [`ExperimentStore`] for `cache_ttl`.
///
/// # Examples
/// ```
/// # use prompt_experiments::{EngineConfig, ExperimentClient};
/// let client = ExperimentClient::new(EngineConfig::default().with_api_key("api-key")).unwrap();
/// ```
pub struct ExperimentClient {
    config: EngineConfig,
    backend: Arc<BackendClient>,
    store: ExperimentStore,
    engine: AssignmentEngine,
    tracker: EventTracker,
    segment_evaluator: SegmentEvaluator,
    statistics: StatisticsEngine,
}

impl ExperimentClient {
    /// Create a new `ExperimentClient` using the specified configuration. Events are posted to
    /// the backend.
    pub fn new(config: EngineConfig) -> Result<ExperimentClient> {
        let backend = Arc::new(BackendClient::new(&config)?);

        Ok(ExperimentClient {
            store: ExperimentStore::new(config.cache_ttl()),
            engine: AssignmentEngine::new(&config),
            tracker: EventTracker::new(backend.clone()),
            segment_evaluator: SegmentEvaluator::new(),
            statistics: StatisticsEngine::from_config(&config),
            backend,
            config,
        })
    }

    /// Record events into `store` instead of the backend.
    pub fn with_event_store(mut self, store: Arc<dyn EventStore>) -> ExperimentClient {
        self.tracker = EventTracker::new(store);
        self
    }

    /// Replace the assignment engine, e.g. to change the targeting policy or hashing.
    pub fn with_assignment_engine(mut self, engine: AssignmentEngine) -> ExperimentClient {
        self.engine = engine;
        self
    }

    #[allow(missing_docs)]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Definitions cache. Can be seeded directly when definitions come from elsewhere.
    pub fn store(&self) -> &ExperimentStore {
        &self.store
    }

    #[allow(missing_docs)]
    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    /// Running experiments of a prompt, from the store or else from the backend.
    pub async fn experiments_for_prompt(
        &self,
        prompt_id: &str,
        project_id: Option<&str>,
    ) -> Result<Arc<Snapshot<Experiment>>> {
        if let Some(snapshot) = self.store.experiments_for(prompt_id, project_id) {
            return Ok(snapshot);
        }

        let experiments = self
            .backend
            .list_experiments(prompt_id, project_id)
            .await
            .inspect_err(|err| {
                log::warn!(target: "experiments",
                           prompt_id;
                           "failed to fetch experiments: {:?}", err);
            })?;

        log::debug!(target: "experiments",
                    prompt_id,
                    count = experiments.len();
                    "fetched experiments");
        Ok(self.store.set_experiments(prompt_id, project_id, experiments))
    }

    /// Assign `context` to every running experiment of a prompt.
    ///
    /// Fails only if the experiments cannot be fetched, or with [`Error::FeatureDisabled`] when
    /// automatic assignment is switched off.
    pub async fn assign_prompt(
        &self,
        prompt_id: &str,
        project_id: Option<&str>,
        context: &ExperimentContext,
    ) -> Result<Vec<ExperimentAssignment>> {
        if !self.config.enable_automatic_assignment {
            return Err(Error::FeatureDisabled("automatic assignment"));
        }

        let experiments = self.experiments_for_prompt(prompt_id, project_id).await?;

        let mut assignments = Vec::new();
        for experiment in experiments.items().iter().filter(|e| e.is_running()) {
            assignments.push(self.assign(experiment, context).await);
        }
        Ok(assignments)
    }

    /// Assign `context` to a variant of `experiment` and, when event tracking is enabled, record
    /// an assignment event.
    ///
    /// Never fails: tracking errors are logged and the assignment is still returned.
    pub async fn assign(
        &self,
        experiment: &Experiment,
        context: &ExperimentContext,
    ) -> ExperimentAssignment {
        let assignment = self.engine.assign(experiment, context);

        if self.config.enable_event_tracking {
            // The tracker has already logged the failure.
            let _ = self.tracker.track_assignment(&assignment).await;
        }

        assignment
    }

    /// Record `event`.
    pub async fn track_event(&self, event: ExperimentEvent) -> Result<ExperimentEvent> {
        self.ensure_tracking()?;
        self.tracker.track(event).await
    }

    /// Record a successful conversion for `assignment_id`.
    pub async fn track_conversion(
        &self,
        experiment_id: &str,
        assignment_id: Uuid,
        value: Option<f64>,
        metadata: Option<Metadata>,
    ) -> Result<ExperimentEvent> {
        self.ensure_tracking()?;
        self.tracker
            .track_conversion(experiment_id, assignment_id, value, metadata)
            .await
    }

    /// Fetch the backend's results for `experiment_id` and compute statistics at the experiment's
    /// confidence level.
    pub async fn calculate_results(&self, experiment_id: &str) -> Result<ExperimentStatistics> {
        self.ensure_result_calculation()?;

        let experiment = match self.store.experiment(experiment_id) {
            Some(experiment) => experiment,
            None => self.backend.get_experiment(experiment_id).await?,
        };
        let results = self.backend.get_results(experiment_id).await?;

        self.calculate_statistics(&experiment, &results)
    }

    /// Compute statistics for `experiment` from already aggregated `results`.
    pub fn calculate_statistics(
        &self,
        experiment: &Experiment,
        results: &[ExperimentResult],
    ) -> Result<ExperimentStatistics> {
        self.ensure_result_calculation()?;

        let statistics = self
            .statistics
            .for_experiment(experiment)
            .calculate_experiment_statistics(results)?;
        Ok(statistics)
    }

    /// Compute statistics for `experiment` from raw assignments and events.
    pub fn calculate_local_results(
        &self,
        experiment: &Experiment,
        assignments: &[ExperimentAssignment],
        events: &[ExperimentEvent],
    ) -> Result<ExperimentStatistics> {
        let results = ExperimentResult::from_events(experiment, assignments, events);
        self.calculate_statistics(experiment, &results)
    }

    /// Size an experiment at the configured daily traffic.
    pub fn required_sample_size(&self, request: &SampleSizeRequest) -> Result<SampleSizeEstimate> {
        self.statistics.required_sample_size(request)
    }

    /// `GET /experiments/{id}/performance`, passed through.
    pub async fn performance(&self, experiment_id: &str) -> Result<Vec<VariantPerformance>> {
        self.backend.get_performance(experiment_id).await
    }

    /// User segments, from the store or else from the backend.
    pub async fn user_segments(&self) -> Result<Arc<Snapshot<UserSegment>>> {
        if let Some(snapshot) = self.store.segments() {
            return Ok(snapshot);
        }
        let segments = self.backend.list_user_segments().await?;
        Ok(self.store.set_segments(segments))
    }

    /// Ids of the active segments `context` belongs to.
    pub async fn matching_segments(&self, context: &ExperimentContext) -> Result<Vec<String>> {
        let segments = self.user_segments().await?;
        Ok(self
            .segment_evaluator
            .matching_segments(segments.items(), context)
            .into_iter()
            .map(str::to_owned)
            .collect())
    }

    /// Feature flags, from the store or else from the backend.
    pub async fn feature_flags(&self) -> Result<Arc<Snapshot<FeatureFlag>>> {
        if let Some(snapshot) = self.store.feature_flags() {
            return Ok(snapshot);
        }
        let flags = self.backend.list_feature_flags().await?;
        Ok(self.store.set_feature_flags(flags))
    }

    /// Whether the flag named `flag_name` is on for `context`. Unknown flags are off.
    pub async fn is_feature_enabled(
        &self,
        flag_name: &str,
        context: &ExperimentContext,
    ) -> Result<bool> {
        let flags = self.feature_flags().await?;
        let Some(flag) = flags.items().iter().find(|flag| flag.name == flag_name) else {
            log::debug!(target: "experiments", flag_name; "unknown feature flag");
            return Ok(false);
        };

        if flag.target_segments.is_empty() {
            return Ok(flag.is_enabled);
        }
        let segments = self.user_segments().await?;
        Ok(flag.is_enabled_for(segments.items(), &self.segment_evaluator, context))
    }

    /// Forget cached assignments of `experiment_id`, e.g. after it was edited.
    pub fn invalidate_experiment(&self, experiment_id: &str) {
        self.engine.invalidate_experiment(experiment_id);
    }

    /// Evict expired cache entries. Returns the number of live cached assignments.
    pub fn sweep(&self) -> u64 {
        self.engine.sweep()
    }

    fn ensure_tracking(&self) -> Result<()> {
        if self.config.enable_event_tracking {
            Ok(())
        } else {
            Err(Error::FeatureDisabled("event tracking"))
        }
    }

    fn ensure_result_calculation(&self) -> Result<()> {
        if self.config.enable_result_calculation {
            Ok(())
        } else {
            Err(Error::FeatureDisabled("result calculation"))
        }
    }
}
